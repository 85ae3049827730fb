// Table definitions for the registry database. Kept in sync with the SQL in
// migrations/.

diesel::table! {
    devices (id) {
        id -> Integer,
        device_token -> Text,
        device_label -> Nullable<Text>,
        longitude -> Double,
        latitude -> Double,
        exposure -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    streams (id) {
        id -> Integer,
        uuid -> Text,
        device_id -> Integer,
        community_id -> Text,
        public_key -> Text,
        token -> Binary,
        operations -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    certificates (key) {
        key -> Text,
        certificate -> Binary,
    }
}

diesel::joinable!(streams -> devices (device_id));

diesel::allow_tables_to_appear_in_same_query!(devices, streams);
