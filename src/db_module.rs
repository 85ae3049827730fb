use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::EncodeError;
use crate::models::{
    CreatedStream, Device, DeviceRow, Exposure, NewDeviceRow, NewStream, NewStreamRow, Stream,
};
use crate::schema::{certificates, devices, streams};
use crate::token::{self, TOKEN_LENGTH};

// Embed SQL in binary
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const NONCE_LENGTH: usize = 24;

/// Registry is the persistent, transactional home for devices, streams and
/// the certificate cache. Every public operation runs inside its own
/// transaction; each call either succeeds atomically or leaves state
/// unchanged.
///
/// Stream delete tokens are sealed at rest with XChaCha20-Poly1305 under a
/// key derived from the configured encryption password, so a registry dump
/// never exposes a usable token.
pub struct Registry {
    conn: Mutex<SqliteConnection>,
    token_key: [u8; 32],
}

impl Registry {
    /// Connect to the database identified by `database_url` and derive the
    /// at-rest token key from `encryption_password`.
    pub fn open(database_url: &str, encryption_password: &str) -> Result<Registry, EncodeError> {
        let mut conn = SqliteConnection::establish(database_url)?;
        conn.batch_execute("PRAGMA foreign_keys = ON;")
            .map_err(|e| EncodeError::Unavailable(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(encryption_password.as_bytes());

        Ok(Registry {
            conn: Mutex::new(conn),
            token_key: hasher.finalize().into(),
        })
    }

    /// Run all pending up migrations.
    pub fn migrate_up(&self) -> Result<(), EncodeError> {
        info!("migrating database up");
        let mut conn = self.conn.lock();
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| EncodeError::Internal(format!("failed to run migrations: {}", e)))?;
        Ok(())
    }

    /// Insert records for the given stream. The device row is upserted by
    /// `device_token`, overwriting the mutable fields; the stream row gets a
    /// fresh UUID and a fresh delete token. Returns `AlreadyRegistered` if a
    /// stream for this `(device, community)` pair already exists.
    ///
    /// The returned `CreatedStream` is the only place the plaintext token is
    /// ever handed out.
    pub fn create_stream(&self, new: &NewStream) -> Result<CreatedStream, EncodeError> {
        let mut conn = self.conn.lock();

        conn.transaction::<CreatedStream, EncodeError, _>(|conn| {
            let device_row = NewDeviceRow {
                device_token: &new.device.device_token,
                device_label: new.device.label.as_deref(),
                longitude: new.device.longitude,
                latitude: new.device.latitude,
                exposure: new.device.exposure.as_str(),
            };

            diesel::insert_into(devices::table)
                .values(&device_row)
                .on_conflict(devices::device_token)
                .do_update()
                .set((
                    devices::device_label.eq(new.device.label.as_deref()),
                    devices::longitude.eq(new.device.longitude),
                    devices::latitude.eq(new.device.latitude),
                    devices::exposure.eq(new.device.exposure.as_str()),
                ))
                .execute(conn)?;

            let device_id = devices::table
                .filter(devices::device_token.eq(&new.device.device_token))
                .select(devices::id)
                .first::<i32>(conn)?;

            let stream_id = Uuid::new_v4().to_string();
            let plain_token = token::generate_token(TOKEN_LENGTH)?;
            let sealed_token = self.seal_token(&plain_token)?;
            let operations = serde_json::to_string(&new.operations)
                .map_err(|e| EncodeError::Internal(format!("failed to encode operations: {}", e)))?;

            let stream_row = NewStreamRow {
                uuid: &stream_id,
                device_id,
                community_id: &new.community_id,
                public_key: &new.public_key,
                token: &sealed_token,
                operations: &operations,
            };

            diesel::insert_into(streams::table)
                .values(&stream_row)
                .execute(conn)?;

            Ok(CreatedStream {
                stream_id,
                token: plain_token,
            })
        })
    }

    /// Delete the stream identified by `stream_id`, authenticated by the
    /// plaintext delete token. A missing stream and a token mismatch are the
    /// same `NotFound`. If this was the last stream of its device the device
    /// row is deleted too and its token returned so the caller can
    /// unsubscribe.
    pub fn delete_stream(
        &self,
        stream_id: &str,
        delete_token: &str,
    ) -> Result<Option<String>, EncodeError> {
        let mut conn = self.conn.lock();

        conn.transaction::<Option<String>, EncodeError, _>(|conn| {
            let row = streams::table
                .filter(streams::uuid.eq(stream_id))
                .select((streams::id, streams::device_id, streams::token))
                .first::<(i32, i32, Vec<u8>)>(conn)
                .optional()?;

            let (row_id, device_id, sealed) = match row {
                Some(r) => r,
                None => return Err(EncodeError::NotFound),
            };

            let stored = self.open_token(&sealed)?;
            if stored != delete_token {
                return Err(EncodeError::NotFound);
            }

            diesel::delete(streams::table.filter(streams::id.eq(row_id))).execute(conn)?;

            let remaining = streams::table
                .filter(streams::device_id.eq(device_id))
                .count()
                .get_result::<i64>(conn)?;

            if remaining == 0 {
                let device_token = devices::table
                    .filter(devices::id.eq(device_id))
                    .select(devices::device_token)
                    .first::<String>(conn)?;

                diesel::delete(devices::table.filter(devices::id.eq(device_id)))
                    .execute(conn)?;

                return Ok(Some(device_token));
            }

            Ok(None)
        })
    }

    /// Load all devices. Used at startup to rebuild subscriptions, so streams
    /// are not populated.
    pub fn get_devices(&self) -> Result<Vec<Device>, EncodeError> {
        let mut conn = self.conn.lock();

        let rows = devices::table
            .select((
                devices::id,
                devices::device_token,
                devices::device_label,
                devices::longitude,
                devices::latitude,
                devices::exposure,
            ))
            .load::<DeviceRow>(&mut *conn)?;

        Ok(rows.into_iter().map(device_from_row).collect())
    }

    /// Load a single device by token, including all its streams and their
    /// operations, in one consistent snapshot. Called on every incoming MQTT
    /// message.
    pub fn get_device_by_token(&self, device_token: &str) -> Result<Device, EncodeError> {
        let mut conn = self.conn.lock();

        conn.transaction::<Device, EncodeError, _>(|conn| {
            let row = devices::table
                .filter(devices::device_token.eq(device_token))
                .select((
                    devices::id,
                    devices::device_token,
                    devices::device_label,
                    devices::longitude,
                    devices::latitude,
                    devices::exposure,
                ))
                .first::<DeviceRow>(conn)
                .optional()?;

            let row = match row {
                Some(r) => r,
                None => return Err(EncodeError::NotFound),
            };

            let stream_rows = streams::table
                .filter(streams::device_id.eq(row.id))
                .order(streams::id.asc())
                .select((streams::community_id, streams::public_key, streams::operations))
                .load::<(String, String, String)>(conn)?;

            let mut device = device_from_row(row);
            for (community_id, public_key, operations) in stream_rows {
                let operations = serde_json::from_str(&operations).map_err(|e| {
                    EncodeError::Internal(format!("failed to decode operations: {}", e))
                })?;

                device.streams.push(Stream {
                    community_id,
                    public_key,
                    operations,
                });
            }

            Ok(device)
        })
    }

    /// Count of stream rows, used for the stream gauge.
    pub fn count_streams(&self) -> Result<i64, EncodeError> {
        let mut conn = self.conn.lock();
        Ok(streams::table.count().get_result::<i64>(&mut *conn)?)
    }

    /// Verify the database connection is still alive.
    pub fn ping(&self) -> Result<(), EncodeError> {
        let mut conn = self.conn.lock();
        diesel::sql_query("SELECT 1")
            .execute(&mut *conn)
            .map_err(|e| EncodeError::Unavailable(e.to_string()))?;
        Ok(())
    }

    /// Read a certificate from the cache. An absent key is a `CacheMiss`.
    pub fn cert_get(&self, key: &str) -> Result<Vec<u8>, EncodeError> {
        let mut conn = self.conn.lock();

        let cert = certificates::table
            .filter(certificates::key.eq(key))
            .select(certificates::certificate)
            .first::<Vec<u8>>(&mut *conn)
            .optional()?;

        cert.ok_or(EncodeError::CacheMiss)
    }

    /// Write a certificate into the cache, replacing any existing value.
    pub fn cert_put(&self, key: &str, cert: &[u8]) -> Result<(), EncodeError> {
        let mut conn = self.conn.lock();

        diesel::insert_into(certificates::table)
            .values((
                certificates::key.eq(key),
                certificates::certificate.eq(cert),
            ))
            .on_conflict(certificates::key)
            .do_update()
            .set(certificates::certificate.eq(cert))
            .execute(&mut *conn)?;

        Ok(())
    }

    /// Remove a certificate from the cache.
    pub fn cert_delete(&self, key: &str) -> Result<(), EncodeError> {
        let mut conn = self.conn.lock();
        diesel::delete(certificates::table.filter(certificates::key.eq(key)))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn seal_token(&self, plain: &str) -> Result<Vec<u8>, EncodeError> {
        let cipher = XChaCha20Poly1305::new((&self.token_key).into());
        let nonce = token::generate_random_bytes(NONCE_LENGTH)?;

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plain.as_bytes())
            .map_err(|e| EncodeError::Internal(format!("failed to seal token: {}", e)))?;

        let mut out = nonce;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open_token(&self, sealed: &[u8]) -> Result<String, EncodeError> {
        if sealed.len() <= NONCE_LENGTH {
            return Err(EncodeError::Internal(
                "sealed token shorter than nonce".to_string(),
            ));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let cipher = XChaCha20Poly1305::new((&self.token_key).into());

        let plain = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| EncodeError::Internal(format!("failed to open token: {}", e)))?;

        String::from_utf8(plain)
            .map_err(|e| EncodeError::Internal(format!("sealed token is not utf-8: {}", e)))
    }
}

fn device_from_row(row: DeviceRow) -> Device {
    Device {
        id: row.id,
        device_token: row.device_token,
        label: row.device_label,
        longitude: row.longitude,
        latitude: row.latitude,
        exposure: Exposure::parse(&row.exposure),
        streams: Vec::new(),
    }
}
