use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::Serialize;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::EncodeError;
use crate::token;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 24;

/// The triple bound into every envelope as authenticated associated data.
#[derive(Debug, Clone, Serialize)]
pub struct KeyMaterial {
    pub device_token: String,
    pub community_id: String,
    pub community_public_key: String,
}

/// Encryptor produces a ciphertext envelope binding the key material to the
/// plaintext document. Treated as an opaque primitive by the pipeline: it
/// either succeeds or fails with `EncryptionFailed`.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key_material: &KeyMaterial) -> Result<Vec<u8>, EncodeError>;
}

/// Envelope encryption toward the community public key: an ephemeral X25519
/// exchange against the recipient key, SHA-256 over the shared secret and
/// both public keys as the content key, then XChaCha20-Poly1305 with the
/// serialized key material as associated data.
///
/// Envelope layout: `ephemeral_pk (32) || nonce (24) || ciphertext`.
pub struct EnvelopeEncryptor;

impl EnvelopeEncryptor {
    pub fn new() -> EnvelopeEncryptor {
        EnvelopeEncryptor
    }
}

impl Default for EnvelopeEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Encryptor for EnvelopeEncryptor {
    fn encrypt(&self, plaintext: &[u8], key_material: &KeyMaterial) -> Result<Vec<u8>, EncodeError> {
        let recipient = decode_public_key(&key_material.community_public_key)?;

        let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pk = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);

        let key = derive_key(shared.as_bytes(), ephemeral_pk.as_bytes(), recipient.as_bytes());
        let aad = encode_aad(key_material)?;

        let nonce = token::generate_random_bytes(NONCE_LENGTH)
            .map_err(|e| EncodeError::EncryptionFailed(e.to_string()))?;

        let cipher = XChaCha20Poly1305::new((&key).into());
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| EncodeError::EncryptionFailed(e.to_string()))?;

        let mut envelope = Vec::with_capacity(KEY_LENGTH + NONCE_LENGTH + ciphertext.len());
        envelope.extend_from_slice(ephemeral_pk.as_bytes());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);

        Ok(envelope)
    }
}

/// Open an envelope with the recipient's secret key. The service itself never
/// decrypts; this is the counterpart recipients run, kept here so the tests
/// can verify what actually went over the wire.
pub fn open_envelope(
    secret_key: &[u8; 32],
    key_material: &KeyMaterial,
    envelope: &[u8],
) -> Result<Vec<u8>, EncodeError> {
    if envelope.len() <= KEY_LENGTH + NONCE_LENGTH {
        return Err(EncodeError::EncryptionFailed(
            "envelope too short".to_string(),
        ));
    }

    let (ephemeral_pk_bytes, rest) = envelope.split_at(KEY_LENGTH);
    let (nonce, ciphertext) = rest.split_at(NONCE_LENGTH);

    let mut pk = [0u8; KEY_LENGTH];
    pk.copy_from_slice(ephemeral_pk_bytes);
    let ephemeral_pk = PublicKey::from(pk);

    let secret = StaticSecret::from(*secret_key);
    let recipient_pk = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&ephemeral_pk);

    let key = derive_key(shared.as_bytes(), ephemeral_pk.as_bytes(), recipient_pk.as_bytes());
    let aad = encode_aad(key_material)?;

    let cipher = XChaCha20Poly1305::new((&key).into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|e| EncodeError::EncryptionFailed(e.to_string()))
}

fn decode_public_key(encoded: &str) -> Result<PublicKey, EncodeError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| EncodeError::EncryptionFailed(format!("invalid public key: {}", e)))?;

    if bytes.len() != KEY_LENGTH {
        return Err(EncodeError::EncryptionFailed(format!(
            "invalid public key length: {}",
            bytes.len()
        )));
    }

    let mut pk = [0u8; KEY_LENGTH];
    pk.copy_from_slice(&bytes);
    Ok(PublicKey::from(pk))
}

fn derive_key(shared: &[u8; 32], ephemeral_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral_pk);
    hasher.update(recipient_pk);
    hasher.finalize().into()
}

fn encode_aad(key_material: &KeyMaterial) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(key_material)
        .map_err(|e| EncodeError::EncryptionFailed(format!("failed to encode header: {}", e)))
}
