use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;

use crate::error::EncodeError;

/// Length in bytes of the security tokens we generate for streams.
pub const TOKEN_LENGTH: usize = 24;

/// Returns a cryptographically secure base64 encoded random string.
pub fn generate_token(n: usize) -> Result<String, EncodeError> {
    let bytes = generate_random_bytes(n)?;
    Ok(STANDARD.encode(bytes))
}

/// Returns a byte vector containing cryptographically secure random data.
pub fn generate_random_bytes(n: usize) -> Result<Vec<u8>, EncodeError> {
    let mut b = vec![0u8; n];
    rand::rngs::OsRng
        .try_fill_bytes(&mut b)
        .map_err(|e| EncodeError::Internal(format!("failed to read random bytes: {}", e)))?;
    Ok(b)
}
