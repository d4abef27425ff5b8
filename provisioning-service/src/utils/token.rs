use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Bytes of OS randomness behind every token value (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Bytes behind a temporary credential handed out with an invitation.
pub const TEMP_CREDENTIAL_BYTES: usize = 18;

/// Generate an unguessable token value.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a temporary credential, independent of any token.
pub fn generate_temp_credential() -> String {
    let mut bytes = [0u8; TEMP_CREDENTIAL_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Storage key for a token value.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
