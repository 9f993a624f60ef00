//! Binary <-> hex conversion for key, IV and share bytes stored as catalog text.

use crate::error::{EdsError, Result};

/// Encode bytes as upper-case hex, the form the catalog attributes carry.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode a hex attribute value. Either case is accepted.
pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).map_err(|e| EdsError::Codec(format!("invalid hex value: {e}")))
}
