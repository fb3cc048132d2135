//! Blob serialisation for bus message fields
//!
//! Arbitrary bytes embedded in an envelope field are base64-encoded, with
//! the `=` padding replaced by `[` so the blob cannot collide with the
//! `key=value` envelope syntax. Decoding reverses the substitution
//! byte-for-byte.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Replacement for the base64 `=` padding on the wire.
pub const PAD_CHAR: char = '[';

/// Encode bytes into a bus-safe blob.
pub fn serialize(data: &[u8]) -> String {
    STANDARD.encode(data).replace('=', "[")
}

/// Decode a bus-safe blob back into bytes.
pub fn deserialize(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.replace(PAD_CHAR, "="))
        .context("invalid base64 blob")
}

/// Encode a UTF-8 string (users file contents, hook scripts...).
pub fn serialize_str(data: &str) -> String {
    serialize(data.as_bytes())
}

/// Decode a blob that is expected to be UTF-8 text.
pub fn deserialize_str(data: &str) -> Result<String> {
    String::from_utf8(deserialize(data)?).context("blob is not valid UTF-8")
}

/// Encode a MIPS sample.
pub fn serialize_f64(value: f64) -> String {
    serialize_str(&value.to_string())
}

/// Decode a MIPS sample.
pub fn deserialize_f64(data: &str) -> Result<f64> {
    deserialize_str(data)?
        .parse()
        .context("blob is not a float")
}
