//! The properties block: the structured header portion of a message.
//!
//! On the wire a message payload begins with a varint giving the block's
//! byte length, followed by the block itself: alternating NUL-terminated
//! key and value strings. A value may be empty but its NUL is required.
//! Duplicate keys are kept as written; lookups return the first match.

use blip_core::{ErrorKind, Result};

/// Encodes key/value pairs into a properties block (without the varint
/// length prefix, which belongs to the payload).
pub fn encode_block(pairs: &[(String, String)]) -> Vec<u8> {
    let mut block = Vec::new();
    for (key, value) in pairs {
        block.extend_from_slice(key.as_bytes());
        block.push(0);
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }
    block
}

/// Checks that a received block is a well-formed sequence of
/// NUL-terminated key/value pairs.
pub fn validate_block(block: &[u8]) -> Result<()> {
    if block.is_empty() {
        return Ok(());
    }
    if block.last() != Some(&0) {
        return Err(ErrorKind::Protocol("properties block not NUL-terminated"));
    }
    let strings = block[..block.len() - 1].iter().filter(|&&b| b == 0).count() + 1;
    if strings % 2 != 0 {
        return Err(ErrorKind::Protocol("properties block has odd string count"));
    }
    Ok(())
}

/// Looks up a property by linear scan. The first matching key wins;
/// duplicate keys later in the block are ignored.
pub fn property<'a>(block: &'a [u8], name: &str) -> Option<&'a str> {
    let mut rest = block;
    while !rest.is_empty() {
        let key_end = rest.iter().position(|&b| b == 0)?;
        let key = &rest[..key_end];
        rest = &rest[key_end + 1..];

        let value_end = rest.iter().position(|&b| b == 0)?;
        let value = &rest[..value_end];
        rest = &rest[value_end + 1..];

        if key == name.as_bytes() {
            return std::str::from_utf8(value).ok();
        }
    }
    None
}

/// Parses a property as a signed integer (ASCII decimal).
pub fn int_property(block: &[u8], name: &str, default: i64) -> i64 {
    property(block, name).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Parses a property as a boolean, accepting "true"/"false"/"1"/"0".
pub fn bool_property(block: &[u8], name: &str, default: bool) -> bool {
    match property(block, name) {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}
