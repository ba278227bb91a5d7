// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::EncodeError;

/// Generate a random alphanumeric string with `len` chars.
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a random client id for clients which connect with a zero-byte
/// client id [MQTT-3.1.3-6].
#[must_use]
pub fn random_client_id() -> String {
    format!("apiary-{}", random_string(8))
}

/// Write a length-prefixed byte field (2-byte big-endian length + bytes).
///
/// # Errors
///
/// Returns error if `data` exceeds 64KB.
pub fn write_prefixed_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<usize, EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_err| EncodeError::TooManyData)?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(2 + data.len())
}

/// Write a length-prefixed UTF-8 string field.
///
/// # Errors
///
/// Returns error if `s` exceeds 64KB.
pub fn write_prefixed_string(buf: &mut Vec<u8>, s: &str) -> Result<usize, EncodeError> {
    write_prefixed_bytes(buf, s.as_bytes())
}

/// Byte length of a length-prefixed string field on the wire.
#[must_use]
pub const fn prefixed_string_bytes(s: &str) -> usize {
    2 + s.len()
}
