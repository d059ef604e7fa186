//! The framed envelope producers prepend to every message body: one magic
//! byte followed by the schema ID as a four-byte big-endian integer, then the
//! format-specific payload.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{RegistryError, Result};

pub const MAGIC_BYTE: u8 = 0;

/// Envelope header length: magic byte plus 32-bit schema ID.
pub const HEADER_LEN: usize = 5;

pub fn encode(schema_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(MAGIC_BYTE);
    let mut id_buf = [0u8; 4];
    BigEndian::write_i32(&mut id_buf, schema_id);
    out.extend_from_slice(&id_buf);
    out.extend_from_slice(payload);
    out
}

/// Splits an envelope into schema ID and payload.
pub fn decode(data: &[u8]) -> Result<(i32, &[u8])> {
    if data.len() < HEADER_LEN {
        return Err(RegistryError::BadRequest(format!(
            "data too short: {} bytes",
            data.len()
        )));
    }
    if data[0] != MAGIC_BYTE {
        return Err(RegistryError::BadRequest(format!(
            "invalid magic byte: {:#04x}",
            data[0]
        )));
    }
    let schema_id = BigEndian::read_i32(&data[1..HEADER_LEN]);
    Ok((schema_id, &data[HEADER_LEN..]))
}
