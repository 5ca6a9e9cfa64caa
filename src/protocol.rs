//! miIO wire protocol implementation.
//! Handles packet framing, header parsing, and checksum verification.

use crate::crypto::TokenCipher;
use crate::error::{MiioError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use md5::{Digest, Md5};
use std::io::Cursor;

pub const MAGIC: u16 = 0x2131;
pub const HEADER_LEN: usize = 32;
pub const DEFAULT_PORT: u16 = 54321;

/// `unknown` field value used by requests and replies.
pub const UNKNOWN_REQUEST: u32 = 0x0000_0000;
/// `unknown` field value used by the hello handshake.
pub const UNKNOWN_HELLO: u32 = 0xFFFF_FFFF;

/// miIO packet header (32 bytes, big endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiioHeader {
    /// Total packet length (header + encrypted payload)
    pub length: u16,
    /// Zero for regular traffic, all ones for hello
    pub unknown: u32,
    /// Device identifier assigned by the vendor
    pub device_id: u32,
    /// Device uptime stamp in seconds
    pub stamp: u32,
    /// MD5 checksum (or token/filler bytes in hello replies)
    pub checksum: [u8; 16],
}

/// A decoded miIO message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiioMessage {
    /// Device identifier
    pub device_id: u32,
    /// Stamp carried by the packet
    pub stamp: u32,
    /// Plaintext payload (JSON); empty for handshake packets
    pub payload: Vec<u8>,
}

impl MiioMessage {
    pub fn payload_as_string(&self) -> Option<String> {
        String::from_utf8(self.payload.clone()).ok()
    }
}

/// The 32-byte hello packet that opens a session.
pub fn hello_packet() -> Vec<u8> {
    let mut data = vec![0xFFu8; HEADER_LEN];
    data[..2].copy_from_slice(&MAGIC.to_be_bytes());
    data[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    data
}

fn checksum(header: &[u8], token: &[u8], body: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(header);
    hasher.update(token);
    hasher.update(body);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Pack a MiioMessage into an encrypted, checksummed packet.
pub fn pack_message(msg: &MiioMessage, cipher: &TokenCipher) -> Result<Vec<u8>> {
    let encrypted = cipher.encrypt(&msg.payload);
    let total_len = HEADER_LEN + encrypted.len();
    let length = u16::try_from(total_len)
        .map_err(|_| MiioError::Protocol(format!("packet too large ({} bytes)", total_len)))?;

    let mut data = Vec::with_capacity(total_len);
    data.write_u16::<BigEndian>(MAGIC)?;
    data.write_u16::<BigEndian>(length)?;
    data.write_u32::<BigEndian>(UNKNOWN_REQUEST)?;
    data.write_u32::<BigEndian>(msg.device_id)?;
    data.write_u32::<BigEndian>(msg.stamp)?;

    let sum = checksum(&data, cipher.token(), &encrypted);
    data.extend_from_slice(&sum);
    data.extend_from_slice(&encrypted);
    Ok(data)
}

/// Parse a miIO header from binary data.
pub fn parse_header(data: &[u8]) -> Result<MiioHeader> {
    if data.len() < HEADER_LEN {
        return Err(MiioError::Protocol(format!(
            "header too short ({} bytes)",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let magic = cursor.read_u16::<BigEndian>()?;
    if magic != MAGIC {
        return Err(MiioError::Protocol(format!("invalid magic 0x{:04X}", magic)));
    }
    let length = cursor.read_u16::<BigEndian>()?;
    let unknown = cursor.read_u32::<BigEndian>()?;
    let device_id = cursor.read_u32::<BigEndian>()?;
    let stamp = cursor.read_u32::<BigEndian>()?;
    let mut sum = [0u8; 16];
    sum.copy_from_slice(&data[16..HEADER_LEN]);

    if (length as usize) < HEADER_LEN {
        return Err(MiioError::Protocol(format!(
            "declared length {} is shorter than the header",
            length
        )));
    }

    Ok(MiioHeader {
        length,
        unknown,
        device_id,
        stamp,
        checksum: sum,
    })
}

/// Unpack binary data into a MiioMessage.
///
/// Packets without a body (hello replies) need no cipher. Packets with a body
/// are checksum-verified and decrypted; trailing NUL bytes are stripped.
pub fn unpack_message(data: &[u8], cipher: Option<&TokenCipher>) -> Result<MiioMessage> {
    let header = parse_header(data)?;
    let msg_len = header.length as usize;
    if data.len() < msg_len {
        return Err(MiioError::Protocol(format!(
            "data shorter than declared length ({} < {})",
            data.len(),
            msg_len
        )));
    }

    let body = &data[HEADER_LEN..msg_len];
    if body.is_empty() {
        return Ok(MiioMessage {
            device_id: header.device_id,
            stamp: header.stamp,
            payload: Vec::new(),
        });
    }

    let cipher = cipher.ok_or_else(|| MiioError::Protocol("encrypted packet without token".into()))?;
    if checksum(&data[..16], cipher.token(), body) != header.checksum {
        return Err(MiioError::Auth("reply checksum mismatch".into()));
    }

    let mut payload = cipher.decrypt(body)?;
    while payload.last() == Some(&0) {
        payload.pop();
    }

    Ok(MiioMessage {
        device_id: header.device_id,
        stamp: header.stamp,
        payload,
    })
}
