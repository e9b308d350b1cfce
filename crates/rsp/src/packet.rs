//! Packet framing and payload helpers.

use qsnap_core::debug::StopEvent;

use crate::{RspError, RspResult};

/// Calculate the GDB RSP checksum for a payload.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Encode a payload into a GDB RSP packet: `$<data>#<checksum>`
pub fn encode_packet(data: &str) -> Vec<u8> {
    let cksum = checksum(data.as_bytes());
    format!("${}#{:02x}", data, cksum).into_bytes()
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// More bytes are needed.
    Incomplete,
    /// Checksum mismatch; the first `usize` bytes should be dropped.
    Corrupt(usize),
    /// Decoded payload and the number of bytes consumed.
    Packet(String, usize),
}

/// Decode one packet from the front of `raw`, which must start at `$`.
pub fn decode_frame(raw: &[u8]) -> Frame {
    if raw.first() != Some(&b'$') {
        return Frame::Incomplete;
    }
    let Some(hash_pos) = raw.iter().position(|&b| b == b'#') else {
        return Frame::Incomplete;
    };
    if hash_pos + 3 > raw.len() {
        return Frame::Incomplete;
    }

    let payload = &raw[1..hash_pos];
    let expected = std::str::from_utf8(&raw[hash_pos + 1..hash_pos + 3])
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok());
    if expected != Some(checksum(payload)) {
        return Frame::Corrupt(hash_pos + 3);
    }

    let expanded = expand_run_length(payload);
    Frame::Packet(String::from_utf8_lossy(&expanded).into_owned(), hash_pos + 3)
}

/// `X*N` stands for X repeated `N - 29` more times.
pub fn expand_run_length(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut iter = payload.iter().copied();
    while let Some(b) = iter.next() {
        if b == b'*' {
            if let (Some(&prev), Some(count)) = (out.last(), iter.next()) {
                let repeat = count.saturating_sub(29) as usize;
                out.extend(std::iter::repeat(prev).take(repeat));
                continue;
            }
        }
        out.push(b);
    }
    out
}

/// Encode bytes as a hex string.
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex string into bytes.
pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let s = std::str::from_utf8(chunk).ok()?;
        let b = u8::from_str_radix(s, 16).ok()?;
        bytes.push(b);
    }
    Some(bytes)
}

/// Little endian register contents as sent by `p`.
pub fn decode_register(hex: &str) -> Option<u64> {
    let bytes = hex_to_bytes(hex)?;
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(&bytes);
    Some(u64::from_le_bytes(buf))
}

pub fn encode_register(value: u64, width: usize) -> String {
    bytes_to_hex(&value.to_le_bytes()[..width.min(8)])
}

/// `S`/`T` report a signal, `W`/`X` mean the process is gone.
pub fn parse_stop_reply(reply: &str) -> RspResult<StopEvent> {
    let code = reply
        .get(1..3)
        .and_then(|s| u8::from_str_radix(s, 16).ok());
    match (reply.as_bytes().first(), code) {
        (Some(b'S' | b'T'), Some(sig)) => Ok(StopEvent::Signal(sig)),
        (Some(b'W' | b'X'), Some(status)) => Ok(StopEvent::Exited(status)),
        _ => Err(RspError::Unexpected {
            cmd: "stop reply".to_string(),
            reply: reply.to_string(),
        }),
    }
}

/// Error code of an `Exx` reply.
pub fn error_code(reply: &str) -> Option<u8> {
    let code = reply.strip_prefix('E')?;
    if code.len() != 2 {
        return None;
    }
    u8::from_str_radix(code, 16).ok()
}
