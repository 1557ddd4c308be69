//! Packet framing: checksums, run-length encoding, binary escaping and hex helpers.
//!
//! A frame on the wire is `$<payload>#<checksum>` where checksum is the sum of the
//! transmitted payload bytes modulo 256, printed as two hex digits. Notifications use
//! `%` instead of `$` as a frame start.

use crate::remote::error::Error;
use bytes::{BufMut, BytesMut};
use std::fmt::Write;

pub const PACKET_START: u8 = b'$';
pub const NOTIFICATION_START: u8 = b'%';
pub const CHECKSUM_START: u8 = b'#';
pub const RLE_MARKER: u8 = b'*';
pub const ESCAPE: u8 = b'}';
pub const ACK: u8 = b'+';
pub const NACK: u8 = b'-';
/// Out-of-band interrupt request (Ctrl-C).
pub const INTERRUPT: u8 = 0x03;

/// Bytes added around a payload: `$`, `#` and two checksum digits.
pub const FRAME_OVERHEAD: usize = 4;

/// Repeat count is transmitted as a printable byte: `count + RLE_BIAS`.
const RLE_BIAS: u8 = 29;
const RLE_MIN_COUNT_BYTE: u8 = 0x20;
const RLE_MAX_COUNT_BYTE: u8 = 0x7e;
/// Shortest run worth compressing, three bytes are needed for `c*n`.
const RLE_MIN_REPEAT: usize = 3;
const RLE_MAX_REPEAT: usize = (RLE_MAX_COUNT_BYTE - RLE_BIAS) as usize;

/// Calculate a packet checksum.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn is_special(b: u8) -> bool {
    matches!(b, PACKET_START | CHECKSUM_START | RLE_MARKER | ESCAPE)
}

fn push_frame(start: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    frame.push(start);
    frame.extend_from_slice(body);
    frame.push(CHECKSUM_START);
    frame.extend_from_slice(format!("{:02x}", checksum(body)).as_bytes());
    frame
}

/// Make a `$payload#cs` frame, payload is sent as is.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    push_frame(PACKET_START, payload)
}

/// Make a `$payload#cs` frame with run-length compressed payload.
pub fn encode_compressed(payload: &[u8]) -> Vec<u8> {
    push_frame(PACKET_START, &compress(payload))
}

/// Make a `%payload#cs` notification frame.
pub fn encode_notification(payload: &[u8]) -> Vec<u8> {
    push_frame(NOTIFICATION_START, payload)
}

/// Run-length compress a payload.
///
/// A run of `n + 1` equal bytes is written as the byte, `*` and `n + 29`. Counts that would
/// produce `#` or `$` are shortened, special bytes are never compressed, so escape
/// sequences stay intact.
pub fn compress(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;
    while i < payload.len() {
        let b = payload[i];
        out.push(b);
        i += 1;
        if is_special(b) {
            continue;
        }

        let run = payload[i..].iter().take_while(|&&next| next == b).count();
        if run < RLE_MIN_REPEAT {
            continue;
        }

        let mut repeat = run.min(RLE_MAX_REPEAT);
        // `#` and `$` are forbidden as a count byte
        while matches!(repeat as u8 + RLE_BIAS, CHECKSUM_START | PACKET_START) {
            repeat -= 1;
        }
        out.push(RLE_MARKER);
        out.push(repeat as u8 + RLE_BIAS);
        i += repeat;
    }
    out
}

/// Expand run-length sequences of received data into `out`.
/// Buffer grows when the expansion does not fit the remaining capacity.
pub fn expand(data: &[u8], out: &mut BytesMut) -> Result<(), Error> {
    let mut iter = data.iter().copied();
    while let Some(b) = iter.next() {
        if b != RLE_MARKER {
            out.put_u8(b);
            continue;
        }

        let count_byte = iter
            .next()
            .ok_or_else(|| Error::malformed("run-length marker at the end of packet"))?;
        if !(RLE_MIN_COUNT_BYTE..=RLE_MAX_COUNT_BYTE).contains(&count_byte) {
            return Err(Error::malformed(format!(
                "invalid run-length count byte {count_byte:#04x}"
            )));
        }
        let last = *out
            .last()
            .ok_or_else(|| Error::malformed("run-length marker without preceding byte"))?;
        let repeat = (count_byte - RLE_BIAS) as usize;
        out.reserve(repeat);
        out.put_bytes(last, repeat);
    }
    Ok(())
}

/// Validate and unpack a whole `$payload#cs` (or `%payload#cs`) frame.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, Error> {
    let body = match frame.first() {
        Some(&PACKET_START) | Some(&NOTIFICATION_START) => &frame[1..],
        _ => return Err(Error::malformed("frame start not found")),
    };
    let sep = body
        .iter()
        .rposition(|&b| b == CHECKSUM_START)
        .ok_or_else(|| Error::malformed("checksum separator not found"))?;
    let (data, cs) = (&body[..sep], &body[sep + 1..]);
    if cs.len() != 2 {
        return Err(Error::malformed("checksum must be two hex digits"));
    }
    let expected = hex_byte(cs[0], cs[1])?;
    let computed = checksum(data);
    if expected != computed {
        return Err(Error::Checksum { expected, computed });
    }

    let mut out = BytesMut::with_capacity(data.len());
    expand(data, &mut out)?;
    Ok(out.to_vec())
}

/// Escape binary data for `X`-like packets, stop when output would exceed `limit`.
/// Return number of input bytes written into `out`.
pub fn escape_binary(data: &[u8], out: &mut Vec<u8>, limit: usize) -> usize {
    let start_len = out.len();
    for (i, &b) in data.iter().enumerate() {
        let need = if is_special(b) { 2 } else { 1 };
        if out.len() - start_len + need > limit {
            return i;
        }
        if is_special(b) {
            out.push(ESCAPE);
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    data.len()
}

/// Reverse [`escape_binary`].
pub fn unescape_binary(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESCAPE {
            let escaped = iter
                .next()
                .ok_or_else(|| Error::malformed("escape byte at the end of binary data"))?;
            out.push(escaped ^ 0x20);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Takes an ASCII hex digit and returns its value.
pub fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

pub fn hex_byte(hi: u8, lo: u8) -> Result<u8, Error> {
    match (hex_digit(hi), hex_digit(lo)) {
        (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
        _ => Err(Error::malformed(format!(
            "invalid hex byte `{}{}`",
            hi as char, lo as char
        ))),
    }
}

/// Encode bytes as lowercase hex digits.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        _ = write!(s, "{b:02x}");
    }
    s
}

/// Decode pairs of hex digits.
pub fn hex_decode(hex: &[u8]) -> Result<Vec<u8>, Error> {
    if hex.len() % 2 != 0 {
        return Err(Error::malformed("odd number of hex digits"));
    }
    hex.chunks_exact(2).map(|c| hex_byte(c[0], c[1])).collect()
}

/// Parse a variable length hex number, leading `-` allowed.
pub fn parse_hex_i64(hex: &[u8]) -> Result<i64, Error> {
    let (neg, digits) = match hex.strip_prefix(b"-") {
        Some(rest) => (true, rest),
        None => (false, hex),
    };
    let value = parse_hex_u64(digits)? as i64;
    Ok(if neg { -value } else { value })
}

/// Parse a variable length hex number.
pub fn parse_hex_u64(hex: &[u8]) -> Result<u64, Error> {
    if hex.is_empty() || hex.len() > 16 {
        return Err(Error::malformed(format!(
            "invalid hex number `{}`",
            String::from_utf8_lossy(hex)
        )));
    }
    hex.iter().try_fold(0u64, |acc, &c| {
        hex_digit(c).map(|d| acc << 4 | d as u64).ok_or_else(|| {
            Error::malformed(format!(
                "invalid hex number `{}`",
                String::from_utf8_lossy(hex)
            ))
        })
    })
}

/// Split leading hex digits (with optional `-`) from the rest of input.
pub fn split_hex(input: &[u8]) -> (&[u8], &[u8]) {
    let sign = usize::from(input.first() == Some(&b'-'));
    let len = input[sign..]
        .iter()
        .take_while(|c| c.is_ascii_hexdigit())
        .count();
    input.split_at(sign + len)
}
