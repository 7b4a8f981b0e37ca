//! Packet framing codec for the qbs session protocol.
//!
//! Every message travels as `qbsmsg:<N>\n<payload>`, where `<payload>` is the
//! standard base64 encoding of a JSON object and `<N>` is the payload length
//! in bytes. [`PacketCodec`] plugs into [`tokio_util::codec::FramedRead`] and
//! [`tokio_util::codec::FramedWrite`].
//!
//! Malformed input is never a decoder error: it is reported as
//! [`Packet::Malformed`] and decoding resumes at the next packet marker, so a
//! single corrupt packet does not end the stream.

use std::io;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Marker that opens every packet.
pub const PACKET_MARKER: &[u8] = b"qbsmsg:";

/// Maximum payload size (64 MiB) to prevent unbounded memory allocation.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Longest header line accepted after the marker (digits plus optional `\r`).
const MAX_LENGTH_DIGITS: usize = 20;

/// One decoded unit of the inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A complete, well-formed message.
    Message(serde_json::Value),
    /// Bytes that could not be decoded; they have already been discarded.
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for the next `qbsmsg:` marker.
    Marker,
    /// Marker consumed; waiting for `len` payload bytes.
    Payload { len: usize },
}

/// Decoder/encoder for `qbsmsg:` packets.
#[derive(Debug)]
pub struct PacketCodec {
    state: State,
}

impl PacketCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Marker,
        }
    }

    /// Discard everything before the next marker.
    ///
    /// Keeps a trailing partial marker so a marker split across two reads is
    /// still recognised. Returns the discarded bytes when they were anything
    /// other than whitespace.
    fn skip_to_marker(src: &mut BytesMut) -> Option<String> {
        let found = find(src, PACKET_MARKER);
        let discard = match found {
            Some(pos) => pos,
            None => src.len().saturating_sub(partial_marker_suffix(src)),
        };
        if discard == 0 {
            return None;
        }
        let junk = src.split_to(discard);
        if junk.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(String::from_utf8_lossy(&junk).into_owned())
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Option<Result<(), String>> {
        let header = &src[PACKET_MARKER.len()..];
        let Some(newline) = header.iter().position(|b| *b == b'\n') else {
            if header.len() > MAX_LENGTH_DIGITS {
                src.advance(PACKET_MARKER.len());
                return Some(Err("packet header without line terminator".to_string()));
            }
            return None;
        };

        let digits = String::from_utf8_lossy(&header[..newline]).trim().to_string();
        src.advance(PACKET_MARKER.len() + newline + 1);

        let len = match digits.parse::<usize>() {
            Ok(len) => len,
            Err(_) => return Some(Err(format!("invalid packet length {digits:?}"))),
        };
        if len > MAX_PAYLOAD_BYTES {
            return Some(Err(format!(
                "packet length {len} exceeds maximum {MAX_PAYLOAD_BYTES}"
            )));
        }

        self.state = State::Payload { len };
        Some(Ok(()))
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Packet>> {
        loop {
            match self.state {
                State::Marker => {
                    if let Some(junk) = Self::skip_to_marker(src) {
                        return Ok(Some(Packet::Malformed(format!(
                            "unexpected bytes before packet marker: {}",
                            junk.trim()
                        ))));
                    }
                    if !src.starts_with(PACKET_MARKER) {
                        return Ok(None);
                    }
                    match self.decode_header(src) {
                        None => return Ok(None),
                        Some(Err(reason)) => return Ok(Some(Packet::Malformed(reason))),
                        Some(Ok(())) => {}
                    }
                }
                State::Payload { len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(len);
                    self.state = State::Marker;
                    return Ok(Some(decode_payload(&payload)));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Packet>> {
        if let Some(packet) = self.decode(src)? {
            return Ok(Some(packet));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let leftover = src.len();
        src.clear();
        self.state = State::Marker;
        Ok(Some(Packet::Malformed(format!(
            "stream ended inside a packet ({leftover} bytes pending)"
        ))))
    }
}

impl Encoder<&serde_json::Value> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &serde_json::Value, dst: &mut BytesMut) -> io::Result<()> {
        let json = serde_json::to_vec(item).map_err(io::Error::other)?;
        let payload = STANDARD.encode(json);
        let header = format!("qbsmsg:{}\n", payload.len());
        dst.reserve(header.len() + payload.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(payload.as_bytes());
        Ok(())
    }
}

fn decode_payload(payload: &[u8]) -> Packet {
    let bytes = match STANDARD.decode(payload.trim_ascii()) {
        Ok(bytes) => bytes,
        Err(e) => return Packet::Malformed(format!("invalid base64 payload: {e}")),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Packet::Message(value),
        Err(e) => Packet::Malformed(format!("invalid JSON payload: {e}")),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest suffix of `src` that is a proper prefix of the marker.
fn partial_marker_suffix(src: &[u8]) -> usize {
    (1..PACKET_MARKER.len())
        .rev()
        .find(|&n| src.len() >= n && src.ends_with(&PACKET_MARKER[..n]))
        .unwrap_or(0)
}
