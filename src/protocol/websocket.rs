//! WebSocket upgrade and RFC 6455 framing.
//!
//! The upgrade half computes the `Sec-WebSocket-Accept` token from the
//! client key; the framing half reads masked client frames and writes
//! unmasked server frames over the same socket stream the HTTP request
//! arrived on.

use crate::error::{Error, Result};
use crate::ids::ConnectionId;
use crate::protocol::http::HttpResponse;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

/// The handshake GUID from RFC 6455 §1.3.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Frames above this are rejected rather than buffered.
const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// `Sec-WebSocket-Accept = base64(SHA1(clientKey || GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response for an upgrade request.
pub fn upgrade_response(client_key: &str, client_id: ConnectionId) -> HttpResponse {
    let mut res = HttpResponse::new();
    res.status(101)
        .set_header("Upgrade", "websocket")
        .set_header("Connection", "Upgrade")
        .set_header("Sec-WebSocket-Accept", accept_key(client_key))
        .set_header("X-Pode-ClientId", client_id.to_string());
    res
}

/// A single decoded frame. Fragmented messages are reassembled by
/// [`read_message`], so handlers only ever see whole frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<u16>),
}

struct RawFrame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

fn read_raw_frame<R: Read>(reader: &mut R) -> Result<RawFrame> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head)?;
    let fin = head[0] & 0x80 != 0;
    if head[0] & 0x70 != 0 {
        return Err(Error::protocol("unsupported RSV bits in frame"));
    }
    let opcode = head[0] & 0x0f;
    let masked = head[1] & 0x80 != 0;
    let mut len = u64::from(head[1] & 0x7f);

    if len == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext)?;
        len = u64::from(u16::from_be_bytes(ext));
    } else if len == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext)?;
        len = u64::from_be_bytes(ext);
    }
    if len > MAX_FRAME_PAYLOAD {
        return Err(Error::LimitExceeded(format!("frame of {len} bytes")));
    }

    // Client frames must be masked (RFC 6455 §5.1).
    if !masked {
        return Err(Error::protocol("unmasked client frame"));
    }
    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask)?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(RawFrame {
        fin,
        opcode,
        payload,
    })
}

/// Read one complete message, reassembling continuation frames.
///
/// Control frames (ping/pong/close) interleaved inside a fragmented message
/// are returned immediately; the caller re-enters to finish the message.
pub fn read_message<R: Read>(reader: &mut R) -> Result<WsFrame> {
    let mut assembled: Option<(u8, Vec<u8>)> = None;
    loop {
        let frame = read_raw_frame(reader)?;
        match frame.opcode {
            0x8 => {
                let code = if frame.payload.len() >= 2 {
                    Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]]))
                } else {
                    None
                };
                return Ok(WsFrame::Close(code));
            }
            0x9 => return Ok(WsFrame::Ping(frame.payload)),
            0xa => return Ok(WsFrame::Pong(frame.payload)),
            0x1 | 0x2 => {
                if assembled.is_some() {
                    return Err(Error::protocol("nested fragmented message"));
                }
                if frame.fin {
                    return finish_message(frame.opcode, frame.payload);
                }
                assembled = Some((frame.opcode, frame.payload));
            }
            0x0 => match assembled.as_mut() {
                None => return Err(Error::protocol("continuation without start frame")),
                Some((opcode, buffer)) => {
                    if (buffer.len() + frame.payload.len()) as u64 > MAX_FRAME_PAYLOAD {
                        return Err(Error::LimitExceeded("fragmented message too large".into()));
                    }
                    buffer.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let (opcode, buffer) = (*opcode, std::mem::take(buffer));
                        return finish_message(opcode, buffer);
                    }
                }
            },
            other => return Err(Error::protocol(format!("unknown opcode {other}"))),
        }
    }
}

fn finish_message(opcode: u8, payload: Vec<u8>) -> Result<WsFrame> {
    match opcode {
        0x1 => String::from_utf8(payload)
            .map(WsFrame::Text)
            .map_err(|_| Error::protocol("text frame is not valid UTF-8")),
        _ => Ok(WsFrame::Binary(payload)),
    }
}

/// Write one server frame. Server frames are never masked.
pub fn write_frame<W: Write>(writer: &mut W, frame: &WsFrame) -> Result<()> {
    let (opcode, payload): (u8, &[u8]) = match frame {
        WsFrame::Text(s) => (0x1, s.as_bytes()),
        WsFrame::Binary(b) => (0x2, b),
        WsFrame::Ping(b) => (0x9, b),
        WsFrame::Pong(b) => (0xa, b),
        WsFrame::Close(code) => {
            let body = code.map(|c| c.to_be_bytes().to_vec()).unwrap_or_default();
            write_header(writer, 0x8, body.len())?;
            writer.write_all(&body)?;
            writer.flush()?;
            return Ok(());
        }
    };
    write_header(writer, opcode, payload.len())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn write_header<W: Write>(writer: &mut W, opcode: u8, len: usize) -> Result<()> {
    let mut head = vec![0x80 | opcode];
    if len < 126 {
        head.push(len as u8);
    } else if len <= u16::MAX as usize {
        head.push(126);
        head.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        head.push(127);
        head.extend_from_slice(&(len as u64).to_be_bytes());
    }
    writer.write_all(&head)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_sample() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_response_headers() {
        let id = ConnectionId::new();
        let res = upgrade_response("dGhlIHNhbXBsZSBub25jZQ==", id);
        assert_eq!(res.status, 101);
        assert_eq!(res.get_header("upgrade"), Some("websocket"));
        assert_eq!(res.get_header("connection"), Some("Upgrade"));
        assert_eq!(
            res.get_header("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert_eq!(res.get_header("x-pode-clientid"), Some(id.to_string().as_str()));
    }

    fn masked_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut raw = vec![if fin { 0x80 } else { 0x00 } | opcode];
        assert!(payload.len() < 126);
        raw.push(0x80 | payload.len() as u8);
        raw.extend_from_slice(&mask);
        raw.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i % 4]),
        );
        raw
    }

    #[test]
    fn reads_masked_text_frame() {
        let raw = masked_frame(true, 0x1, b"hello");
        let frame = read_message(&mut raw.as_slice()).unwrap();
        assert_eq!(frame, WsFrame::Text("hello".into()));
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let raw = vec![0x81, 0x02, b'h', b'i'];
        assert!(read_message(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn reassembles_fragmented_message() {
        let mut raw = masked_frame(false, 0x1, b"hel");
        raw.extend(masked_frame(true, 0x0, b"lo"));
        let frame = read_message(&mut raw.as_slice()).unwrap();
        assert_eq!(frame, WsFrame::Text("hello".into()));
    }

    #[test]
    fn close_frame_carries_code() {
        let raw = masked_frame(true, 0x8, &1000u16.to_be_bytes());
        let frame = read_message(&mut raw.as_slice()).unwrap();
        assert_eq!(frame, WsFrame::Close(Some(1000)));
    }

    #[test]
    fn server_frame_round_trip_shape() {
        let mut out = Vec::new();
        write_frame(&mut out, &WsFrame::Text("hi".into())).unwrap();
        assert_eq!(out, vec![0x81, 0x02, b'h', b'i']);
    }
}
