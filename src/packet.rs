//! TFTP wire codec.
//!
//! RFC 1350 packet formats plus the option extensions of RFC 2347 (OACK),
//! RFC 2348 (blksize), RFC 2349 (timeout, tsize) and RFC 7440 (windowsize).
//! Decoding never touches the network or filesystem; it maps a datagram to a
//! tagged [`Packet`] value or a parse error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};
use crate::{ErrorCode, MAX_BLOCK_SIZE, MAX_FILENAME_LENGTH, MIN_BLOCK_SIZE, Opcode, TransferMode};

/// Maximum length of the message carried by an ERROR packet.
const MAX_ERROR_MESSAGE: usize = 255;

/// Options a client may attach to a request. Out-of-range and non-numeric
/// values are dropped during decode per RFC 2347 (ignored, not errored).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestOptions {
    /// RFC 2348 - Block Size Option (8-65464 bytes)
    pub blksize: Option<u16>,
    /// RFC 2349 - Timeout Interval Option (1-255 seconds)
    pub timeout: Option<u8>,
    /// RFC 2349 - Transfer Size Option
    pub tsize: Option<u64>,
    /// RFC 7440 - Windowsize Option (1-65535 blocks)
    pub windowsize: Option<u16>,
}

impl RequestOptions {
    pub fn is_empty(&self) -> bool {
        self.blksize.is_none()
            && self.timeout.is_none()
            && self.tsize.is_none()
            && self.windowsize.is_none()
    }
}

/// An RRQ or WRQ body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: TransferMode,
    pub options: RequestOptions,
}

/// One decoded TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: Vec<(String, String)> },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq(_) => Opcode::Rrq,
            Packet::Wrq(_) => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }
}

/// Decode one datagram into a [`Packet`].
pub fn decode(data: &[u8]) -> Result<Packet> {
    if data.len() < 2 {
        return Err(TftpError::Parse("packet too small".to_string()));
    }

    let mut bytes = BytesMut::from(data);
    let opcode = Opcode::try_from(bytes.get_u16())?;

    match opcode {
        Opcode::Rrq => Ok(Packet::Rrq(decode_request(&mut bytes)?)),
        Opcode::Wrq => Ok(Packet::Wrq(decode_request(&mut bytes)?)),
        Opcode::Data => {
            if bytes.remaining() < 2 {
                return Err(TftpError::Parse("DATA packet too small".to_string()));
            }
            let block = bytes.get_u16();
            Ok(Packet::Data {
                block,
                payload: bytes.freeze(),
            })
        }
        Opcode::Ack => {
            if bytes.remaining() < 2 {
                return Err(TftpError::Parse("ACK packet too small".to_string()));
            }
            Ok(Packet::Ack {
                block: bytes.get_u16(),
            })
        }
        Opcode::Error => {
            if bytes.remaining() < 2 {
                return Err(TftpError::Parse("ERROR packet too small".to_string()));
            }
            let code = ErrorCode::from_u16(bytes.get_u16());
            let message = parse_string(&mut bytes)?;
            Ok(Packet::Error { code, message })
        }
        Opcode::Oack => {
            let mut options = Vec::new();
            while bytes.remaining() > 0 {
                let name = match parse_string(&mut bytes) {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let value = match parse_string(&mut bytes) {
                    Ok(s) => s,
                    Err(_) => break,
                };
                options.push((name, value));
            }
            Ok(Packet::Oack { options })
        }
    }
}

/// Encode a [`Packet`] into its on-wire representation.
pub fn encode(packet: &Packet) -> Bytes {
    match packet {
        Packet::Rrq(request) => encode_request(Opcode::Rrq, request),
        Packet::Wrq(request) => encode_request(Opcode::Wrq, request),
        Packet::Data { block, payload } => {
            let mut out = BytesMut::with_capacity(4 + payload.len());
            out.put_u16(Opcode::Data as u16);
            out.put_u16(*block);
            out.put_slice(payload);
            out.freeze()
        }
        Packet::Ack { block } => {
            let mut out = BytesMut::with_capacity(4);
            out.put_u16(Opcode::Ack as u16);
            out.put_u16(*block);
            out.freeze()
        }
        Packet::Error { code, message } => {
            let msg = truncate_message(message);
            let mut out = BytesMut::with_capacity(5 + msg.len());
            out.put_u16(Opcode::Error as u16);
            out.put_u16(*code as u16);
            out.put_slice(msg.as_bytes());
            out.put_u8(0);
            out.freeze()
        }
        Packet::Oack { options } => {
            let mut out = BytesMut::new();
            out.put_u16(Opcode::Oack as u16);
            for (name, value) in options {
                out.put_slice(name.as_bytes());
                out.put_u8(0);
                out.put_slice(value.as_bytes());
                out.put_u8(0);
            }
            out.freeze()
        }
    }
}

/// Build an OACK from server-chosen (name, value) pairs.
pub fn oack(options: Vec<(String, String)>) -> Packet {
    Packet::Oack { options }
}

fn decode_request(bytes: &mut BytesMut) -> Result<Request> {
    let filename = parse_string(bytes)?;
    if filename.is_empty() {
        return Err(TftpError::Parse("empty filename".to_string()));
    }

    let mode_str = parse_string(bytes)?;
    let mode: TransferMode = mode_str.parse()?;

    // RFC 2347: option/value pairs follow the mode. A truncated trailing
    // pair is tolerated; anything parsed before it still counts.
    let mut options = RequestOptions::default();
    while bytes.remaining() > 0 {
        let name = match parse_string(bytes) {
            Ok(s) => s,
            Err(_) => break,
        };
        let value = match parse_string(bytes) {
            Ok(s) => s,
            Err(_) => break,
        };
        apply_option(&mut options, &name, &value);
    }

    Ok(Request {
        filename,
        mode,
        options,
    })
}

/// RFC 2347: option names are case-insensitive; a value outside the option's
/// range is treated as if the option were absent. Unknown options are
/// silently ignored.
fn apply_option(options: &mut RequestOptions, name: &str, value: &str) {
    match name.to_ascii_lowercase().as_str() {
        "blksize" => {
            if let Ok(size) = value.parse::<usize>()
                && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size)
            {
                options.blksize = Some(size as u16);
            }
        }
        "timeout" => {
            if let Ok(secs) = value.parse::<u64>()
                && (1..=255).contains(&secs)
            {
                options.timeout = Some(secs as u8);
            }
        }
        "tsize" => {
            if let Ok(size) = value.parse::<u64>() {
                options.tsize = Some(size);
            }
        }
        "windowsize" => {
            if let Ok(size) = value.parse::<usize>()
                && (1..=65535).contains(&size)
            {
                options.windowsize = Some(size as u16);
            }
        }
        _ => {}
    }
}

fn encode_request(opcode: Opcode, request: &Request) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + request.filename.len() + 16);
    out.put_u16(opcode as u16);
    out.put_slice(request.filename.as_bytes());
    out.put_u8(0);
    out.put_slice(request.mode.as_str().as_bytes());
    out.put_u8(0);

    let mut put_option = |name: &str, value: String| {
        out.put_slice(name.as_bytes());
        out.put_u8(0);
        out.put_slice(value.as_bytes());
        out.put_u8(0);
    };
    if let Some(size) = request.options.blksize {
        put_option("blksize", size.to_string());
    }
    if let Some(secs) = request.options.timeout {
        put_option("timeout", secs.to_string());
    }
    if let Some(size) = request.options.tsize {
        put_option("tsize", size.to_string());
    }
    if let Some(size) = request.options.windowsize {
        put_option("windowsize", size.to_string());
    }
    out.freeze()
}

/// Parse a NUL-terminated ASCII string, bounded to keep hostile datagrams
/// from tying up the parser.
fn parse_string(bytes: &mut BytesMut) -> Result<String> {
    let null_pos = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::Parse("string missing NUL terminator".to_string()))?;

    if null_pos > MAX_FILENAME_LENGTH {
        return Err(TftpError::Parse(format!(
            "string exceeds {} bytes",
            MAX_FILENAME_LENGTH
        )));
    }

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1); // skip the NUL

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TftpError::Parse(format!("invalid UTF-8 in string: {}", e)))
}

fn truncate_message(message: &str) -> &str {
    if message.len() <= MAX_ERROR_MESSAGE {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
