//! NETASCII line-ending translation (RFC 1350).
//!
//! Outbound: a bare LF becomes CR LF. Inbound: CR LF collapses to LF and a
//! lone CR is dropped. Translation is streaming so a CR/LF pair split across
//! block boundaries is handled; both halves carry one byte of state.

/// Outbound translator (local text -> wire).
#[derive(Debug, Default)]
pub struct Encoder {
    last_was_cr: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        out.reserve(chunk.len());
        for &byte in chunk {
            if byte == b'\n' && !self.last_was_cr {
                out.push(b'\r');
            }
            out.push(byte);
            self.last_was_cr = byte == b'\r';
        }
    }
}

/// Inbound translator (wire -> local text).
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        out.reserve(chunk.len());
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    b'\n' => {
                        out.push(b'\n');
                        continue;
                    }
                    b'\r' => {
                        // lone CR dropped; the new CR becomes pending
                        self.pending_cr = true;
                        continue;
                    }
                    _ => {} // lone CR dropped, fall through to the byte
                }
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }
    }

    /// Flush end-of-stream state. A trailing lone CR is dropped.
    pub fn finish(&mut self) {
        self.pending_cr = false;
    }
}

/// One-shot outbound translation.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 10);
    Encoder::new().push(data, &mut out);
    out
}

/// One-shot inbound translation.
pub fn decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut decoder = Decoder::new();
    decoder.push(data, &mut out);
    out
}
