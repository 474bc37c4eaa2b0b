/// IRC line codec: frames a raw byte stream into decoded text lines.
///
/// Splits on `\n`, trims any `\r` around the line, and decodes each line as
/// UTF-8 with a Latin-1 fallback. Outgoing lines are always encoded as UTF-8
/// with `\r\n` termination.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Codec error. Framing itself cannot fail; only the underlying I/O can.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A codec that frames IRC lines on `\n` boundaries.
///
/// The decoder never yields a line it could not decode; such lines are
/// skipped and decoding continues with the next one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineCodec;

/// Decode one raw line: UTF-8 first, then Latin-1.
///
/// Every byte sequence is valid Latin-1, so a line counts as undecodable
/// only when it carries NUL, which no IRC line may contain. That rule is
/// applied before either encoding is tried.
pub fn decode_line(raw: &[u8]) -> Option<String> {
    if raw.contains(&0) {
        return None;
    }
    match std::str::from_utf8(raw) {
        Ok(s) => Some(s.to_owned()),
        Err(_) => Some(raw.iter().map(|&b| char::from(b)).collect()),
    }
}

fn trim_cr(mut line: &[u8]) -> &[u8] {
    while let [b'\r', rest @ ..] = line {
        line = rest;
    }
    while let [rest @ .., b'\r'] = line {
        line = rest;
    }
    line
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };

            let raw = src.split_to(pos);
            src.advance(1); // skip \n

            match decode_line(trim_cr(&raw)) {
                Some(line) => return Ok(Some(line)),
                None => {
                    debug!(bytes = raw.len(), "codec: dropped undecodable line");
                    continue;
                }
            }
        }
    }
}

impl Encoder<&str> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
