//! Escaping of raw argument bytes into the printable, space-delimited snapshot text,
//! and the inverse transformation.
//!
//! Encoding, byte by byte:
//! - `\` becomes `\\`
//! - printable ASCII strictly between space and DEL is kept as is
//! - NUL becomes a single space (the argument delimiter)
//! - anything else becomes `\ooo`, three octal digits
//!
//! The decoder never reads past the end of its input. A backslash that is followed
//! neither by a second backslash nor by a well-formed octal triple is copied verbatim.

use thiserror::Error;

pub const DELIMITER: u8 = b' ';
pub const ESCAPE: u8 = b'\\';

/// Longest encoding of a single byte (`\ooo`).
pub const MAX_ESCAPED_BYTE_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The output buffer for a decoded argument could not be allocated.
    #[error("out of memory allocating {requested} bytes for a decoded argument")]
    OutOfMemory { requested: usize },
}

/// Encoded form of one raw byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapedByte {
    buf: [u8; MAX_ESCAPED_BYTE_LEN],
    len: u8,
}

impl EscapedByte {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn is_plain(b: u8) -> bool {
    b > b' ' && b < 0x7f
}

pub fn encode_byte(b: u8) -> EscapedByte {
    let mut buf = [0u8; MAX_ESCAPED_BYTE_LEN];
    let len = if b == ESCAPE {
        buf[0] = ESCAPE;
        buf[1] = ESCAPE;
        2
    } else if is_plain(b) {
        buf[0] = b;
        1
    } else if b == 0 {
        buf[0] = DELIMITER;
        1
    } else {
        buf[0] = ESCAPE;
        buf[1] = (b >> 6) + b'0';
        buf[2] = ((b >> 3) & 7) + b'0';
        buf[3] = (b & 7) + b'0';
        4
    };
    EscapedByte { buf, len }
}

pub fn escaped_len(b: u8) -> usize {
    encode_byte(b).len()
}

/// Appends the encoding of `raw` to `out`. NUL bytes become delimiters.
pub fn escape_into(raw: &[u8], out: &mut Vec<u8>) {
    out.reserve(raw.len());
    for &b in raw {
        out.extend_from_slice(encode_byte(b).as_bytes());
    }
}

pub fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    escape_into(raw, &mut out);
    out
}

/// Encodes a list of arguments the way the snapshot reader lays them out: every
/// argument followed by its (encoded) terminator.
pub fn escape_args<I, A>(args: I) -> Vec<u8>
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for arg in args {
        escape_into(arg.as_ref(), &mut out);
        out.push(DELIMITER);
    }
    out
}

fn at(text: &[u8], i: usize) -> u8 {
    text.get(i).copied().unwrap_or(0)
}

fn is_octal(c: u8) -> bool {
    (b'0'..=b'7').contains(&c)
}

/// Decodes the unit starting at `text[i]`, returning the byte and how many input
/// characters it consumed.
fn decode_unit(text: &[u8], i: usize) -> (u8, usize) {
    let c = at(text, i);
    if c != ESCAPE {
        return (c, 1);
    }
    let d0 = at(text, i + 1);
    if d0 == ESCAPE {
        return (ESCAPE, 2);
    }
    let (d1, d2) = (at(text, i + 2), at(text, i + 3));
    // The first digit is at most 3, otherwise the value would not fit a byte.
    if (b'0'..=b'3').contains(&d0) && is_octal(d1) && is_octal(d2) {
        return (((d0 - b'0') << 6) | ((d1 - b'0') << 3) | (d2 - b'0'), 4);
    }
    (ESCAPE, 1)
}

/// Location of one token inside a snapshot text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
    /// Number of raw bytes the token decodes to.
    pub decoded_len: usize,
    /// Start of the next token: past the trailing delimiter, if there is one.
    pub next: usize,
}

/// Pre-pass over the token at `cursor`: skips leading delimiters and measures the
/// token without decoding it. `None` means there is no more data.
///
/// The text ends at its first NUL or at the end of the slice, whichever comes first.
pub fn scan_token(text: &[u8], cursor: usize) -> Option<TokenSpan> {
    let mut p = cursor;
    while at(text, p) == DELIMITER {
        p += 1;
    }
    if at(text, p) == 0 {
        return None;
    }
    let start = p;
    let mut decoded_len = 0usize;
    while !matches!(at(text, p), 0 | DELIMITER) {
        let (_, consumed) = decode_unit(text, p);
        p += consumed;
        decoded_len += 1;
    }
    let end = p;
    let next = if at(text, end) == DELIMITER { end + 1 } else { end };
    Some(TokenSpan {
        start,
        end,
        decoded_len,
        next,
    })
}

/// Decodes the bytes of `span` into `out`, keeping at most `limit` of them.
pub fn decode_span_into(text: &[u8], span: &TokenSpan, limit: usize, out: &mut Vec<u8>) {
    let mut p = span.start;
    let mut kept = 0usize;
    while p < span.end && kept < limit {
        let (b, consumed) = decode_unit(text, p);
        out.push(b);
        kept += 1;
        p += consumed;
    }
}

/// Decodes the next token at `*cursor` into a freshly allocated buffer of exactly
/// the decoded size and advances the cursor to the following token.
///
/// `Ok(None)` means there is no more data; the cursor is left untouched in that
/// case and on allocation failure.
pub fn decode_token(text: &[u8], cursor: &mut usize) -> Result<Option<Vec<u8>>, CodecError> {
    let Some(span) = scan_token(text, *cursor) else {
        return Ok(None);
    };
    let mut out = Vec::new();
    out.try_reserve_exact(span.decoded_len)
        .map_err(|_| CodecError::OutOfMemory {
            requested: span.decoded_len,
        })?;
    decode_span_into(text, &span, span.decoded_len, &mut out);
    *cursor = span.next;
    Ok(Some(out))
}

/// Inverse of [`escape`] over a whole text: delimiters turn back into NUL bytes.
pub fn unescape(text: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    out.try_reserve_exact(text.len())
        .map_err(|_| CodecError::OutOfMemory {
            requested: text.len(),
        })?;
    let mut p = 0usize;
    while p < text.len() {
        let (b, consumed) = match text[p] {
            DELIMITER => (0, 1),
            _ => decode_unit(text, p),
        };
        out.push(b);
        p += consumed;
    }
    Ok(out)
}
