//! On-demand splitting of a snapshot text back into raw arguments.

use crate::codec::{self, CodecError};

/// One argument decoded from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedArg {
    pub bytes: Vec<u8>,
    /// Length of the full decoded token, which exceeds `bytes.len()` when clamped.
    pub decoded_len: usize,
}

impl DecodedArg {
    pub fn is_clamped(&self) -> bool {
        self.decoded_len > self.bytes.len()
    }
}

/// Creates an unescaped copy of the argument at `*cursor`.
///
/// The buffer is sized by a pre-pass over the token, or to `max_len` bytes when a
/// bound is given and the token is longer. On success the cursor moves past the
/// token and its delimiter. `Ok(None)` means the text holds no more arguments.
pub fn argv_dup(
    text: &[u8],
    cursor: &mut usize,
    max_len: Option<usize>,
) -> Result<Option<DecodedArg>, CodecError> {
    let Some(span) = codec::scan_token(text, *cursor) else {
        return Ok(None);
    };
    let keep = max_len.map_or(span.decoded_len, |max| span.decoded_len.min(max));
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(keep)
        .map_err(|_| CodecError::OutOfMemory { requested: keep })?;
    codec::decode_span_into(text, &span, keep, &mut bytes);
    *cursor = span.next;
    Ok(Some(DecodedArg {
        bytes,
        decoded_len: span.decoded_len,
    }))
}

/// Moves the cursor past one argument without decoding it. Returns false when the
/// text holds no more arguments.
pub fn skip_arg(text: &[u8], cursor: &mut usize) -> bool {
    match codec::scan_token(text, *cursor) {
        Some(span) => {
            *cursor = span.next;
            true
        }
        None => false,
    }
}

/// Iterator over the arguments of a snapshot text, from the beginning.
#[derive(Debug, Clone)]
pub struct Splitter<'a> {
    text: &'a [u8],
    cursor: usize,
    max_len: Option<usize>,
}

impl<'a> Splitter<'a> {
    pub fn new(text: &'a [u8]) -> Self {
        Splitter {
            text,
            cursor: 0,
            max_len: None,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl Iterator for Splitter<'_> {
    type Item = Result<DecodedArg, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        argv_dup(self.text, &mut self.cursor, self.max_len).transpose()
    }
}
