//! Escaped snapshot of a new process's argument region.
//!
//! The region is read block by block (page granularity on real targets). Every byte
//! goes through [`codec::encode_byte`] into one fixed-capacity buffer, so the whole
//! argument vector ends up as a single space-delimited text.

use thiserror::Error;
use tracing::{debug, warn};

use crate::codec;
use crate::limits::MIN_SNAPSHOT_CAPACITY;

/// Once more than `capacity - TRUNCATION_SLACK` bytes are written, the snapshot is
/// closed with a delimiter. The slack always fits one escape, the delimiter and NUL.
pub const TRUNCATION_SLACK: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("argument region read at {pos:#x} is out of range")]
    OutOfRange { pos: u64 },

    #[error("argument region read at {pos:#x} failed: {reason}")]
    Fault { pos: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("no arguments declared")]
    NoArguments,

    #[error("argument region reports a zero block size")]
    ZeroBlockSize,

    #[error("snapshot capacity {capacity} is below the minimum of {MIN_SNAPSHOT_CAPACITY}")]
    CapacityTooSmall { capacity: usize },

    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Read access to the argument region of the process being created.
///
/// Implementations hold whatever lock protects the target's memory map only for the
/// duration of one `read_block` call.
pub trait ArgRegion {
    fn block_size(&self) -> usize;

    /// Copies the bytes from `pos` to the end of the block containing `pos` into
    /// `dst`, whose length is exactly that distance.
    fn read_block(&mut self, pos: u64, dst: &mut [u8]) -> Result<(), RegionError>;
}

impl<R: ArgRegion + ?Sized> ArgRegion for &mut R {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn read_block(&mut self, pos: u64, dst: &mut [u8]) -> Result<(), RegionError> {
        (**self).read_block(pos, dst)
    }
}

/// Copy of the most recently read block.
///
/// The buffer is allocated on first use and lives until [`BlockCache::release`] or
/// drop. Only the tail of a block from the requested position is copied, so a read
/// is served from the cache when it lands in the held block at or after the offset
/// the copy started at.
#[derive(Debug, Default)]
pub struct BlockCache {
    data: Option<Vec<u8>>,
    /// Block index and the offset within it where the held copy starts.
    block: Option<(u64, usize)>,
    reads: u64,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of region reads performed so far.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn release(&mut self) {
        self.data = None;
        self.block = None;
    }

    fn load<R: ArgRegion + ?Sized>(
        &mut self,
        region: &mut R,
        pos: u64,
    ) -> Result<&[u8], SnapshotError> {
        let block_size = region.block_size();
        if block_size == 0 {
            return Err(SnapshotError::ZeroBlockSize);
        }
        let block = pos / block_size as u64;
        let offset = (pos % block_size as u64) as usize;

        let data = match self.data.take() {
            Some(data) if data.len() == block_size => data,
            _ => {
                self.block = None;
                zeroed(block_size)?
            }
        };
        let data = self.data.insert(data);

        let hit = matches!(self.block, Some((b, from)) if b == block && from <= offset);
        if !hit {
            // Forget the old block first so a failed read never leaves a stale hit.
            self.block = None;
            region.read_block(pos, &mut data[offset..])?;
            self.reads += 1;
            self.block = Some((block, offset));
        } else {
            debug!(pos, block, "argument block served from cache");
        }
        Ok(data.as_slice())
    }
}

fn zeroed(len: usize) -> Result<Vec<u8>, SnapshotError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| SnapshotError::OutOfMemory { requested: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Escaped text of an argument vector, NUL-terminated inside a buffer of exactly
/// the configured capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBlob {
    buf: Box<[u8]>,
    len: usize,
    truncated: bool,
    delimiters: usize,
}

impl SnapshotBlob {
    /// Escaped text without the terminating NUL.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..=self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// True when the argument vector did not fit and the text was cut short.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of argument terminators copied from the region.
    pub fn encoded_args(&self) -> usize {
        self.delimiters
    }
}

/// Builds the escaped snapshot of `argc` arguments starting at `start`.
///
/// Reading stops once `argc` terminators have been seen, so empty arguments are kept.
/// A snapshot that outgrows `capacity` is truncated, never rejected. Any read
/// failure aborts the snapshot.
pub fn try_snapshot_args<R: ArgRegion + ?Sized>(
    region: &mut R,
    cache: &mut BlockCache,
    start: u64,
    argc: usize,
    capacity: usize,
) -> Result<SnapshotBlob, SnapshotError> {
    if argc == 0 {
        return Err(SnapshotError::NoArguments);
    }
    if capacity < MIN_SNAPSHOT_CAPACITY {
        return Err(SnapshotError::CapacityTooSmall { capacity });
    }
    let block_size = region.block_size();
    if block_size == 0 {
        return Err(SnapshotError::ZeroBlockSize);
    }

    let mut buf = zeroed(capacity)?;
    let mut len = 0usize;
    let mut remaining = argc;
    let mut truncated = false;
    let mut pos = start;
    let mut offset = (start % block_size as u64) as usize;

    'blocks: while remaining > 0 {
        let data = cache.load(region, pos)?;
        pos = pos.saturating_add((block_size - offset) as u64);

        while offset < block_size {
            let c = data[offset];
            offset += 1;

            if len > capacity - TRUNCATION_SLACK {
                buf[len] = codec::DELIMITER;
                len += 1;
                truncated = true;
                break 'blocks;
            }
            let escaped = codec::encode_byte(c);
            buf[len..len + escaped.len()].copy_from_slice(escaped.as_bytes());
            len += escaped.len();

            if c != 0 {
                continue;
            }
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
        offset = 0;
    }

    if truncated {
        warn!(
            argc,
            capacity,
            unread_args = remaining,
            "argument snapshot truncated"
        );
    }
    Ok(SnapshotBlob {
        buf: buf.into_boxed_slice(),
        len,
        truncated,
        delimiters: argc - remaining,
    })
}

/// Like [`try_snapshot_args`], reporting every failure as "no argument data".
pub fn snapshot_args<R: ArgRegion + ?Sized>(
    region: &mut R,
    cache: &mut BlockCache,
    start: u64,
    argc: usize,
    capacity: usize,
) -> Option<SnapshotBlob> {
    match try_snapshot_args(region, cache, start, argc, capacity) {
        Ok(blob) => Some(blob),
        Err(SnapshotError::NoArguments) => None,
        Err(err) => {
            warn!(argc, start, capacity, error = %err, "argument snapshot unavailable");
            None
        }
    }
}

/// In-memory argument region: `bytes` mapped at address `base`, read in blocks of
/// `block_size`. The tail of a partially covered block reads as zeroes; a block
/// that starts past the end of the bytes cannot be read.
#[derive(Debug, Clone)]
pub struct SliceRegion<'a> {
    bytes: &'a [u8],
    base: u64,
    block_size: usize,
    reads: usize,
}

impl<'a> SliceRegion<'a> {
    pub fn new(bytes: &'a [u8], block_size: usize) -> Self {
        Self::with_base(bytes, 0, block_size)
    }

    pub fn with_base(bytes: &'a [u8], base: u64, block_size: usize) -> Self {
        SliceRegion {
            bytes,
            base,
            block_size,
            reads: 0,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl ArgRegion for SliceRegion<'_> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, pos: u64, dst: &mut [u8]) -> Result<(), RegionError> {
        let rel = pos
            .checked_sub(self.base)
            .and_then(|rel| usize::try_from(rel).ok())
            .filter(|&rel| rel < self.bytes.len())
            .ok_or(RegionError::OutOfRange { pos })?;
        self.reads += 1;
        let avail = &self.bytes[rel..];
        let n = avail.len().min(dst.len());
        dst[..n].copy_from_slice(&avail[..n]);
        dst[n..].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(bytes: &[u8], argc: usize, block_size: usize) -> SnapshotBlob {
        let mut region = SliceRegion::new(bytes, block_size);
        let mut cache = BlockCache::new();
        try_snapshot_args(&mut region, &mut cache, 0, argc, 4096).unwrap()
    }

    #[test]
    fn escapes_arguments() {
        let blob = snapshot(b"ls\0-l\n\0", 2, 4096);
        assert_eq!(blob.as_bytes(), b"ls -l\\012 ");
        assert_eq!(blob.as_bytes_with_nul().last(), Some(&0));
        assert_eq!(blob.capacity(), 4096);
        assert_eq!(blob.encoded_args(), 2);
        assert!(!blob.is_truncated());
    }

    #[test]
    fn stops_after_declared_argc() {
        let blob = snapshot(b"a\0b\0ENV=1\0", 2, 4096);
        assert_eq!(blob.as_bytes(), b"a b ");
    }

    #[test]
    fn keeps_empty_arguments() {
        let blob = snapshot(b"a\0\0b\0", 3, 4096);
        assert_eq!(blob.as_bytes(), b"a  b ");
        assert_eq!(blob.encoded_args(), 3);
    }

    #[test]
    fn spans_blocks() {
        let blob = snapshot(b"abcdefgh\0ijklmnop\0", 2, 4);
        assert_eq!(blob.as_bytes(), b"abcdefgh ijklmnop ");
    }

    #[test]
    fn starts_mid_block() {
        let bytes = b"xxxxxxls\0-a\0";
        let mut region = SliceRegion::new(bytes, 8);
        let mut cache = BlockCache::new();
        let blob = try_snapshot_args(&mut region, &mut cache, 6, 2, 4096).unwrap();
        assert_eq!(blob.as_bytes(), b"ls -a ");
        assert_eq!(region.reads(), 2);
    }

    #[test]
    fn zero_argc_yields_nothing() {
        let mut region = SliceRegion::new(b"ls\0", 4096);
        let mut cache = BlockCache::new();
        assert_eq!(
            try_snapshot_args(&mut region, &mut cache, 0, 0, 4096),
            Err(SnapshotError::NoArguments)
        );
        assert!(!cache.is_allocated());
        assert_eq!(region.reads(), 0);
    }

    #[test]
    fn read_failure_aborts() {
        // Two arguments declared, only one present: the second block is unreadable.
        let mut region = SliceRegion::new(b"abc\0", 4);
        let mut cache = BlockCache::new();
        let err = try_snapshot_args(&mut region, &mut cache, 0, 2, 4096).unwrap_err();
        assert_eq!(err, SnapshotError::Region(RegionError::OutOfRange { pos: 4 }));
        assert!(snapshot_args(&mut region, &mut cache, 0, 2, 4096).is_none());
    }

    #[test]
    fn truncates_with_single_trailing_delimiter() {
        let capacity = MIN_SNAPSHOT_CAPACITY;
        let bytes = [0x01u8; 200];
        let mut region = SliceRegion::new(&bytes, 4096);
        let mut cache = BlockCache::new();
        let blob = try_snapshot_args(&mut region, &mut cache, 0, 1, capacity).unwrap();

        assert!(blob.is_truncated());
        assert_eq!(blob.capacity(), capacity);
        assert!(blob.len() < capacity);
        assert_eq!(blob.as_bytes_with_nul()[blob.len()], 0);
        let text = blob.as_bytes();
        assert_eq!(text.last(), Some(&codec::DELIMITER));
        let body = &text[..text.len() - 1];
        assert!(!body.contains(&codec::DELIMITER));
        // Only whole escapes made it in.
        assert_eq!(body.len() % 4, 0);
        assert!(body.chunks(4).all(|c| c == b"\\001"));
    }

    #[test]
    fn cache_skips_reread_of_same_block() {
        let bytes = b"ab\0cd\0";
        let mut region = SliceRegion::new(bytes, 4096);
        let mut cache = BlockCache::new();
        try_snapshot_args(&mut region, &mut cache, 0, 2, 4096).unwrap();
        try_snapshot_args(&mut region, &mut cache, 0, 2, 4096).unwrap();
        assert_eq!(region.reads(), 1);
        assert_eq!(cache.reads(), 1);

        cache.release();
        assert!(!cache.is_allocated());
        try_snapshot_args(&mut region, &mut cache, 0, 2, 4096).unwrap();
        assert_eq!(region.reads(), 2);
    }

    #[test]
    fn cache_rereads_when_start_moves_back_within_block() {
        let mut region = SliceRegion::new(b"xxxxxxls\0-a\0", 16);
        let mut cache = BlockCache::new();

        let tail = try_snapshot_args(&mut region, &mut cache, 6, 2, 64).unwrap();
        assert_eq!(tail.as_bytes(), b"ls -a ");

        let whole = try_snapshot_args(&mut region, &mut cache, 0, 1, 64).unwrap();
        assert_eq!(whole.as_bytes(), b"xxxxxxls ");
        assert_eq!(region.reads(), 2);

        // A later start inside the held copy is still a hit.
        let again = try_snapshot_args(&mut region, &mut cache, 9, 1, 64).unwrap();
        assert_eq!(again.as_bytes(), b"-a ");
        assert_eq!(region.reads(), 2);
    }

    #[test]
    fn slice_region_honours_base() {
        let mut region = SliceRegion::with_base(b"hello\0", 0x1000, 16);
        let mut dst = [0xffu8; 16];
        assert_eq!(
            region.read_block(0x0fff, &mut dst),
            Err(RegionError::OutOfRange { pos: 0x0fff })
        );
        region.read_block(0x1000, &mut dst).unwrap();
        assert_eq!(&dst[..6], b"hello\0");
        assert!(dst[6..].iter().all(|&b| b == 0));
    }
}
