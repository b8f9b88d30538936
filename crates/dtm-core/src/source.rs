//! Argument sources: how a context obtains the bytes of argument `i`.
//!
//! Two variants exist. A snapshot source owns the escaped text produced by
//! [`crate::snapshot`] and decodes it front to back. A direct source fetches single
//! arguments from the target's argument vector, which is cheap to index.

use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use thiserror::Error;
use tracing::debug;

use crate::codec::CodecError;
use crate::limits::{Limits, MAX_ARGC, MAX_ARG_STRLEN};
use crate::snapshot::{RegionError, SnapshotBlob};
use crate::split;

pub const ENV_VARIANT: &str = "DTM_VARIANT";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("no argument data was captured")]
    NoData,

    #[error("argument {index} could not be read")]
    Unreadable { index: usize },

    #[error("out of memory allocating {requested} bytes for argument {index}")]
    OutOfMemory { index: usize, requested: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Region(#[from] RegionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceVariant {
    Snapshot,
    Direct,
}

impl SourceVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceVariant::Snapshot => "snapshot",
            SourceVariant::Direct => "direct",
        }
    }
}

impl fmt::Display for SourceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SourceVariantParseError {
    value: String,
}

impl fmt::Display for SourceVariantParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid argument source variant {:?} (expected one of: snapshot, direct)",
            self.value
        )
    }
}

impl std::error::Error for SourceVariantParseError {}

impl FromStr for SourceVariant {
    type Err = SourceVariantParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "snapshot" => Ok(SourceVariant::Snapshot),
            "direct" => Ok(SourceVariant::Direct),
            _ => Err(SourceVariantParseError { value: s }),
        }
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for SourceVariant {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [SourceVariant; 2] = [SourceVariant::Snapshot, SourceVariant::Direct];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

fn resolve_variant_with_env(
    cli_variant: Option<SourceVariant>,
    env_variant: Option<&str>,
) -> anyhow::Result<SourceVariant> {
    if let Some(v) = cli_variant {
        return Ok(v);
    }
    match env_variant {
        Some(raw) => SourceVariant::from_str(raw)
            .with_context(|| format!("invalid environment variable {ENV_VARIANT}={raw:?}")),
        None => Ok(SourceVariant::Snapshot),
    }
}

/// Picks the source variant: CLI first, then `DTM_VARIANT`, then snapshot.
pub fn resolve_variant(cli_variant: Option<SourceVariant>) -> anyhow::Result<SourceVariant> {
    let env_variant = std::env::var(ENV_VARIANT).ok();
    resolve_variant_with_env(cli_variant, env_variant.as_deref())
}

/// Decoded argument slots of one context plus byte accounting.
///
/// Both totals count one terminator per argument.
#[derive(Debug, Default)]
pub struct ArgTable {
    slots: [Option<Vec<u8>>; MAX_ARGC],
    materialized: usize,
    total_raw_bytes: usize,
    total_copied_bytes: usize,
}

impl ArgTable {
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.slots.get(index)?.as_deref()
    }

    pub fn is_cached(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    /// Caches `value` in an empty slot. Returns false, dropping `value`, if the slot
    /// is out of range or already filled.
    pub fn store(
        &mut self,
        index: usize,
        value: Vec<u8>,
        raw_bytes: usize,
        copied_bytes: usize,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.materialized += 1;
        self.total_raw_bytes += raw_bytes;
        self.total_copied_bytes += copied_bytes;
        true
    }

    pub fn materialized(&self) -> usize {
        self.materialized
    }

    pub fn total_raw_bytes(&self) -> usize {
        self.total_raw_bytes
    }

    pub fn total_copied_bytes(&self) -> usize {
        self.total_copied_bytes
    }

    /// Frees every cached argument, returning how many were freed.
    pub fn release(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                freed += 1;
            }
        }
        self.materialized = 0;
        freed
    }
}

/// Capability "obtain argument bytes" used by a context.
pub trait ArgumentSource {
    fn variant(&self) -> SourceVariant;

    /// Makes argument `index` available in `table`, caching whatever else the
    /// variant decodes on the way. `index` is below `limits.argc_bound(argc)`.
    ///
    /// Running out of arguments is not an error: the slot simply stays empty.
    fn materialize(
        &mut self,
        index: usize,
        table: &mut ArgTable,
        limits: &Limits,
    ) -> Result<(), SourceError>;
}

/// Arguments decoded from an escaped snapshot, which this source owns.
///
/// Tokens cannot be located without decoding their predecessors, so every
/// materialization restarts at the beginning of the text. Asking for indices in
/// increasing order one at a time therefore costs O(index^2) scanning.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSource {
    blob: Option<SnapshotBlob>,
}

impl SnapshotSource {
    /// `None` stands for a snapshot that could not be taken; every argument is then
    /// unavailable.
    pub fn new(blob: Option<SnapshotBlob>) -> Self {
        SnapshotSource { blob }
    }

    pub fn blob(&self) -> Option<&SnapshotBlob> {
        self.blob.as_ref()
    }

    pub fn into_blob(self) -> Option<SnapshotBlob> {
        self.blob
    }
}

impl ArgumentSource for SnapshotSource {
    fn variant(&self) -> SourceVariant {
        SourceVariant::Snapshot
    }

    fn materialize(
        &mut self,
        index: usize,
        table: &mut ArgTable,
        limits: &Limits,
    ) -> Result<(), SourceError> {
        let Some(blob) = self.blob.as_ref() else {
            return Err(SourceError::NoData);
        };
        let text = blob.as_bytes();
        let max_len = limits
            .clamp_snapshot_args
            .then(|| limits.max_arg_len.saturating_sub(1));

        let mut cursor = 0usize;
        for i in 0..=index {
            if table.is_cached(i) {
                if !split::skip_arg(text, &mut cursor) {
                    break;
                }
                continue;
            }
            let Some(arg) = split::argv_dup(text, &mut cursor, max_len)? else {
                debug!(index, decoded = i, "snapshot holds fewer arguments than declared");
                break;
            };
            let copied = arg.bytes.len() + 1;
            table.store(i, arg.bytes, arg.decoded_len + 1, copied);
        }
        Ok(())
    }
}

/// Random access to the target's argument strings.
pub trait ArgVector {
    /// Length of argument `index` including its terminator, counted up to
    /// [`MAX_ARG_STRLEN`]. Zero means the string could not be read.
    fn terminated_len(&mut self, index: usize) -> Result<usize, RegionError>;

    /// Copies the first `dst.len()` bytes of argument `index`.
    fn copy_arg(&mut self, index: usize, dst: &mut [u8]) -> Result<(), RegionError>;
}

impl<V: ArgVector + ?Sized> ArgVector for &mut V {
    fn terminated_len(&mut self, index: usize) -> Result<usize, RegionError> {
        (**self).terminated_len(index)
    }

    fn copy_arg(&mut self, index: usize, dst: &mut [u8]) -> Result<(), RegionError> {
        (**self).copy_arg(index, dst)
    }
}

/// Arguments read one at a time from an [`ArgVector`] the target owns.
#[derive(Debug)]
pub struct DirectSource<V> {
    argv: V,
}

impl<V: ArgVector> DirectSource<V> {
    pub fn new(argv: V) -> Self {
        DirectSource { argv }
    }

    pub fn into_inner(self) -> V {
        self.argv
    }
}

impl<V: ArgVector> ArgumentSource for DirectSource<V> {
    fn variant(&self) -> SourceVariant {
        SourceVariant::Direct
    }

    fn materialize(
        &mut self,
        index: usize,
        table: &mut ArgTable,
        limits: &Limits,
    ) -> Result<(), SourceError> {
        let raw_len = self.argv.terminated_len(index)?;
        if raw_len == 0 {
            return Err(SourceError::Unreadable { index });
        }
        // The terminator always fits, even under a zero bound.
        let copy_len = raw_len.min(limits.max_arg_len.max(1));

        let mut copy = Vec::new();
        copy.try_reserve_exact(copy_len)
            .map_err(|_| SourceError::OutOfMemory {
                index,
                requested: copy_len,
            })?;
        copy.resize(copy_len, 0);
        self.argv.copy_arg(index, &mut copy)?;

        // The last copied byte is the terminator, even when the string was cut.
        copy.truncate(copy_len - 1);
        if let Some(nul) = copy.iter().position(|&b| b == 0) {
            copy.truncate(nul);
        }
        table.store(index, copy, raw_len, copy_len);
        Ok(())
    }
}

/// In-memory [`ArgVector`] that counts the reads it serves.
#[derive(Debug, Clone, Default)]
pub struct SliceArgv {
    args: Vec<Vec<u8>>,
    copies: usize,
}

impl SliceArgv {
    pub fn new<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        SliceArgv {
            args: args.into_iter().map(Into::into).collect(),
            copies: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Number of `copy_arg` calls served.
    pub fn copies(&self) -> usize {
        self.copies
    }

    fn arg(&self, index: usize) -> Result<&[u8], RegionError> {
        self.args
            .get(index)
            .map(Vec::as_slice)
            .ok_or(RegionError::OutOfRange { pos: index as u64 })
    }
}

impl ArgVector for SliceArgv {
    fn terminated_len(&mut self, index: usize) -> Result<usize, RegionError> {
        let arg = self.arg(index)?;
        let len = arg.iter().position(|&b| b == 0).unwrap_or(arg.len());
        Ok((len + 1).min(MAX_ARG_STRLEN))
    }

    fn copy_arg(&mut self, index: usize, dst: &mut [u8]) -> Result<(), RegionError> {
        let arg = self.arg(index)?;
        let n = arg.len().min(dst.len());
        dst[..n].copy_from_slice(&arg[..n]);
        dst[n..].fill(0);
        self.copies += 1;
        Ok(())
    }
}
