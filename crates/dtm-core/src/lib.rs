//! Argument snapshot and trust-evaluation context for an execution gatekeeper.
//!
//! Before a program image runs, the gatekeeper reconstructs the argument vector of
//! the new process and hands a policy engine a [`DtmContext`] that decodes those
//! arguments lazily, within fixed bounds ([`Limits`]). Every lookup fails closed.
//!
//! Pipeline:
//! - [`snapshot`] copies the target's argument region block by block into one
//!   escaped, space-delimited text ([`codec`]).
//! - [`split`] turns that text back into raw arguments on demand.
//! - [`source`] abstracts over snapshot-backed and direct per-index argument access.
//! - [`context`] caches what the engine asked for and frees it at teardown.
//! - [`lookup`] ties it together for one process-creation event.

pub mod codec;
pub mod context;
pub mod fd_mode;
pub mod limits;
pub mod lookup;
pub mod snapshot;
pub mod source;
pub mod split;

pub use context::{basename, DtmContext, ExecContext, DTM_UNKNOWN};
pub use fd_mode::{FdMode, FdModeClassifier, FixedClassifier};
#[cfg(unix)]
pub use fd_mode::FstatClassifier;
pub use limits::{Limits, MAX_ARGC, MAX_ARG_LEN, SNAPSHOT_CAPACITY};
pub use lookup::{
    DecisionCode, EngineError, Gatekeeper, LookupOutcome, PolicyEngine, PolicySubject, TaskInfo,
};
pub use snapshot::{ArgRegion, BlockCache, RegionError, SliceRegion, SnapshotBlob};
pub use source::{
    ArgTable, ArgVector, ArgumentSource, DirectSource, SliceArgv, SnapshotSource, SourceError,
    SourceVariant,
};
