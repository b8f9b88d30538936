//! Entry point invoked once per process-creation event.

use thiserror::Error;
use tracing::{debug, warn};

use crate::context::{DtmContext, ExecContext};
use crate::fd_mode::FdModeClassifier;
use crate::limits::Limits;
use crate::snapshot::{snapshot_args, ArgRegion, BlockCache};
use crate::source::{ArgVector, ArgumentSource, DirectSource, SnapshotSource};

/// Result of a lookup. Engine-specific codes pass through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecisionCode(pub i32);

impl DecisionCode {
    pub const ALLOW: DecisionCode = DecisionCode(0);
    pub const DENY: DecisionCode = DecisionCode(-libc::EPERM);

    pub fn is_allow(self) -> bool {
        self == DecisionCode::ALLOW
    }

    pub fn is_deny(self) -> bool {
        self == DecisionCode::DENY
    }
}

/// Task backing a policy subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: u32,
    pub uid: u32,
    pub comm: String,
}

/// Process whose execution is being decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySubject {
    pub task: Option<TaskInfo>,
}

impl PolicySubject {
    pub fn new(task: TaskInfo) -> Self {
        PolicySubject { task: Some(task) }
    }

    pub fn is_well_formed(&self) -> bool {
        self.task.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy engine failure: {message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        EngineError {
            message: message.into(),
        }
    }
}

/// Decides whether an execution may proceed, given its context.
pub trait PolicyEngine {
    fn evaluate(&mut self, ctx: &mut dyn ExecContext) -> Result<DecisionCode, EngineError>;
}

impl<F> PolicyEngine for F
where
    F: FnMut(&mut dyn ExecContext) -> Result<DecisionCode, EngineError>,
{
    fn evaluate(&mut self, ctx: &mut dyn ExecContext) -> Result<DecisionCode, EngineError> {
        self(ctx)
    }
}

/// Outcome of [`Gatekeeper::lookup`]. The source comes back to the caller after the
/// context is gone.
#[derive(Debug)]
pub struct LookupOutcome<S> {
    pub decision: DecisionCode,
    pub source: S,
    /// False when the lookup denied before the engine ran.
    pub evaluated: bool,
}

/// Declared argument counts come from the platform as signed integers.
fn declared_argc(argc: i32) -> usize {
    usize::try_from(argc).unwrap_or(0)
}

/// Builds contexts for execution events and runs the policy engine over them.
pub struct Gatekeeper<'a> {
    limits: Limits,
    classifier: &'a dyn FdModeClassifier,
}

impl<'a> Gatekeeper<'a> {
    pub fn new(limits: Limits, classifier: &'a dyn FdModeClassifier) -> Self {
        Gatekeeper { limits, classifier }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Snapshots the argument region at `start`. The block buffer is released
    /// before returning.
    pub fn acquire_snapshot<R: ArgRegion + ?Sized>(
        &self,
        region: &mut R,
        start: u64,
        argc: i32,
    ) -> SnapshotSource {
        let mut cache = BlockCache::new();
        let blob = snapshot_args(
            region,
            &mut cache,
            start,
            declared_argc(argc),
            self.limits.snapshot_capacity,
        );
        cache.release();
        SnapshotSource::new(blob)
    }

    /// Lookup for platforms that snapshot the argument region up front. The snapshot
    /// is taken first and released on every path.
    pub fn lookup_snapshot<R, E>(
        &self,
        subject: Option<&PolicySubject>,
        argc: i32,
        region: &mut R,
        start: u64,
        engine: &mut E,
    ) -> DecisionCode
    where
        R: ArgRegion + ?Sized,
        E: PolicyEngine + ?Sized,
    {
        let source = self.acquire_snapshot(region, start, argc);
        self.lookup(subject, argc, source, engine).decision
    }

    /// Lookup for platforms that read arguments lazily from the target. The argument
    /// vector is borrowed and never freed here.
    pub fn lookup_direct<V, E>(
        &self,
        subject: Option<&PolicySubject>,
        argc: i32,
        argv: &mut V,
        engine: &mut E,
    ) -> DecisionCode
    where
        V: ArgVector + ?Sized,
        E: PolicyEngine + ?Sized,
    {
        self.lookup(subject, argc, DirectSource::new(argv), engine)
            .decision
    }

    /// Validates the subject, builds a context over `source`, runs the engine and
    /// tears the context down. Fails closed: anything short of an engine verdict is
    /// [`DecisionCode::DENY`].
    pub fn lookup<S, E>(
        &self,
        subject: Option<&PolicySubject>,
        argc: i32,
        source: S,
        engine: &mut E,
    ) -> LookupOutcome<S>
    where
        S: ArgumentSource,
        E: PolicyEngine + ?Sized,
    {
        let Some(subject) = subject.filter(|s| s.is_well_formed()) else {
            warn!(argc, "denying execution of malformed policy subject");
            return LookupOutcome {
                decision: DecisionCode::DENY,
                source,
                evaluated: false,
            };
        };

        let mut ctx = DtmContext::new(
            subject,
            declared_argc(argc),
            source,
            self.classifier,
            &self.limits,
        );
        let decision = match engine.evaluate(&mut ctx) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(argc, error = %err, "policy engine failed; denying");
                DecisionCode::DENY
            }
        };
        debug!(
            decision = decision.0,
            materialized = ctx.materialized_count(),
            "lookup finished"
        );

        LookupOutcome {
            decision,
            source: ctx.into_source(),
            evaluated: true,
        }
    }
}
