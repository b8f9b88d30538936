//! Per-execution-event context queried by the policy engine.

use tracing::debug;

use crate::fd_mode::{FdMode, FdModeClassifier};
use crate::limits::Limits;
use crate::lookup::PolicySubject;
use crate::source::{ArgTable, ArgumentSource, SourceVariant};

/// Program name reported when argument 0 is unavailable. Never owned by a context.
pub const DTM_UNKNOWN: &[u8] = b"<unknown>";

const STDIN_FD: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramName {
    Unresolved,
    /// Basename of the argument cached in slot 0.
    Argument0,
    Unknown,
}

/// Final path component of `path`, as a view into it.
pub fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Accessors available to a policy engine while it evaluates one execution.
pub trait ExecContext {
    fn subject(&self) -> &PolicySubject;

    fn source_variant(&self) -> SourceVariant;

    /// Argument count the new process was created with.
    fn declared_argc(&self) -> usize;

    /// Number of argument slots that can be queried.
    fn argc_bound(&self) -> usize;

    fn get_argument(&mut self, index: usize) -> Option<&[u8]>;

    fn get_program_name(&mut self) -> &[u8];

    fn get_stdin_mode_bit(&mut self) -> FdMode;

    fn get_stdin_mode(&mut self) -> &'static str;

    fn materialized_count(&self) -> usize;

    fn total_raw_bytes(&self) -> usize;

    fn total_copied_bytes(&self) -> usize;
}

pub struct DtmContext<'a, S> {
    subject: &'a PolicySubject,
    declared_argc: usize,
    source: S,
    table: ArgTable,
    program_name: ProgramName,
    stdin_mode_bit: Option<FdMode>,
    stdin_mode: Option<&'static str>,
    classifier: &'a dyn FdModeClassifier,
    limits: &'a Limits,
}

impl<'a, S: ArgumentSource> DtmContext<'a, S> {
    /// Creates an empty context. Nothing is read or allocated until an accessor
    /// asks for it.
    pub fn new(
        subject: &'a PolicySubject,
        declared_argc: usize,
        source: S,
        classifier: &'a dyn FdModeClassifier,
        limits: &'a Limits,
    ) -> Self {
        DtmContext {
            subject,
            declared_argc,
            source,
            table: ArgTable::default(),
            program_name: ProgramName::Unresolved,
            stdin_mode_bit: None,
            stdin_mode: None,
            classifier,
            limits,
        }
    }

    pub fn subject(&self) -> &PolicySubject {
        self.subject
    }

    pub fn declared_argc(&self) -> usize {
        self.declared_argc
    }

    pub fn argc_bound(&self) -> usize {
        self.limits.argc_bound(self.declared_argc)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Argument `index`, materializing it on first use. `None` when the index is
    /// out of bounds or the argument could not be obtained.
    pub fn get_argument(&mut self, index: usize) -> Option<&[u8]> {
        if index >= self.argc_bound() {
            return None;
        }
        if !self.table.is_cached(index) {
            let before = self.table.materialized();
            if let Err(err) = self
                .source
                .materialize(index, &mut self.table, self.limits)
            {
                debug!(
                    index,
                    variant = %self.source.variant(),
                    error = %err,
                    "argument unavailable"
                );
            }
            debug!(
                index,
                decoded = self.table.materialized() - before,
                "materialized arguments"
            );
        }
        self.table.get(index)
    }

    /// Basename of argument 0, or [`DTM_UNKNOWN`].
    pub fn get_program_name(&mut self) -> &[u8] {
        if self.program_name == ProgramName::Unresolved {
            self.program_name = match self.get_argument(0) {
                Some(_) => ProgramName::Argument0,
                None => ProgramName::Unknown,
            };
        }
        match self.program_name {
            ProgramName::Argument0 => self.table.get(0).map_or(DTM_UNKNOWN, basename),
            ProgramName::Unresolved | ProgramName::Unknown => DTM_UNKNOWN,
        }
    }

    pub fn get_stdin_mode_bit(&mut self) -> FdMode {
        *self
            .stdin_mode_bit
            .get_or_insert_with(|| self.classifier.classify(STDIN_FD))
    }

    pub fn get_stdin_mode(&mut self) -> &'static str {
        if let Some(name) = self.stdin_mode {
            return name;
        }
        let name = self.get_stdin_mode_bit().name();
        self.stdin_mode = Some(name);
        name
    }

    pub fn materialized_count(&self) -> usize {
        self.table.materialized()
    }

    pub fn total_raw_bytes(&self) -> usize {
        self.table.total_raw_bytes()
    }

    pub fn total_copied_bytes(&self) -> usize {
        self.table.total_copied_bytes()
    }

    /// Tears the context down, freeing every materialized argument. The source is
    /// dropped when `release_source` is set and handed back otherwise.
    pub fn destroy(self, release_source: bool) -> Option<S> {
        let source = self.into_source();
        if release_source {
            drop(source);
            None
        } else {
            Some(source)
        }
    }

    /// Frees every materialized argument and returns the source.
    pub fn into_source(self) -> S {
        let DtmContext {
            source, mut table, ..
        } = self;
        let freed = table.release();
        debug!(freed, "context destroyed");
        source
    }
}

impl<S: ArgumentSource> ExecContext for DtmContext<'_, S> {
    fn subject(&self) -> &PolicySubject {
        self.subject
    }

    fn source_variant(&self) -> SourceVariant {
        self.source.variant()
    }

    fn declared_argc(&self) -> usize {
        self.declared_argc
    }

    fn argc_bound(&self) -> usize {
        DtmContext::argc_bound(self)
    }

    fn get_argument(&mut self, index: usize) -> Option<&[u8]> {
        DtmContext::get_argument(self, index)
    }

    fn get_program_name(&mut self) -> &[u8] {
        DtmContext::get_program_name(self)
    }

    fn get_stdin_mode_bit(&mut self) -> FdMode {
        DtmContext::get_stdin_mode_bit(self)
    }

    fn get_stdin_mode(&mut self) -> &'static str {
        DtmContext::get_stdin_mode(self)
    }

    fn materialized_count(&self) -> usize {
        self.table.materialized()
    }

    fn total_raw_bytes(&self) -> usize {
        self.table.total_raw_bytes()
    }

    fn total_copied_bytes(&self) -> usize {
        self.table.total_copied_bytes()
    }
}
