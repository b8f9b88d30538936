use dtm_core::{DecisionCode, EngineError, ExecContext, PolicyEngine, SourceVariant};

/// What the engine saw while evaluating one execution.
#[derive(Debug, Clone)]
pub struct Observation {
    pub variant: SourceVariant,
    /// One entry per queryable slot; `None` when the argument was unavailable.
    pub args: Vec<Option<Vec<u8>>>,
    pub program_name: Vec<u8>,
    pub stdin_mode: &'static str,
    pub stdin_mode_bit: u32,
    pub materialized: usize,
    pub total_raw_bytes: usize,
    pub total_copied_bytes: usize,
}

/// Queries everything a context offers, records it and answers with a fixed
/// verdict.
pub struct RecordingEngine {
    verdict: DecisionCode,
    observation: Option<Observation>,
}

impl RecordingEngine {
    pub fn new(verdict: DecisionCode) -> Self {
        RecordingEngine {
            verdict,
            observation: None,
        }
    }

    /// `None` when the lookup never reached the engine.
    pub fn into_observation(self) -> Option<Observation> {
        self.observation
    }
}

impl PolicyEngine for RecordingEngine {
    fn evaluate(&mut self, ctx: &mut dyn ExecContext) -> Result<DecisionCode, EngineError> {
        let args = (0..ctx.argc_bound())
            .map(|i| ctx.get_argument(i).map(<[u8]>::to_vec))
            .collect();
        let program_name = ctx.get_program_name().to_vec();
        let stdin_mode = ctx.get_stdin_mode();
        let stdin_mode_bit = ctx.get_stdin_mode_bit().bits();

        self.observation = Some(Observation {
            variant: ctx.source_variant(),
            args,
            program_name,
            stdin_mode,
            stdin_mode_bit,
            materialized: ctx.materialized_count(),
            total_raw_bytes: ctx.total_raw_bytes(),
            total_copied_bytes: ctx.total_copied_bytes(),
        });
        Ok(self.verdict)
    }
}
