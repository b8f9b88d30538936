use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use dtm_core::source::resolve_variant;
use dtm_core::{
    DecisionCode, DirectSource, FdMode, FdModeClassifier, FixedClassifier, Gatekeeper, Limits,
    PolicySubject, SliceArgv, SliceRegion, SourceVariant, TaskInfo,
};

mod engine;
mod report;

use engine::RecordingEngine;

#[derive(Parser)]
#[command(name = "dtm-probe")]
#[command(about = "Runs one DTM lookup over an argument vector and reports what the policy engine saw.", long_about = None)]
struct Cli {
    /// Limits JSON file (falls back to $DTM_LIMITS, then built-in defaults).
    #[arg(long, value_name = "PATH")]
    limits: Option<PathBuf>,

    /// Argument source (falls back to $DTM_VARIANT, then snapshot).
    #[arg(long, value_enum)]
    variant: Option<SourceVariant>,

    /// Read the argument vector of a running process from /proc/<pid>/cmdline.
    #[arg(long)]
    pid: Option<u32>,

    /// Block size the snapshot reader copies with.
    #[arg(long, default_value_t = 4096)]
    block_size: usize,

    #[arg(long, value_enum, default_value_t = Verdict::Allow)]
    decision: Verdict,

    /// Report this stdin mode instead of classifying the real descriptor.
    #[arg(long, value_name = "MODE")]
    stdin_mode: Option<FdMode>,

    /// Run the lookup without a policy subject.
    #[arg(long)]
    no_subject: bool,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    fn code(self) -> DecisionCode {
        match self {
            Verdict::Allow => DecisionCode::ALLOW,
            Verdict::Deny => DecisionCode::DENY,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let limits = Limits::resolve(cli.limits.as_deref())?;
    let variant = resolve_variant(cli.variant)?;
    if cli.block_size == 0 {
        anyhow::bail!("--block-size must be >= 1");
    }

    let args = match cli.pid {
        Some(pid) => read_cmdline(pid)?,
        None => cli
            .args
            .into_iter()
            .map(OsString::into_encoded_bytes)
            .collect(),
    };
    let argc = i32::try_from(args.len()).context("argument count does not fit in an i32")?;

    let subject = (!cli.no_subject).then(|| current_subject(cli.pid));
    let classifier = classifier(cli.stdin_mode);
    let gk = Gatekeeper::new(limits, &*classifier);
    let mut engine = RecordingEngine::new(cli.decision.code());

    let (decision, blob) = match variant {
        SourceVariant::Snapshot => {
            let region_bytes = nul_terminated(&args);
            let mut region = SliceRegion::new(&region_bytes, cli.block_size);
            let source = gk.acquire_snapshot(&mut region, 0, argc);
            let outcome = gk.lookup(subject.as_ref(), argc, source, &mut engine);
            (outcome.decision, outcome.source.into_blob())
        }
        SourceVariant::Direct => {
            let mut argv = SliceArgv::new(args);
            let outcome = gk.lookup(
                subject.as_ref(),
                argc,
                DirectSource::new(&mut argv),
                &mut engine,
            );
            (outcome.decision, None)
        }
    };

    let observation = engine.into_observation();
    let json = report::report_json(variant, argc, decision, observation.as_ref(), blob.as_ref());
    println!("{}", serde_json::to_string_pretty(&json)?);

    let exit_code: u8 = if decision.is_allow() { 0 } else { 1 };
    Ok(ExitCode::from(exit_code))
}

fn classifier(stdin_mode: Option<FdMode>) -> Box<dyn FdModeClassifier> {
    match stdin_mode {
        Some(mode) => Box::new(FixedClassifier::new(mode)),
        #[cfg(unix)]
        None => Box::new(dtm_core::FstatClassifier),
        #[cfg(not(unix))]
        None => Box::new(FixedClassifier::default()),
    }
}

/// Subject for the probed process, or for the probe itself when no pid was given.
fn current_subject(pid: Option<u32>) -> PolicySubject {
    #[cfg(unix)]
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    #[cfg(not(unix))]
    let uid = 0;

    PolicySubject::new(TaskInfo {
        pid: pid.unwrap_or_else(std::process::id),
        uid,
        comm: "dtm-probe".to_string(),
    })
}

/// Arguments of a running process. The kernel exposes them NUL-separated.
fn read_cmdline(pid: u32) -> Result<Vec<Vec<u8>>> {
    let path = format!("/proc/{pid}/cmdline");
    let bytes = std::fs::read(&path).with_context(|| format!("read {path}"))?;
    Ok(split_cmdline(&bytes))
}

fn split_cmdline(bytes: &[u8]) -> Vec<Vec<u8>> {
    let body = bytes.strip_suffix(b"\0").unwrap_or(bytes);
    if body.is_empty() {
        return Vec::new();
    }
    body.split(|&b| b == 0).map(<[u8]>::to_vec).collect()
}

/// Lays arguments out the way a new process's argument region holds them.
fn nul_terminated(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(args.iter().map(|a| a.len() + 1).sum());
    for arg in args {
        out.extend_from_slice(arg);
        out.push(0);
    }
    out
}
