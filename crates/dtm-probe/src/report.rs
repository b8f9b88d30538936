use base64::Engine;
use dtm_contracts::DTM_PROBE_REPORT_SCHEMA_VERSION;
use dtm_core::{DecisionCode, SnapshotBlob, SourceVariant};
use sha2::{Digest, Sha256};

use crate::engine::Observation;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decision_str(decision: DecisionCode) -> &'static str {
    if decision.is_allow() {
        "allow"
    } else if decision.is_deny() {
        "deny"
    } else {
        "other"
    }
}

/// JSON report for one probe lookup. Observation fields are null when the engine
/// never ran; snapshot fields are null for the direct variant or a failed snapshot.
pub fn report_json(
    variant: SourceVariant,
    argc: i32,
    decision: DecisionCode,
    observation: Option<&Observation>,
    blob: Option<&SnapshotBlob>,
) -> serde_json::Value {
    let b64 = base64::engine::general_purpose::STANDARD;
    let args_b64: Option<Vec<Option<String>>> = observation.map(|o| {
        o.args
            .iter()
            .map(|a| a.as_ref().map(|bytes| b64.encode(bytes)))
            .collect()
    });

    serde_json::json!({
        "schema_version": DTM_PROBE_REPORT_SCHEMA_VERSION,
        "decision": decision_str(decision),
        "decision_code": decision.0,
        "variant": observation.map_or(variant, |o| o.variant).as_str(),
        "argc": argc,
        "engine_invoked": observation.is_some(),
        "program_name": observation.map(|o| String::from_utf8_lossy(&o.program_name).into_owned()),
        "args_b64": args_b64,
        "stdin_mode": observation.map(|o| o.stdin_mode),
        "stdin_mode_bit": observation.map(|o| o.stdin_mode_bit),
        "materialized": observation.map(|o| o.materialized),
        "total_raw_bytes": observation.map(|o| o.total_raw_bytes),
        "total_copied_bytes": observation.map(|o| o.total_copied_bytes),
        "snapshot_len": blob.map(SnapshotBlob::len),
        "snapshot_truncated": blob.map(SnapshotBlob::is_truncated),
        "snapshot_sha256": blob.map(|b| sha256_hex(b.as_bytes())),
    })
}
