//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable I/O (limits files read by the gatekeeper, reports
//! written by the probe).

pub const DTM_LIMITS_SCHEMA_VERSION: &str = "dtm.limits@0.1.0";
pub const DTM_PROBE_REPORT_SCHEMA_VERSION: &str = "dtm.probe.report@0.1.0";
