#![forbid(unsafe_code)]

use bc_core::{DType, Shape};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CHECK_LOG_SCHEMA_VERSION: &str = "batchcheck.check-log.v1";

/// Default number of cases sampled from each parameter grid.
pub const DEFAULT_GENERATED_CASES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckLogEnv {
    pub rust_version: String,
    pub os: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CheckPhaseTimings {
    pub generate_ms: u64,
    pub reference_ms: u64,
    pub candidate_ms: u64,
    pub compare_ms: u64,
}

/// One structured record per batching check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckLogV1 {
    pub schema_version: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: u64,
    pub env: CheckLogEnv,
    pub outcome: CheckOutcome,
    pub duration_ms: u64,
    pub details: Option<String>,
    pub phase_timings: CheckPhaseTimings,
}

impl CheckLogV1 {
    #[must_use]
    pub fn new(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        seed: u64,
        outcome: CheckOutcome,
    ) -> Self {
        Self {
            schema_version: CHECK_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed,
            env: capture_env(),
            outcome,
            duration_ms: 0,
            details: None,
            phase_timings: CheckPhaseTimings::default(),
        }
    }
}

#[must_use]
pub fn capture_env() -> CheckLogEnv {
    CheckLogEnv {
        rust_version: rust_version(),
        os: std::env::consts::OS.to_owned(),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("BC_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

/// Global seed override from `BC_SEED`.
#[must_use]
pub fn seed_override() -> Option<u64> {
    std::env::var("BC_SEED")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

/// Deterministic seed for a named test: `BC_SEED` when set, otherwise the
/// first eight bytes of the SHA-256 digest of `test_id`.
#[must_use]
pub fn seed_for(test_id: &str) -> u64 {
    if let Some(seed) = seed_override() {
        return seed;
    }
    let digest = Sha256::digest(test_id.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// How many cases to sample from each grid (`BC_NUM_GENERATED_CASES`).
#[must_use]
pub fn generated_case_limit() -> usize {
    std::env::var("BC_NUM_GENERATED_CASES")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|&limit| limit > 0)
        .unwrap_or(DEFAULT_GENERATED_CASES)
}

/// Whether checks should emit a [`CheckLogV1`] record (`BC_CHECK_LOG`).
#[must_use]
pub fn check_log_enabled() -> bool {
    std::env::var_os("BC_CHECK_LOG").is_some_and(|raw| !raw.is_empty() && raw != "0")
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

/// Compact `dtype[d0,d1]` label used in case names.
#[must_use]
pub fn format_shape_dtype_string(shape: &Shape, dtype: DType) -> String {
    let dims: Vec<String> = shape.dims.iter().map(u32::to_string).collect();
    format!("{}[{}]", dtype.as_str(), dims.join(","))
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

fn rust_version() -> String {
    let output = Command::new("rustc").arg("--version").output();
    match output {
        Ok(result) if result.status.success() => {
            String::from_utf8_lossy(&result.stdout).trim().to_owned()
        }
        _ => "rustc <unknown>".to_owned(),
    }
}
