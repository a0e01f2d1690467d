/// Result Protocol Codec
///
/// The harness ends its run by writing one line to stdout:
///
/// ```text
/// <sentinel><json array of outcome records>
/// ```
///
/// Whatever the submission printed before that line is diagnostic noise.
/// Decoding is tolerant at the boundary (the sentinel may follow unterminated
/// user output on the same line) and strict inside the payload: a record set
/// that does not parse, has unknown fields, or does not cover every fixture in
/// order is rejected as a whole.

use codedrill_common::types::{FailureKind, SubmissionOutcome};
use serde::Deserialize;
use thiserror::Error;

const SENTINEL_PREFIX: &str = "__CODEDRILL_RESULTS_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    #[error("result sentinel not found in output")]
    MissingSentinel,
    #[error("malformed result payload: {0}")]
    MalformedPayload(String),
}

/// A per-run sentinel. The random part keeps submissions from forging the
/// result line.
pub fn new_sentinel() -> String {
    format!("{}{}__", SENTINEL_PREFIX, uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireOutcome {
    fixture_index: usize,
    passed: bool,
    input: String,
    expected: String,
    actual: String,
    error: Option<String>,
}

impl From<WireOutcome> for SubmissionOutcome {
    fn from(wire: WireOutcome) -> Self {
        let failure = wire.error.as_ref().map(|_| FailureKind::FixtureError);
        SubmissionOutcome {
            fixture_index: wire.fixture_index,
            passed: wire.passed,
            input: wire.input,
            expected: wire.expected,
            actual: wire.actual,
            error: wire.error,
            failure,
        }
    }
}

/// Extract the payload that follows the last sentinel occurrence, up to the
/// end of that line.
fn extract_payload<'a>(stdout: &'a str, sentinel: &str) -> Option<&'a str> {
    let start = stdout.rfind(sentinel)? + sentinel.len();
    let rest = &stdout[start..];
    let line = rest.split('\n').next().unwrap_or("");
    Some(line.trim_end_matches('\r'))
}

pub fn decode(
    stdout: &str,
    sentinel: &str,
    expected_len: usize,
) -> Result<Vec<SubmissionOutcome>, DecodeFailure> {
    let payload = extract_payload(stdout, sentinel).ok_or(DecodeFailure::MissingSentinel)?;

    let records: Vec<WireOutcome> = serde_json::from_str(payload)
        .map_err(|e| DecodeFailure::MalformedPayload(e.to_string()))?;

    if records.len() != expected_len {
        return Err(DecodeFailure::MalformedPayload(format!(
            "expected {} outcome records, found {}",
            expected_len,
            records.len()
        )));
    }

    records
        .into_iter()
        .enumerate()
        .map(|(position, record)| {
            if record.fixture_index != position {
                return Err(DecodeFailure::MalformedPayload(format!(
                    "record {} carries fixture_index {}",
                    position, record.fixture_index
                )));
            }
            Ok(SubmissionOutcome::from(record))
        })
        .collect()
}
