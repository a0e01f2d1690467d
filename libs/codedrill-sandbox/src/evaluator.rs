/// Report Evaluator - Sandbox Output to ExecutionReport
///
/// **Core Responsibility:**
/// Turn one raw sandbox run into a well-formed `ExecutionReport`.
///
/// **Critical Properties:**
/// - Knows nothing about processes or containers
/// - Pure function: (fixtures, sentinel, raw output) → report
/// - Never drops a fixture: the report always has one outcome per fixture
///
/// **Precedence:**
/// 1. A payload that decodes cleanly wins, even if the child later died
/// 2. Resource limit breach (memory / CPU)
/// 3. Wall-clock timeout
/// 4. Anything else is a protocol failure carrying trimmed stderr

use crate::engine::{ResourceKind, SandboxOutput, SandboxStatus};
use crate::protocol::{self, DecodeFailure};
use codedrill_common::types::{ExecutionReport, FailureKind, SubmissionOutcome, TestFixture};
use std::time::Duration;
use tracing::debug;

pub const UNKNOWN_EXECUTION_ERROR: &str = "Unknown execution error";

pub fn timeout_message(timeout: Duration) -> String {
    format!("Time limit exceeded ({}s)", timeout.as_secs_f64().ceil() as u64)
}

pub fn resource_message(kind: ResourceKind, memory_mb: u64) -> String {
    match kind {
        ResourceKind::Memory => format!("Memory limit exceeded ({} MB)", memory_mb),
        ResourceKind::Cpu => "CPU time limit exceeded".to_string(),
    }
}

/// Message for a run that produced no usable payload.
pub fn protocol_message(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        UNKNOWN_EXECUTION_ERROR.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build a report where every fixture fails with the same message.
///
/// `actual` is empty for every outcome. A launch failure also lands in
/// `report.error`, marking the request as not evaluated at all.
pub fn uniform_failure(fixtures: &[&TestFixture], kind: FailureKind, message: &str) -> ExecutionReport {
    let outcomes: Vec<SubmissionOutcome> = fixtures
        .iter()
        .enumerate()
        .map(|(index, fixture)| SubmissionOutcome {
            fixture_index: index,
            passed: false,
            input: fixture.input.clone(),
            expected: fixture.expected.clone(),
            actual: String::new(),
            error: Some(message.to_string()),
            failure: Some(kind),
        })
        .collect();

    let mut report = ExecutionReport::from_outcomes(outcomes);
    report.failure = Some(kind);
    if kind == FailureKind::LaunchFailure {
        report.error = Some(message.to_string());
    }
    report
}

/// Evaluate one sandbox run.
///
/// ## Arguments
/// * `fixtures` - the fixtures the harness was built from, in order
/// * `sentinel` - the per-run sentinel of that harness
/// * `output` - raw sandbox output
/// * `timeout` / `memory_mb` - limits the run was held to, for messages
pub fn evaluate(
    fixtures: &[&TestFixture],
    sentinel: &str,
    output: &SandboxOutput,
    timeout: Duration,
    memory_mb: u64,
) -> ExecutionReport {
    let decoded = protocol::decode(&output.stdout, sentinel, fixtures.len());

    match (decoded, &output.status) {
        (Ok(outcomes), _) => ExecutionReport::from_outcomes(outcomes),
        (Err(_), SandboxStatus::LimitExceeded(kind)) => {
            uniform_failure(fixtures, FailureKind::ResourceLimit, &resource_message(*kind, memory_mb))
        }
        (Err(_), SandboxStatus::TimedOut) => {
            uniform_failure(fixtures, FailureKind::Timeout, &timeout_message(timeout))
        }
        (Err(failure), SandboxStatus::Completed { exit_code }) => {
            if let DecodeFailure::MalformedPayload(detail) = &failure {
                debug!(detail = %detail, "Result payload rejected");
            }
            debug!(exit_code = ?exit_code, "No usable result payload");
            uniform_failure(fixtures, FailureKind::ProtocolFailure, &protocol_message(&output.stderr))
        }
    }
}
