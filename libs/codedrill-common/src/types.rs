use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One test case attached to a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFixture {
    pub input: String,
    pub expected: String,
    #[serde(default)]
    pub is_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub title: String,
    pub category: String,
    pub difficulty: String,
    pub description: String,
    #[serde(default)]
    pub examples: Vec<serde_json::Value>,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub starter_code: String,
    pub test_cases: Vec<TestFixture>,
    #[serde(default = "default_time_limit_minutes")]
    pub time_limit_minutes: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_time_limit_minutes() -> u32 {
    30
}

impl Problem {
    pub fn visible_fixtures(&self) -> impl Iterator<Item = &TestFixture> {
        self.test_cases.iter().filter(|tc| !tc.is_hidden)
    }

    pub fn summary(&self) -> ProblemSummary {
        ProblemSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            category: self.category.clone(),
            difficulty: self.difficulty.clone(),
            tags: self.tags.clone(),
            time_limit_minutes: self.time_limit_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSummary {
    pub id: String,
    pub title: String,
    pub category: String,
    pub difficulty: String,
    pub tags: Vec<String>,
    pub time_limit_minutes: u32,
}

/// Category of a failing outcome.
///
/// Everything except `FixtureError` is request-wide: when it fires, every
/// fixture of the request receives the same failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PolicyViolation,
    Timeout,
    ResourceLimit,
    LaunchFailure,
    ProtocolFailure,
    FixtureError,
}

impl FailureKind {
    pub fn is_request_wide(self) -> bool {
        !matches!(self, FailureKind::FixtureError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceLimit => "resource_limit",
            FailureKind::LaunchFailure => "launch_failure",
            FailureKind::ProtocolFailure => "protocol_failure",
            FailureKind::FixtureError => "fixture_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub fixture_index: usize,
    pub passed: bool,
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

/// Result of one execution request. `all_passed` is derived from the
/// outcomes at construction and is vacuously true for an empty request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "results")]
    pub outcomes: Vec<SubmissionOutcome>,
    pub all_passed: bool,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ExecutionReport {
    pub fn from_outcomes(outcomes: Vec<SubmissionOutcome>) -> Self {
        let all_passed = outcomes.iter().all(|o| o.passed);
        Self {
            outcomes,
            all_passed,
            error: None,
            failure: None,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl PolicyVerdict {
    pub fn allowed() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    InProgress,
    Submitted,
    Scored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub problem_id: String,
    #[serde(default)]
    pub code: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_remaining_seconds: Option<u32>,
    #[serde(default)]
    pub test_results: Vec<SubmissionOutcome>,
    #[serde(default)]
    pub status: SessionStatus,
}

impl Session {
    pub fn new(problem: &Problem) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem_id: problem.id.clone(),
            code: problem.starter_code.clone(),
            started_at: Utc::now(),
            submitted_at: None,
            time_remaining_seconds: Some(problem.time_limit_minutes.saturating_mul(60)),
            test_results: Vec::new(),
            status: SessionStatus::InProgress,
        }
    }

    /// Records a full-suite report and moves the session to `Submitted`.
    pub fn record_submission(&mut self, report: &ExecutionReport) {
        self.test_results = report.outcomes.clone();
        self.status = SessionStatus::Submitted;
        self.submitted_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub code: Option<String>,
    pub time_remaining_seconds: Option<u32>,
    pub status: Option<SessionStatus>,
}

impl SessionUpdate {
    pub fn apply(self, session: &mut Session) {
        if let Some(code) = self.code {
            session.code = code;
        }
        if let Some(remaining) = self.time_remaining_seconds {
            session.time_remaining_seconds = Some(remaining);
        }
        if let Some(status) = self.status {
            session.status = status;
        }
    }
}
