/// Test Orchestrator - High-Level Orchestration
///
/// **Responsibility:**
/// Drive one execution request through the pipeline and return a report:
/// 1. Policy pre-screen (short-circuits, sandbox never launched)
/// 2. Harness generation
/// 3. Sandbox run, bounded by a semaphore (`max_concurrent`)
/// 4. Evaluation of the raw output (evaluator.rs)
///
/// This module is the glue layer. It knows nothing about:
/// - How code executes (engine's job)
/// - How outcomes are decoded (protocol's job)
///
/// `SubmissionService` sits on top and resolves sessions and problems through
/// the store traits; lookup and persist failures are caller-level errors,
/// everything else degrades into a report.

use crate::docker::DockerEngine;
use crate::engine::{ProcessEngine, Sandbox, SandboxError, SandboxLimits};
use crate::evaluator;
use crate::harness::HarnessGenerator;
use crate::policy::Policy;
use anyhow::{Context, Result};
use codedrill_common::config::{SandboxBackend, SandboxSettings};
use codedrill_common::store::{ProblemSource, SessionRepository, StoreError};
use codedrill_common::types::{ExecutionReport, FailureKind, PolicyVerdict, Problem, Session, TestFixture};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub limits: SandboxLimits,
    pub max_source_bytes: usize,
    pub max_concurrent: usize,
    pub extra_blocked_modules: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            limits: SandboxLimits::default(),
            max_source_bytes: 64 * 1024,
            max_concurrent: 4,
            extra_blocked_modules: Vec::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            limits: SandboxLimits {
                timeout: Duration::from_secs(settings.timeout_seconds),
                memory_mb: settings.max_memory_mb,
                cpu_limit: settings.cpu_limit,
                max_processes: settings.max_processes,
                max_output_bytes: settings.max_output_bytes,
            },
            max_source_bytes: settings.max_source_bytes,
            max_concurrent: settings.max_concurrent,
            extra_blocked_modules: settings.extra_blocked_modules.clone(),
        }
    }
}

/// Pick the sandbox backend named in the settings.
pub fn build_sandbox(settings: &SandboxSettings) -> Result<Arc<dyn Sandbox>> {
    let sandbox: Arc<dyn Sandbox> = match settings.backend {
        SandboxBackend::Process => Arc::new(
            ProcessEngine::python(settings.python.clone()).with_network_isolation(settings.isolate_network),
        ),
        SandboxBackend::Docker => Arc::new(
            DockerEngine::connect(settings.docker_image.clone())
                .context("Failed to initialize Docker sandbox")?,
        ),
    };
    Ok(sandbox)
}

/// One run of a submission against an ordered set of fixtures.
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub source: &'a str,
    pub fixtures: Vec<&'a TestFixture>,
}

pub struct Executor {
    sandbox: Arc<dyn Sandbox>,
    policy: Policy,
    harness: HarnessGenerator,
    limits: SandboxLimits,
    permits: Semaphore,
}

impl Executor {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: ExecutorConfig) -> Result<Self> {
        let policy = Policy::new(&config.extra_blocked_modules, config.max_source_bytes)
            .context("Failed to compile blocked-capability rules")?;
        let harness = HarnessGenerator::new().context("Failed to prepare harness template")?;

        Ok(Self {
            sandbox,
            policy,
            harness,
            limits: config.limits,
            permits: Semaphore::new(config.max_concurrent.max(1)),
        })
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn check(&self, source: &str) -> PolicyVerdict {
        self.policy.check(source)
    }

    /// Run a request through the pipeline. Always returns a report with one
    /// outcome per fixture.
    #[instrument(skip(self, request), fields(engine = self.sandbox.name(), fixtures = request.fixtures.len()))]
    pub async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionReport {
        let fixtures = &request.fixtures;

        let verdict = self.policy.check(request.source);
        if verdict.blocked {
            let reason = verdict.reason.unwrap_or_default();
            info!(reason = %reason, "Submission rejected by policy");
            return evaluator::uniform_failure(fixtures, FailureKind::PolicyViolation, &reason);
        }

        if fixtures.is_empty() {
            return ExecutionReport::from_outcomes(Vec::new());
        }

        let unit = match self.harness.build(request.source, fixtures) {
            Ok(unit) => unit,
            Err(e) => {
                error!(error = %e, "Failed to build harness");
                let message = SandboxError::Launch(e.to_string()).to_string();
                return evaluator::uniform_failure(fixtures, FailureKind::LaunchFailure, &message);
            }
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                let message = SandboxError::Launch(e.to_string()).to_string();
                return evaluator::uniform_failure(fixtures, FailureKind::LaunchFailure, &message);
            }
        };

        let start = Instant::now();
        let report = match self.sandbox.run(&unit, &self.limits).await {
            Ok(output) => evaluator::evaluate(
                fixtures,
                &unit.sentinel,
                &output,
                self.limits.timeout,
                self.limits.memory_mb,
            ),
            Err(e) => {
                warn!(error = %e, "Sandbox could not be launched");
                evaluator::uniform_failure(fixtures, FailureKind::LaunchFailure, &e.to_string())
            }
        };

        info!(
            passed = report.passed_count(),
            total = report.outcomes.len(),
            failure = ?report.failure,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Execution finished"
        );
        report
    }

    /// Non-hidden fixtures only.
    pub async fn run_visible(&self, problem: &Problem, source: &str) -> ExecutionReport {
        self.execute(ExecutionRequest {
            source,
            fixtures: problem.visible_fixtures().collect(),
        })
        .await
    }

    /// Every fixture, hidden ones included.
    pub async fn run_full(&self, problem: &Problem, source: &str) -> ExecutionReport {
        self.execute(ExecutionRequest {
            source,
            fixtures: problem.test_cases.iter().collect(),
        })
        .await
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Session not found")]
    SessionNotFound(String),
    #[error("Problem not found")]
    ProblemNotFound(String),
    #[error("failed to load session: {0}")]
    Lookup(#[source] StoreError),
    #[error("failed to persist session: {0}")]
    Persist(#[source] StoreError),
}

pub struct SubmissionService {
    executor: Arc<Executor>,
    catalog: Arc<dyn ProblemSource>,
    sessions: Arc<dyn SessionRepository>,
}

impl SubmissionService {
    pub fn new(
        executor: Arc<Executor>,
        catalog: Arc<dyn ProblemSource>,
        sessions: Arc<dyn SessionRepository>,
    ) -> Self {
        Self {
            executor,
            catalog,
            sessions,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    fn resolve(&self, session_id: &str) -> Result<(Session, Arc<Problem>), ExecutionError> {
        let session = self
            .sessions
            .get_session(session_id)
            .map_err(ExecutionError::Lookup)?
            .ok_or_else(|| ExecutionError::SessionNotFound(session_id.to_string()))?;
        let problem = self
            .catalog
            .get_problem(&session.problem_id)
            .ok_or_else(|| ExecutionError::ProblemNotFound(session.problem_id.clone()))?;
        Ok((session, problem))
    }

    /// Run the session's current code against the visible fixtures. Nothing
    /// is persisted.
    #[instrument(skip(self))]
    pub async fn execute_run(&self, session_id: &str) -> Result<ExecutionReport, ExecutionError> {
        let (session, problem) = self.resolve(session_id)?;
        Ok(self.executor.run_visible(&problem, &session.code).await)
    }

    /// Run the full suite and record it on the session.
    ///
    /// The session is read again after the run so edits saved while the
    /// sandbox was busy are kept; only the submission fields are written.
    #[instrument(skip(self))]
    pub async fn execute_submit(&self, session_id: &str) -> Result<ExecutionReport, ExecutionError> {
        let (session, problem) = self.resolve(session_id)?;
        let report = self.executor.run_full(&problem, &session.code).await;

        let mut session = self
            .sessions
            .get_session(session_id)
            .map_err(ExecutionError::Lookup)?
            .ok_or_else(|| ExecutionError::SessionNotFound(session_id.to_string()))?;
        session.record_submission(&report);
        self.sessions
            .save_session(&session)
            .map_err(ExecutionError::Persist)?;

        info!(session_id = %session.id, passed = report.passed_count(), total = report.outcomes.len(), "Submission recorded");
        Ok(report)
    }
}
