/// Judge Engine - process-wide context
///
/// Explicitly constructed, explicitly shut down: owns the problem lookup
/// capability, the language registry, the sandbox backend, the result
/// store, the FIFO scheduler, and the fixed worker pool. No ambient
/// singletons; callers hold a `JudgeEngine` and the API binary wraps it in
/// its `AppState`.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;

use ctjudge_common::error::{QueryError, SubmitError};
use ctjudge_common::types::{
    JudgeVerdict, Language, Problem, SubmissionMode, SubmissionRecord, SubmissionStatus,
};

use crate::grader;
use crate::lang::LanguageRegistry;
use crate::sandbox::Sandbox;
use crate::scheduler::{QueuedJob, Scheduler};
use crate::store::ResultStore;

/// Problem lookup capability, owned by a content-management collaborator.
#[async_trait]
pub trait ProblemRepository: Send + Sync {
    async fn fetch(&self, problem_id: u32) -> Option<Arc<Problem>>;
}

/// Fixed problem set held in memory; good enough for the API binary's demo
/// catalogue and for tests.
pub struct InMemoryProblems {
    problems: HashMap<u32, Arc<Problem>>,
}

impl InMemoryProblems {
    pub fn new(problems: Vec<Problem>) -> Self {
        InMemoryProblems {
            problems: problems.into_iter().map(|p| (p.id, Arc::new(p))).collect(),
        }
    }
}

#[async_trait]
impl ProblemRepository for InMemoryProblems {
    async fn fetch(&self, problem_id: u32) -> Option<Arc<Problem>> {
        self.problems.get(&problem_id).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size: the number of sandboxes the host can safely run
    /// concurrently. Parallelism is across submissions, never across the
    /// test cases of one submission.
    pub worker_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { worker_count: 4 }
    }
}

/// Receipt for an accepted submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitReceipt {
    pub submission_id: Uuid,
    pub queue_position: Option<u64>,
}

/// Live status snapshot for polling callers.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub status: SubmissionStatus,
    pub queue_position: Option<u64>,
}

struct EngineInner {
    problems: Arc<dyn ProblemRepository>,
    registry: LanguageRegistry,
    sandbox: Arc<dyn Sandbox>,
    store: ResultStore,
    scheduler: Scheduler,
    seqs: dashmap::DashMap<Uuid, u64>,
    sources: dashmap::DashMap<Uuid, String>,
}

pub struct JudgeEngine {
    inner: Arc<EngineInner>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JudgeEngine {
    pub fn new(
        config: EngineConfig,
        problems: Arc<dyn ProblemRepository>,
        registry: LanguageRegistry,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            problems,
            registry,
            sandbox,
            store: ResultStore::new(),
            scheduler: Scheduler::new(),
            seqs: dashmap::DashMap::new(),
            sources: dashmap::DashMap::new(),
        });

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let inner = Arc::clone(&inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_id)));
        }
        info!(worker_count = config.worker_count, "judge engine started");

        JudgeEngine {
            inner,
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Validate and enqueue one submission. Validation failures are
    /// synchronous and never create a submission.
    pub async fn submit_job(
        &self,
        problem_id: u32,
        language: Language,
        code: String,
        mode: SubmissionMode,
    ) -> Result<SubmitReceipt, SubmitError> {
        if self.inner.scheduler.is_closed() {
            return Err(SubmitError::ShuttingDown);
        }
        let problem = self
            .inner
            .problems
            .fetch(problem_id)
            .await
            .ok_or(SubmitError::InvalidProblem(problem_id))?;
        if !self.inner.registry.is_enabled(language) {
            return Err(SubmitError::InvalidLanguage(language));
        }
        if !problem.supports(language) {
            return Err(SubmitError::UnsupportedLanguageForProblem {
                problem_id,
                language,
            });
        }

        let submission_id = Uuid::new_v4();
        let record = SubmissionRecord::queued(submission_id, problem_id, language, mode, None);
        self.inner.store.insert_queued(record);
        self.inner.sources.insert(submission_id, code);

        match self.inner.scheduler.enqueue(submission_id) {
            Some((seq, position)) => {
                self.inner.seqs.insert(submission_id, seq);
                info!(
                    submission_id = %submission_id,
                    problem_id,
                    language = %language,
                    mode = ?mode,
                    queue_position = position,
                    "submission queued"
                );
                Ok(SubmitReceipt {
                    submission_id,
                    queue_position: Some(position),
                })
            }
            None => {
                self.inner.store.discard(submission_id);
                self.inner.sources.remove(&submission_id);
                Err(SubmitError::ShuttingDown)
            }
        }
    }

    pub fn get_status(&self, submission_id: Uuid) -> Result<StatusSnapshot, QueryError> {
        let record = self.inner.store.snapshot(submission_id)?;
        let queue_position = match record.status {
            SubmissionStatus::Queued => self
                .inner
                .seqs
                .get(&submission_id)
                .and_then(|seq| self.inner.scheduler.live_position(*seq)),
            _ => None,
        };
        Ok(StatusSnapshot {
            status: record.status,
            queue_position,
        })
    }

    /// Terminal record only. Repeated calls on a Done submission return
    /// identical values.
    pub fn get_result(&self, submission_id: Uuid) -> Result<SubmissionRecord, QueryError> {
        self.inner.store.result_of(submission_id)
    }

    /// Request cancellation of a queued or running submission. The
    /// submission still reaches Done (with verdict Cancelled) through its
    /// worker; finished submissions are unaffected.
    pub fn cancel(&self, submission_id: Uuid) -> Result<(), QueryError> {
        self.inner.store.request_cancel(submission_id)
    }

    /// Poll until the submission reaches Done or the timeout elapses.
    pub async fn wait_until_done(
        &self,
        submission_id: Uuid,
        timeout: Duration,
    ) -> Result<SubmissionRecord, QueryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.inner.store.result_of(submission_id) {
                Ok(record) => return Ok(record),
                Err(QueryError::NotReady(_)) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(QueryError::NotReady(submission_id));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn enabled_languages(&self) -> Vec<Language> {
        self.inner.registry.enabled_languages()
    }

    /// Stop intake and wait for the workers to drain the queue. In-flight
    /// submissions finish; nothing is left stuck in Running.
    pub async fn shutdown(&self) {
        self.inner.scheduler.close();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed during shutdown");
            }
        }
        info!("judge engine stopped");
    }
}

async fn worker_loop(inner: Arc<EngineInner>, worker_id: usize) {
    info!(worker_id, "worker started");
    while let Some(job) = inner.scheduler.dequeue().await {
        process_submission(&inner, job, worker_id).await;
    }
    info!(worker_id, "worker stopped");
}

/// Drive one submission from dispatch to Done. Every failure path ends in
/// `store.complete`; a grading panic is caught at the task boundary and
/// recorded as an internal error, so the worker survives and the
/// submission is never left in Running.
#[instrument(skip(inner, job), fields(submission_id = %job.submission_id))]
async fn process_submission(inner: &Arc<EngineInner>, job: QueuedJob, worker_id: usize) {
    let id = job.submission_id;
    let record = match inner.store.snapshot(id) {
        Ok(record) => record,
        Err(_) => {
            error!("dequeued submission has no record");
            return;
        }
    };

    inner.store.set_running(id);

    let cancel = inner.store.cancel_flag(id).unwrap_or_default();
    let source = inner
        .sources
        .remove(&id)
        .map(|(_, source)| source)
        .unwrap_or_default();
    inner.seqs.remove(&id);

    if cancel.is_cancelled() {
        info!("submission cancelled before grading");
        inner.store.complete(
            id,
            JudgeVerdict {
                kind: ctjudge_common::types::VerdictKind::Cancelled,
                passed_tests: 0,
                total_tests: 0,
                has_error: true,
                execution_time_ms: None,
                memory_used_kb: None,
                error_message: None,
                details: Vec::new(),
            },
        );
        return;
    }

    let problem = match inner.problems.fetch(record.problem_id).await {
        Some(problem) => problem,
        None => {
            // validated at submit time; losing it mid-flight is a harness fault
            error!(problem_id = record.problem_id, "problem vanished after enqueue");
            inner.store.complete(id, JudgeVerdict::internal_error(0));
            return;
        }
    };

    let plan = match inner.registry.plan(record.language) {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, "language plan unavailable after enqueue");
            inner.store.complete(
                id,
                JudgeVerdict::internal_error(problem.tests_for_mode(record.mode).len() as u32),
            );
            return;
        }
    };

    let total_tests = problem.tests_for_mode(record.mode).len() as u32;
    let started = std::time::Instant::now();

    let grading = tokio::spawn(grader::grade(
        Arc::clone(&inner.sandbox),
        plan,
        Arc::clone(&problem),
        record.mode,
        source,
        cancel,
    ));

    let verdict = match grading.await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(error = %e, "grading task panicked");
            JudgeVerdict::internal_error(total_tests)
        }
    };

    info!(
        verdict = ?verdict.kind,
        passed = verdict.passed_tests,
        total = verdict.total_tests,
        grading_ms = started.elapsed().as_millis() as u64,
        "submission completed"
    );
    inner.store.complete(id, verdict);
}
