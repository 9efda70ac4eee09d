//! End-to-end tests for the engine: submission lifecycle, worker pool
//! behaviour, queue positions, cancellation, and fault containment. The
//! sandbox is faked so the pipeline runs without any real isolation
//! backend; directives embedded in the submitted "source" tell the fake
//! how each attempt should behave.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use ctjudge_common::error::{QueryError, SubmitError};
use ctjudge_common::types::{
    Difficulty, Language, Problem, SubmissionMode, SubmissionStatus, TestCase, TestVisibility,
    VerdictKind,
};

use crate::engine::{EngineConfig, InMemoryProblems, JudgeEngine, ProblemRepository};
use crate::lang::{Invocation, LanguageRegistry};
use crate::sandbox::{ExecutionOutcome, ResourceLimits, Sandbox, SandboxSession};
use crate::store::CancelFlag;

const WAIT: Duration = Duration::from_secs(5);

/// Sandbox double. Directives in the source string:
///   "echo"          - every run echoes its stdin
///   "wrong-on:N"    - the Nth run call (1-based, compile excluded) answers WRONG
///   "compile-fail"  - compile invocations exit non-zero
///   "panic"         - the first run call panics
///   "gate"          - open() blocks until a permit is released
struct FakeSandbox {
    gate: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl FakeSandbox {
    fn new() -> Self {
        FakeSandbox {
            gate: Arc::new(Semaphore::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn open(&self, _source_file: &str, source: &str) -> Result<Box<dyn SandboxSession>> {
        if source.contains("gate") {
            let permit = self.gate.acquire().await?;
            permit.forget();
        }
        Ok(Box::new(FakeSession {
            directive: source.to_string(),
            run_calls: 0,
            running: Arc::clone(&self.running),
            max_running: Arc::clone(&self.max_running),
        }))
    }
}

struct FakeSession {
    directive: String,
    run_calls: u32,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxSession for FakeSession {
    async fn run(
        &mut self,
        invocation: &Invocation,
        stdin: &str,
        _limits: &ResourceLimits,
        _cancel: &CancelFlag,
    ) -> ExecutionOutcome {
        let compiling = invocation.program == "g++" || invocation.program == "javac";
        if compiling {
            if self.directive.contains("compile-fail") {
                return ExecutionOutcome::NonZeroExit {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "main.cpp:1:1: error: expected declaration".to_string(),
                    wall_time_ms: 40,
                    peak_memory_kb: 2048,
                };
            }
            return ExecutionOutcome::Success {
                stdout: String::new(),
                stderr: String::new(),
                wall_time_ms: 120,
                peak_memory_kb: 4096,
            };
        }

        self.run_calls += 1;
        if self.directive.contains("panic") {
            panic!("fake sandbox blew up");
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let wrong_here = self
            .directive
            .split("wrong-on:")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse::<u32>().ok())
            .map(|n| n == self.run_calls)
            .unwrap_or(false);

        ExecutionOutcome::Success {
            stdout: if wrong_here {
                "WRONG\n".to_string()
            } else {
                stdin.to_string()
            },
            stderr: String::new(),
            wall_time_ms: 10,
            peak_memory_kb: 1024,
        }
    }
}

/// Two sample tests followed by three hidden ones; every test expects its
/// own input echoed back.
fn echo_problem(id: u32) -> Problem {
    let tests = (1..=5)
        .map(|n| TestCase {
            input: format!("{n}\n"),
            expected_output: format!("{n}\n"),
            visibility: if n <= 2 {
                TestVisibility::Sample
            } else {
                TestVisibility::Hidden
            },
        })
        .collect();
    Problem {
        id,
        title: "Echo".to_string(),
        description: "Print the input verbatim.".to_string(),
        difficulty: Difficulty::Easy,
        category: "warmup".to_string(),
        constraints: vec![],
        time_limit_ms: 2000,
        memory_limit_mb: 256,
        supported_languages: vec![Language::Python, Language::Cpp],
        test_cases: tests,
    }
}

fn engine_with(worker_count: usize, sandbox: Arc<FakeSandbox>) -> JudgeEngine {
    let problems: Arc<dyn ProblemRepository> =
        Arc::new(InMemoryProblems::new(vec![echo_problem(1)]));
    JudgeEngine::new(
        EngineConfig { worker_count },
        problems,
        LanguageRegistry::defaults(),
        sandbox,
    )
}

#[tokio::test]
async fn correct_submission_is_accepted() {
    let engine = engine_with(2, Arc::new(FakeSandbox::new()));
    let receipt = engine
        .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();

    let record = engine
        .wait_until_done(receipt.submission_id, WAIT)
        .await
        .unwrap();
    assert_eq!(record.status, SubmissionStatus::Done);
    assert_eq!(record.result, Some(VerdictKind::Accepted));
    assert_eq!(record.passed_tests, 5);
    assert_eq!(record.total_tests, 5);
    assert!(!record.has_error);
    // per-test details cover samples only
    assert_eq!(record.details.len(), 2);
}

#[tokio::test]
async fn wrong_answer_on_hidden_test_stays_hidden() {
    let engine = engine_with(2, Arc::new(FakeSandbox::new()));
    let receipt = engine
        .submit_job(
            1,
            Language::Python,
            "echo wrong-on:4".to_string(),
            SubmissionMode::Submit,
        )
        .await
        .unwrap();

    let record = engine
        .wait_until_done(receipt.submission_id, WAIT)
        .await
        .unwrap();
    assert_eq!(record.result, Some(VerdictKind::WrongAnswer));
    assert_eq!(record.passed_tests, 4);
    assert_eq!(record.total_tests, 5);
    assert!(!record.has_error);
    // hidden inputs and outputs never appear in the record
    assert!(record.details.iter().all(|d| d.test_case < 2));
}

#[tokio::test]
async fn run_mode_executes_samples_only() {
    let engine = engine_with(2, Arc::new(FakeSandbox::new()));
    let receipt = engine
        .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Run)
        .await
        .unwrap();

    let record = engine
        .wait_until_done(receipt.submission_id, WAIT)
        .await
        .unwrap();
    assert_eq!(record.result, Some(VerdictKind::Accepted));
    assert_eq!(record.total_tests, 2);
    assert_eq!(record.details.len(), 2);
}

#[tokio::test]
async fn compile_failure_short_circuits() {
    let engine = engine_with(2, Arc::new(FakeSandbox::new()));
    let receipt = engine
        .submit_job(1, Language::Cpp, "compile-fail".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();

    let record = engine
        .wait_until_done(receipt.submission_id, WAIT)
        .await
        .unwrap();
    assert_eq!(record.result, Some(VerdictKind::CompilationError));
    assert_eq!(record.passed_tests, 0);
    assert_eq!(record.total_tests, 5);
    assert!(record.has_error);
    assert!(record
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("error"));
}

#[tokio::test]
async fn grading_panic_becomes_internal_error_and_worker_survives() {
    let engine = engine_with(1, Arc::new(FakeSandbox::new()));
    let bad = engine
        .submit_job(1, Language::Python, "panic".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();
    let record = engine.wait_until_done(bad.submission_id, WAIT).await.unwrap();
    assert_eq!(record.result, Some(VerdictKind::InternalError));
    assert!(record.has_error);
    // generic message, no sandbox internals leaked
    if let Some(msg) = &record.error_message {
        assert!(!msg.contains("blew up"));
    }

    // the single worker must still be serving
    let good = engine
        .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();
    let record = engine.wait_until_done(good.submission_id, WAIT).await.unwrap();
    assert_eq!(record.result, Some(VerdictKind::Accepted));
}

#[tokio::test]
async fn queue_positions_shrink_as_jobs_dispatch() {
    let sandbox = Arc::new(FakeSandbox::new());
    let engine = engine_with(1, Arc::clone(&sandbox));

    let mut receipts = Vec::new();
    for _ in 0..3 {
        receipts.push(
            engine
                .submit_job(1, Language::Python, "echo gate".to_string(), SubmissionMode::Submit)
                .await
                .unwrap(),
        );
    }
    // first job is dispatched immediately and blocks in open()
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = engine.get_status(receipts[1].submission_id).unwrap();
    let third = engine.get_status(receipts[2].submission_id).unwrap();
    assert_eq!(second.status, SubmissionStatus::Queued);
    assert_eq!(second.queue_position, Some(1));
    assert_eq!(third.queue_position, Some(2));

    // release the running job; the queue advances in order
    sandbox.gate.add_permits(1);
    let first = engine
        .wait_until_done(receipts[0].submission_id, WAIT)
        .await
        .unwrap();
    assert_eq!(first.result, Some(VerdictKind::Accepted));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let third = engine.get_status(receipts[2].submission_id).unwrap();
    assert_eq!(third.queue_position, Some(1));

    sandbox.gate.add_permits(2);
    for receipt in &receipts[1..] {
        engine.wait_until_done(receipt.submission_id, WAIT).await.unwrap();
    }
}

#[tokio::test]
async fn concurrency_is_bounded_by_worker_count() {
    let sandbox = Arc::new(FakeSandbox::new());
    let engine = engine_with(2, Arc::clone(&sandbox));

    let mut receipts = Vec::new();
    for _ in 0..6 {
        receipts.push(
            engine
                .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Submit)
                .await
                .unwrap(),
        );
    }
    for receipt in &receipts {
        engine.wait_until_done(receipt.submission_id, WAIT).await.unwrap();
    }
    assert!(sandbox.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn cancel_while_queued_yields_cancelled_verdict() {
    let sandbox = Arc::new(FakeSandbox::new());
    let engine = engine_with(1, Arc::clone(&sandbox));

    let blocker = engine
        .submit_job(1, Language::Python, "echo gate".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();
    let victim = engine
        .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel(victim.submission_id).unwrap();
    sandbox.gate.add_permits(1);

    engine.wait_until_done(blocker.submission_id, WAIT).await.unwrap();
    let record = engine.wait_until_done(victim.submission_id, WAIT).await.unwrap();
    assert_eq!(record.result, Some(VerdictKind::Cancelled));
    assert!(record.has_error);
    assert_eq!(record.passed_tests, 0);
}

#[tokio::test]
async fn cancel_after_done_is_ignored() {
    let engine = engine_with(1, Arc::new(FakeSandbox::new()));
    let receipt = engine
        .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();
    let before = engine.wait_until_done(receipt.submission_id, WAIT).await.unwrap();

    engine.cancel(receipt.submission_id).unwrap();
    let after = engine.get_result(receipt.submission_id).unwrap();
    assert_eq!(after.result, before.result);
    assert_eq!(after.completed_at, before.completed_at);
}

#[tokio::test]
async fn result_queries_follow_lifecycle() {
    let sandbox = Arc::new(FakeSandbox::new());
    let engine = engine_with(1, Arc::clone(&sandbox));

    let unknown = uuid::Uuid::new_v4();
    assert_eq!(engine.get_result(unknown).unwrap_err(), QueryError::NotFound(unknown));

    let receipt = engine
        .submit_job(1, Language::Python, "echo gate".to_string(), SubmissionMode::Submit)
        .await
        .unwrap();
    assert_eq!(
        engine.get_result(receipt.submission_id).unwrap_err(),
        QueryError::NotReady(receipt.submission_id)
    );

    sandbox.gate.add_permits(1);
    let first = engine.wait_until_done(receipt.submission_id, WAIT).await.unwrap();
    let second = engine.get_result(receipt.submission_id).unwrap();
    assert_eq!(first.result, second.result);
    assert_eq!(first.completed_at, second.completed_at);
}

#[tokio::test]
async fn submit_validation_rejects_bad_requests() {
    let engine = engine_with(1, Arc::new(FakeSandbox::new()));

    let err = engine
        .submit_job(999, Language::Python, "echo".to_string(), SubmissionMode::Submit)
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::InvalidProblem(999));

    // problem 1 supports Python and C++ only
    let err = engine
        .submit_job(1, Language::Java, "echo".to_string(), SubmissionMode::Submit)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SubmitError::UnsupportedLanguageForProblem {
            problem_id: 1,
            language: Language::Java,
        }
    );
}

#[tokio::test]
async fn shutdown_drains_queued_work_and_stops_intake() {
    let engine = engine_with(2, Arc::new(FakeSandbox::new()));

    let mut receipts = Vec::new();
    for _ in 0..4 {
        receipts.push(
            engine
                .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Submit)
                .await
                .unwrap(),
        );
    }
    engine.shutdown().await;

    for receipt in &receipts {
        let record = engine.get_result(receipt.submission_id).unwrap();
        assert_eq!(record.result, Some(VerdictKind::Accepted));
    }

    let err = engine
        .submit_job(1, Language::Python, "echo".to_string(), SubmissionMode::Submit)
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::ShuttingDown);
}
