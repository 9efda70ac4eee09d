/// Grader - Language-Agnostic Verdict Logic
///
/// **Core Responsibility:**
/// Drive one submission through compile + ordered test execution and
/// aggregate the outcomes into a single verdict.
///
/// **Critical Properties:**
/// - Knows nothing about processes or containers (that is the sandbox)
/// - Knows nothing about queues or workers (that is the scheduler)
/// - Deterministic: the same outcomes always produce the same verdict
///
/// **Comparison Policy (explicit, so results are reproducible):**
/// - Trailing whitespace per line: ignored
/// - Trailing blank lines: ignored
/// - Line ending differences (\n vs \r\n): ignored
/// - Leading and internal whitespace: significant
/// - Case: significant
/// - Floating-point tolerance: none; numeric fuzziness is a test-authoring
///   concern, not the grader's
use std::sync::Arc;

use tracing::{error, info, warn};

use ctjudge_common::types::{
    JudgeVerdict, Problem, SubmissionMode, TestDetail, VerdictKind,
};

use crate::lang::RuntimePlan;
use crate::sandbox::{ExecutionOutcome, ResourceLimits, Sandbox};
use crate::store::CancelFlag;

/// Fixed bounds for the compile step; compilation is judge overhead and is
/// not charged against the problem's limits.
const COMPILE_TIME_LIMIT_MS: u64 = 15_000;
const COMPILE_MEMORY_KB: u64 = 1024 * 1024;

/// How much compiler output a user may see.
const MAX_COMPILE_MESSAGE_BYTES: usize = 8 * 1024;

/// Per-test classification, before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestOutcome {
    Passed,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    InternalError,
}

impl TestOutcome {
    /// Priority of the disqualifying condition when aggregating across
    /// tests: internal failures first, then runtime error, then time, then
    /// memory, then wrong answer.
    fn severity(self) -> u8 {
        match self {
            TestOutcome::InternalError => 5,
            TestOutcome::RuntimeError => 4,
            TestOutcome::TimeLimitExceeded => 3,
            TestOutcome::MemoryLimitExceeded => 2,
            TestOutcome::WrongAnswer => 1,
            TestOutcome::Passed => 0,
        }
    }

    fn verdict_kind(self) -> VerdictKind {
        match self {
            TestOutcome::Passed => VerdictKind::Accepted,
            TestOutcome::WrongAnswer => VerdictKind::WrongAnswer,
            TestOutcome::RuntimeError => VerdictKind::RuntimeError,
            TestOutcome::TimeLimitExceeded => VerdictKind::TimeLimitExceeded,
            TestOutcome::MemoryLimitExceeded => VerdictKind::MemoryLimitExceeded,
            TestOutcome::InternalError => VerdictKind::InternalError,
        }
    }
}

/// Compare program output against the expected output under the documented
/// normalization policy.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    fn normalized(text: &str) -> Vec<&str> {
        let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
        while lines.last() == Some(&"") {
            lines.pop();
        }
        lines
    }
    normalized(actual) == normalized(expected)
}

/// Grade one submission end-to-end. Never returns an error: every failure
/// mode is folded into the verdict so the scheduler can always complete the
/// submission exactly once.
pub async fn grade(
    sandbox: Arc<dyn Sandbox>,
    plan: RuntimePlan,
    problem: Arc<Problem>,
    mode: SubmissionMode,
    source: String,
    cancel: CancelFlag,
) -> JudgeVerdict {
    let tests = problem.tests_for_mode(mode);
    let total_tests = tests.len() as u32;

    let mut session = match sandbox.open(&plan.source_file, &source).await {
        Ok(session) => session,
        Err(e) => {
            error!(problem_id = problem.id, error = %format!("{:#}", e), "failed to open sandbox session");
            return JudgeVerdict::internal_error(total_tests);
        }
    };

    // Compile once; a failure short-circuits every test case and is
    // reported exactly once, not per test.
    if let Some(compile) = &plan.compile {
        let compile_limits = ResourceLimits {
            wall_time_ms: COMPILE_TIME_LIMIT_MS,
            memory_kb: COMPILE_MEMORY_KB,
        };
        match session.run(compile, "", &compile_limits, &cancel).await {
            ExecutionOutcome::Success { .. } => {}
            ExecutionOutcome::NonZeroExit { stdout, stderr, .. } => {
                let message = if stderr.trim().is_empty() { stdout } else { stderr };
                return compilation_error(total_tests, truncate(&message, MAX_COMPILE_MESSAGE_BYTES));
            }
            ExecutionOutcome::TimeLimitExceeded { .. }
            | ExecutionOutcome::MemoryLimitExceeded { .. } => {
                return compilation_error(total_tests, "compilation exceeded resource limits".to_string());
            }
            ExecutionOutcome::Cancelled { .. } => {
                info!(problem_id = problem.id, "submission cancelled during compilation");
                return cancelled_verdict(0, total_tests, None, None, Vec::new());
            }
            ExecutionOutcome::InternalError { message } => {
                error!(problem_id = problem.id, message, "compile step failed inside sandbox");
                return JudgeVerdict::internal_error(total_tests);
            }
        }
    }

    let limits = ResourceLimits::from_problem(problem.time_limit_ms, problem.memory_limit_mb);

    let mut passed_tests = 0u32;
    let mut worst = TestOutcome::Passed;
    let mut max_time_ms: Option<u64> = None;
    let mut max_memory_kb: Option<u64> = None;
    let mut details = Vec::new();

    for (position, test) in &tests {
        if cancel.is_cancelled() {
            info!(problem_id = problem.id, "submission cancelled mid-grading");
            return cancelled_verdict(passed_tests, total_tests, max_time_ms, max_memory_kb, details);
        }

        let outcome = session.run(&plan.run, &test.input, &limits, &cancel).await;

        let (test_outcome, actual, time_ms, memory_kb) = match outcome {
            ExecutionOutcome::Success {
                stdout,
                wall_time_ms,
                peak_memory_kb,
                ..
            } => {
                let passed = outputs_match(&stdout, &test.expected_output);
                (
                    if passed {
                        TestOutcome::Passed
                    } else {
                        TestOutcome::WrongAnswer
                    },
                    stdout,
                    Some(wall_time_ms),
                    Some(peak_memory_kb),
                )
            }
            ExecutionOutcome::NonZeroExit {
                stdout,
                wall_time_ms,
                peak_memory_kb,
                ..
            } => (
                TestOutcome::RuntimeError,
                stdout,
                Some(wall_time_ms),
                Some(peak_memory_kb),
            ),
            ExecutionOutcome::TimeLimitExceeded { wall_time_ms } => (
                TestOutcome::TimeLimitExceeded,
                String::new(),
                Some(wall_time_ms),
                None,
            ),
            ExecutionOutcome::MemoryLimitExceeded {
                wall_time_ms,
                peak_memory_kb,
            } => (
                TestOutcome::MemoryLimitExceeded,
                String::new(),
                Some(wall_time_ms),
                Some(peak_memory_kb),
            ),
            ExecutionOutcome::Cancelled { .. } => {
                info!(problem_id = problem.id, "submission cancelled during a test attempt");
                return cancelled_verdict(
                    passed_tests,
                    total_tests,
                    max_time_ms,
                    max_memory_kb,
                    details,
                );
            }
            ExecutionOutcome::InternalError { message } => {
                error!(problem_id = problem.id, message, "test attempt failed inside sandbox");
                (TestOutcome::InternalError, String::new(), None, None)
            }
        };

        if test_outcome == TestOutcome::Passed {
            passed_tests += 1;
        } else if test_outcome != TestOutcome::WrongAnswer {
            warn!(
                problem_id = problem.id,
                test = position,
                outcome = ?test_outcome,
                "test failed with execution error"
            );
        }
        if test_outcome.severity() > worst.severity() {
            worst = test_outcome;
        }
        if let Some(t) = time_ms {
            max_time_ms = Some(max_time_ms.unwrap_or(0).max(t));
        }
        if let Some(m) = memory_kb {
            max_memory_kb = Some(max_memory_kb.unwrap_or(0).max(m));
        }

        // Hidden-test detail is never exposed, in either mode.
        if test.is_sample() {
            details.push(TestDetail {
                test_case: *position,
                passed: test_outcome == TestOutcome::Passed,
                execution_time_ms: time_ms.unwrap_or(0),
                input: test.input.clone(),
                expected: test.expected_output.clone(),
                actual,
            });
        }
    }

    let kind = if worst == TestOutcome::Passed && passed_tests == total_tests {
        VerdictKind::Accepted
    } else {
        worst.verdict_kind()
    };

    JudgeVerdict {
        kind,
        passed_tests,
        total_tests,
        has_error: kind.is_error(),
        execution_time_ms: max_time_ms,
        memory_used_kb: max_memory_kb,
        error_message: match kind {
            VerdictKind::InternalError => Some("internal judge error".to_string()),
            _ => None,
        },
        details,
    }
}

fn cancelled_verdict(
    passed_tests: u32,
    total_tests: u32,
    execution_time_ms: Option<u64>,
    memory_used_kb: Option<u64>,
    details: Vec<TestDetail>,
) -> JudgeVerdict {
    JudgeVerdict {
        kind: VerdictKind::Cancelled,
        passed_tests,
        total_tests,
        has_error: true,
        execution_time_ms,
        memory_used_kb,
        error_message: None,
        details,
    }
}

fn compilation_error(total_tests: u32, message: String) -> JudgeVerdict {
    JudgeVerdict {
        kind: VerdictKind::CompilationError,
        passed_tests: 0,
        total_tests,
        has_error: true,
        execution_time_ms: None,
        memory_used_kb: None,
        error_message: Some(message),
        details: Vec::new(),
    }
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
