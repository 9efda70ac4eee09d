use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported programming languages.
///
/// Wire format is SCREAMING_SNAKE_CASE ("PYTHON", "CPP", ...); the lowercase
/// `Display` form is used for config lookup and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    Python,
    Java,
    Cpp,
    Javascript,
}

impl Language {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "python" => Some(Language::Python),
            "java" => Some(Language::Java),
            "cpp" | "c++" => Some(Language::Cpp),
            "javascript" | "js" => Some(Language::Javascript),
            _ => None,
        }
    }

    pub fn all() -> [Language; 4] {
        [
            Language::Python,
            Language::Java,
            Language::Cpp,
            Language::Javascript,
        ]
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Javascript => "javascript",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Whether a test case is shown to users (sample) or reserved for grading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestVisibility {
    Sample,
    Hidden,
}

/// A single test case. Identified by its position in the problem's ordered
/// test list; tests execute and report in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    pub visibility: TestVisibility,
}

impl TestCase {
    pub fn is_sample(&self) -> bool {
        self.visibility == TestVisibility::Sample
    }
}

/// A published problem. Immutable once published; owned by a content
/// collaborator outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: u32,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub category: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub supported_languages: Vec<Language>,
    pub test_cases: Vec<TestCase>,
}

impl Problem {
    pub fn supports(&self, language: Language) -> bool {
        self.supported_languages.contains(&language)
    }

    pub fn sample_test_count(&self) -> usize {
        self.test_cases.iter().filter(|t| t.is_sample()).count()
    }

    pub fn hidden_test_count(&self) -> usize {
        self.test_cases.len() - self.sample_test_count()
    }

    /// Ordered tests graded in the given mode: samples only for Run, the
    /// full list for Submit. Positions are indices into `test_cases`.
    pub fn tests_for_mode(&self, mode: SubmissionMode) -> Vec<(usize, &TestCase)> {
        self.test_cases
            .iter()
            .enumerate()
            .filter(|(_, t)| mode == SubmissionMode::Submit || t.is_sample())
            .collect()
    }
}

/// Run grades sample tests only; Submit grades the full hidden set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionMode {
    Run,
    Submit,
}

/// Submission lifecycle. Transitions are monotonic:
/// Queued -> Running -> Done, with Done terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Queued,
    Running,
    Done,
}

/// Terminal verdict classification. Exactly one is assigned when a
/// submission reaches Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Accepted,
    WrongAnswer,
    RuntimeError,
    CompilationError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    InternalError,
    Cancelled,
}

impl VerdictKind {
    /// True for verdicts caused by an execution failure rather than a
    /// plain output mismatch.
    pub fn is_error(&self) -> bool {
        !matches!(self, VerdictKind::Accepted | VerdictKind::WrongAnswer)
    }
}

/// Per-test outcome detail. Only ever populated for sample tests; hidden
/// tests contribute to the aggregate counters only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDetail {
    /// Position of the test in the problem's ordered list.
    pub test_case: usize,
    pub passed: bool,
    pub execution_time_ms: u64,
    pub input: String,
    pub expected: String,
    pub actual: String,
}

/// Aggregated grading result for one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeVerdict {
    pub kind: VerdictKind,
    pub passed_tests: u32,
    pub total_tests: u32,
    pub has_error: bool,
    /// Longest single-test wall time observed, if any test ran.
    pub execution_time_ms: Option<u64>,
    /// Largest single-test peak memory observed, if measured.
    pub memory_used_kb: Option<u64>,
    /// User-facing message (compile diagnostics, generic internal-error
    /// text). Never raw sandbox internals.
    pub error_message: Option<String>,
    pub details: Vec<TestDetail>,
}

impl JudgeVerdict {
    pub fn internal_error(total_tests: u32) -> Self {
        JudgeVerdict {
            kind: VerdictKind::InternalError,
            passed_tests: 0,
            total_tests,
            has_error: true,
            execution_time_ms: None,
            memory_used_kb: None,
            error_message: Some("internal judge error".to_string()),
            details: Vec::new(),
        }
    }
}

/// The engine-side record of one submission. Mutated only by the single
/// worker driving it; read-only to everyone once status is Done.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub submission_id: Uuid,
    pub problem_id: u32,
    pub language: Language,
    pub mode: SubmissionMode,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<VerdictKind>,
    pub passed_tests: u32,
    pub total_tests: u32,
    pub has_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    pub details: Vec<TestDetail>,
}

impl SubmissionRecord {
    pub fn queued(
        submission_id: Uuid,
        problem_id: u32,
        language: Language,
        mode: SubmissionMode,
        queue_position: Option<u64>,
    ) -> Self {
        SubmissionRecord {
            submission_id,
            problem_id,
            language,
            mode,
            status: SubmissionStatus::Queued,
            result: None,
            passed_tests: 0,
            total_tests: 0,
            has_error: false,
            execution_time_ms: None,
            memory_used_kb: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
            queue_position,
            details: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(input: &str, expected: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: expected.to_string(),
            visibility: TestVisibility::Sample,
        }
    }

    fn hidden(input: &str, expected: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: expected.to_string(),
            visibility: TestVisibility::Hidden,
        }
    }

    fn problem() -> Problem {
        Problem {
            id: 1,
            title: "Sum".to_string(),
            description: "Add two numbers".to_string(),
            difficulty: Difficulty::Easy,
            category: "math".to_string(),
            constraints: vec![],
            time_limit_ms: 1000,
            memory_limit_mb: 256,
            supported_languages: vec![Language::Python, Language::Cpp],
            test_cases: vec![
                sample("1 2", "3"),
                sample("2 2", "4"),
                hidden("5 5", "10"),
            ],
        }
    }

    #[test]
    fn test_counts_by_visibility() {
        let p = problem();
        assert_eq!(p.sample_test_count(), 2);
        assert_eq!(p.hidden_test_count(), 1);
    }

    #[test]
    fn test_tests_for_mode() {
        let p = problem();
        let run = p.tests_for_mode(SubmissionMode::Run);
        assert_eq!(run.len(), 2);
        assert_eq!(run[0].0, 0);
        assert_eq!(run[1].0, 1);

        let submit = p.tests_for_mode(SubmissionMode::Submit);
        assert_eq!(submit.len(), 3);
        assert_eq!(submit[2].0, 2);
    }

    #[test]
    fn test_language_round_trip() {
        for lang in Language::all() {
            assert_eq!(Language::from_str(&lang.to_string()), Some(lang));
        }
        assert_eq!(Language::from_str("cobol"), None);
    }

    #[test]
    fn test_language_wire_format() {
        assert_eq!(
            serde_json::to_string(&Language::Javascript).unwrap(),
            "\"JAVASCRIPT\""
        );
        assert_eq!(
            serde_json::to_string(&VerdictKind::WrongAnswer).unwrap(),
            "\"WRONG_ANSWER\""
        );
        assert_eq!(
            serde_json::to_string(&SubmissionStatus::Queued).unwrap(),
            "\"QUEUED\""
        );
    }

    #[test]
    fn test_verdict_error_flag() {
        assert!(!VerdictKind::Accepted.is_error());
        assert!(!VerdictKind::WrongAnswer.is_error());
        assert!(VerdictKind::TimeLimitExceeded.is_error());
        assert!(VerdictKind::CompilationError.is_error());
    }
}
