use uuid::Uuid;

use crate::types::Language;

/// Request-validation failures. Returned synchronously; a submission is
/// never created for these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown problem: {0}")]
    InvalidProblem(u32),

    #[error("language {0} is not enabled on this judge")]
    InvalidLanguage(Language),

    #[error("problem {problem_id} does not accept {language} submissions")]
    UnsupportedLanguageForProblem { problem_id: u32, language: Language },

    #[error("the judge is shutting down")]
    ShuttingDown,
}

/// Lookup failures for status/result queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("unknown submission: {0}")]
    NotFound(Uuid),

    #[error("submission {0} has not finished yet")]
    NotReady(Uuid),
}
