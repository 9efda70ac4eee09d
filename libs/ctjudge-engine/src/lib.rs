//! Judging engine: language runtime planning, sandboxed execution,
//! grading, scheduling, and result storage for the judge backend.

pub mod docker;
pub mod engine;
pub mod grader;
pub mod lang;
pub mod sandbox;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod engine_tests;
