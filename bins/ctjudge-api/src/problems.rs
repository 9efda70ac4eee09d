// Problem catalogue for the API binary: a small built-in demo set, with an
// optional JSON file override for deployments with a real problem bank.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use ctjudge_common::types::{Difficulty, Language, Problem, TestCase, TestVisibility};

pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<Problem>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
    let problems: Vec<Problem> =
        serde_json::from_str(&content).context("failed to parse problem set")?;
    anyhow::ensure!(!problems.is_empty(), "problem set is empty");
    Ok(problems)
}

pub fn demo_set() -> Vec<Problem> {
    vec![echo(), sum_two()]
}

fn echo() -> Problem {
    Problem {
        id: 1,
        title: "Echo".to_string(),
        description: "Read all of standard input and print it back unchanged.".to_string(),
        difficulty: Difficulty::Easy,
        category: "warmup".to_string(),
        constraints: vec!["Input is at most 1000 lines.".to_string()],
        time_limit_ms: 2000,
        memory_limit_mb: 256,
        supported_languages: vec![
            Language::Python,
            Language::Java,
            Language::Cpp,
            Language::Javascript,
        ],
        test_cases: vec![
            test("hello\n", "hello\n", TestVisibility::Sample),
            test("a\nb\nc\n", "a\nb\nc\n", TestVisibility::Sample),
            test("42\n", "42\n", TestVisibility::Hidden),
            test("\n", "\n", TestVisibility::Hidden),
            test("x y z\n", "x y z\n", TestVisibility::Hidden),
        ],
    }
}

fn sum_two() -> Problem {
    Problem {
        id: 2,
        title: "Sum of Two Numbers".to_string(),
        description: "Read two integers separated by whitespace and print their sum.".to_string(),
        difficulty: Difficulty::Easy,
        category: "math".to_string(),
        constraints: vec!["-10^9 <= a, b <= 10^9".to_string()],
        time_limit_ms: 2000,
        memory_limit_mb: 256,
        supported_languages: vec![
            Language::Python,
            Language::Java,
            Language::Cpp,
            Language::Javascript,
        ],
        test_cases: vec![
            test("1 2\n", "3\n", TestVisibility::Sample),
            test("0 0\n", "0\n", TestVisibility::Sample),
            test("-5 5\n", "0\n", TestVisibility::Hidden),
            test("1000000000 1000000000\n", "2000000000\n", TestVisibility::Hidden),
            test("-7 -13\n", "-20\n", TestVisibility::Hidden),
        ],
    }
}

fn test(input: &str, expected: &str, visibility: TestVisibility) -> TestCase {
    TestCase {
        input: input.to_string(),
        expected_output: expected.to_string(),
        visibility,
    }
}
