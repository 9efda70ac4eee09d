/// Language Runtime Adapter
///
/// **Core Responsibility:**
/// Turn (language, source code) into a concrete execution plan: which file
/// to write, an optional compile invocation, and the run invocation fed to
/// the sandbox once per test.
///
/// **Critical Architectural Boundary:**
/// - Adapters know commands and file names
/// - Adapters do NOT execute anything
/// - Adapters do NOT know scoring rules
///
/// Per-language behaviour is data keyed by the `Language` enum, not an
/// inheritance chain: a registry resolves the profile once at submission
/// time, and an unknown or disabled language fails before any resource is
/// allocated.
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use ctjudge_common::error::SubmitError;
use ctjudge_common::types::Language;

/// One program invocation, relative to the sandbox working directory.
/// `{source}` in the program or its arguments is replaced with the
/// submission's source file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Invocation {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn resolved(&self, source_file: &str) -> Invocation {
        Invocation {
            program: self.program.replace("{source}", source_file),
            args: self
                .args
                .iter()
                .map(|a| a.replace("{source}", source_file))
                .collect(),
        }
    }
}

/// Static description of how one language compiles and runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub name: String,
    pub source_file: String,
    #[serde(default)]
    pub compile: Option<Invocation>,
    pub run: Invocation,
}

/// Everything the grader needs to execute one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePlan {
    pub language: Language,
    pub source_file: String,
    pub compile: Option<Invocation>,
    pub run: Invocation,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesFile {
    languages: Vec<RuntimeProfile>,
}

/// Registry of enabled languages and their runtime profiles.
/// This is the authoritative source for which languages the judge accepts.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, RuntimeProfile>,
}

impl LanguageRegistry {
    /// Built-in profiles for every supported language.
    pub fn defaults() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            Language::Python,
            RuntimeProfile {
                name: "python".to_string(),
                source_file: "main.py".to_string(),
                compile: None,
                run: Invocation::new("python3", &["{source}"]),
            },
        );
        profiles.insert(
            Language::Javascript,
            RuntimeProfile {
                name: "javascript".to_string(),
                source_file: "main.js".to_string(),
                compile: None,
                run: Invocation::new("node", &["{source}"]),
            },
        );
        profiles.insert(
            Language::Cpp,
            RuntimeProfile {
                name: "cpp".to_string(),
                source_file: "main.cpp".to_string(),
                compile: Some(Invocation::new("g++", &["-O2", "-o", "main", "{source}"])),
                run: Invocation::new("./main", &[]),
            },
        );
        profiles.insert(
            Language::Java,
            RuntimeProfile {
                name: "java".to_string(),
                source_file: "Main.java".to_string(),
                compile: Some(Invocation::new("javac", &["{source}"])),
                run: Invocation::new("java", &["-cp", ".", "Main"]),
            },
        );
        LanguageRegistry { profiles }
    }

    /// Load profiles from a languages.json-style file. Unknown language
    /// names are rejected so a typo cannot silently disable a runtime.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self> {
        let file: LanguagesFile =
            serde_json::from_str(content).context("failed to parse languages config")?;

        let mut profiles = HashMap::new();
        for profile in file.languages {
            match Language::from_str(&profile.name) {
                Some(lang) => {
                    profiles.insert(lang, profile);
                }
                None => bail!("unknown language '{}' in languages config", profile.name),
            }
        }
        if profiles.is_empty() {
            bail!("languages config enables no languages");
        }
        Ok(LanguageRegistry { profiles })
    }

    /// Keep only the given languages enabled.
    pub fn restricted_to(mut self, languages: &[Language]) -> Self {
        self.profiles.retain(|lang, _| languages.contains(lang));
        self
    }

    pub fn is_enabled(&self, language: Language) -> bool {
        self.profiles.contains_key(&language)
    }

    pub fn enabled_languages(&self) -> Vec<Language> {
        let mut langs: Vec<Language> = self.profiles.keys().copied().collect();
        langs.sort_by_key(|l| l.to_string());
        langs
    }

    /// Resolve the execution plan for a submission. Fails fast with
    /// `InvalidLanguage` before any sandbox resource is touched.
    pub fn plan(&self, language: Language) -> Result<RuntimePlan, SubmitError> {
        let profile = self
            .profiles
            .get(&language)
            .ok_or(SubmitError::InvalidLanguage(language))?;

        Ok(RuntimePlan {
            language,
            source_file: profile.source_file.clone(),
            compile: profile
                .compile
                .as_ref()
                .map(|inv| inv.resolved(&profile.source_file)),
            run: profile.run.resolved(&profile.source_file),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_all_languages() {
        let registry = LanguageRegistry::defaults();
        for lang in Language::all() {
            assert!(registry.is_enabled(lang), "missing profile for {}", lang);
        }
    }

    #[test]
    fn test_plan_resolves_source_placeholder() {
        let registry = LanguageRegistry::defaults();

        let python = registry.plan(Language::Python).unwrap();
        assert!(python.compile.is_none());
        assert_eq!(python.run.program, "python3");
        assert_eq!(python.run.args, vec!["main.py"]);

        let cpp = registry.plan(Language::Cpp).unwrap();
        let compile = cpp.compile.unwrap();
        assert_eq!(compile.program, "g++");
        assert_eq!(compile.args, vec!["-O2", "-o", "main", "main.cpp"]);
        assert_eq!(cpp.run.program, "./main");
    }

    #[test]
    fn test_restricted_registry_rejects_disabled_language() {
        let registry = LanguageRegistry::defaults().restricted_to(&[Language::Python]);
        assert!(registry.is_enabled(Language::Python));
        assert_eq!(
            registry.plan(Language::Java),
            Err(SubmitError::InvalidLanguage(Language::Java))
        );
    }

    #[test]
    fn test_load_from_str() {
        let config = r#"{
            "languages": [
                {
                    "name": "python",
                    "source_file": "solution.py",
                    "run": { "program": "python3", "args": ["-u", "{source}"] }
                }
            ]
        }"#;
        let registry = LanguageRegistry::load_from_str(config).unwrap();
        let plan = registry.plan(Language::Python).unwrap();
        assert_eq!(plan.run.args, vec!["-u", "solution.py"]);
        assert!(!registry.is_enabled(Language::Cpp));
    }

    #[test]
    fn test_load_rejects_unknown_language() {
        let config = r#"{
            "languages": [
                {
                    "name": "cobol",
                    "source_file": "main.cob",
                    "run": { "program": "cobc", "args": ["{source}"] }
                }
            ]
        }"#;
        assert!(LanguageRegistry::load_from_str(config).is_err());
    }
}
