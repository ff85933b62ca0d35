//! Runtime configuration.
//!
//! Everything is loadable from the environment (with a `.env` file honored
//! via dotenvy) and overridable from the CLI in `main`. Values carry sane
//! defaults so a bare `cwe-probe` run against `./projects` works.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::driver::{Disposition, RetryPolicy};
use crate::scanner::JudgeMode;

/// Execution mode of the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One phase per round; edits kept by default; High/Critical findings can
    /// terminate the project early.
    Standard,
    /// Two phases per round: a kept rename phase, then a scanned-and-reverted
    /// injection phase with skip-on-first-detection per target.
    ArtificialSuicide,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Standard => "standard",
            Mode::ArtificialSuicide => "artificial-suicide",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(Mode::Standard),
            "as" | "suicide" | "artificial-suicide" | "artificial_suicide" => {
                Ok(Mode::ArtificialSuicide)
            }
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Parse an environment variable, falling back to the default on absence or
/// a parse failure. Inline comments and surrounding whitespace are stripped
/// before parsing so annotated `.env` files work.
fn env_var_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => {
            let clean = val.split('#').next().unwrap_or("").trim();
            clean.parse::<T>().unwrap_or(default)
        }
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Directory holding one subdirectory per project, each with a prompt file.
    pub projects_dir: PathBuf,
    /// Root for statistics, backups, batch status, and the summary report.
    pub output_dir: PathBuf,
    /// Directory with the prompt template files.
    pub template_dir: PathBuf,

    pub mode: Mode,
    /// Weakness under test, e.g. "022".
    pub target_cwe: String,
    pub total_rounds: u32,
    /// How findings from multiple scanners combine into one verdict.
    pub judge_mode: JudgeMode,
    /// `name:program args...` specs, one per scanner.
    pub scanner_specs: Vec<String>,

    /// Automation helper process driving the host editor.
    pub helper_program: String,
    pub helper_args: Vec<String>,
    pub response_timeout_secs: u64,
    pub max_retries_per_prompt: u32,
    pub retry_base_delay_secs: u64,

    /// Re-verify each vicious pattern this many times before backing it up
    /// and setting the skip marker (artificial-suicide mode); 0 disables the
    /// verification pass.
    pub bait_verification_rounds: u32,
    /// Global cap on targets processed across the batch; 0 means unlimited.
    pub max_files_limit: u32,
    /// Standard mode: terminate a project early on a High/Critical finding.
    pub early_termination: bool,
    /// Disposition applied to the terminating round's edits.
    pub termination_disposition: Disposition,

    pub log_level: String,
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        // A missing .env file is fine; plain environment variables still apply.
        let _ = dotenvy::dotenv();

        Self {
            projects_dir: env_var_or("CWE_PROBE_PROJECTS_DIR", PathBuf::from("./projects")),
            output_dir: env_var_or("CWE_PROBE_OUTPUT_DIR", PathBuf::from("./output")),
            template_dir: env_var_or(
                "CWE_PROBE_TEMPLATE_DIR",
                PathBuf::from("./assets/prompt-template"),
            ),
            mode: env_var_or("CWE_PROBE_MODE", Mode::Standard),
            target_cwe: env_var_or("CWE_PROBE_TARGET_CWE", "022".to_string()),
            total_rounds: env_var_or("CWE_PROBE_TOTAL_ROUNDS", 3),
            judge_mode: env_var_or("CWE_PROBE_JUDGE_MODE", JudgeMode::Any),
            scanner_specs: env_var_or("CWE_PROBE_SCANNERS", String::new())
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            helper_program: env_var_or("CWE_PROBE_HELPER", "cwe-probe-helper".to_string()),
            helper_args: env_var_or("CWE_PROBE_HELPER_ARGS", String::new())
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            response_timeout_secs: env_var_or("CWE_PROBE_RESPONSE_TIMEOUT_SECS", 600),
            max_retries_per_prompt: env_var_or("CWE_PROBE_MAX_RETRIES_PER_PROMPT", 10),
            retry_base_delay_secs: env_var_or("CWE_PROBE_RETRY_BASE_DELAY_SECS", 2),
            bait_verification_rounds: env_var_or("CWE_PROBE_BAIT_VERIFICATION_ROUNDS", 0),
            max_files_limit: env_var_or("CWE_PROBE_MAX_FILES_LIMIT", 0),
            early_termination: env_var_or("CWE_PROBE_EARLY_TERMINATION", true),
            termination_disposition: env_var_or(
                "CWE_PROBE_TERMINATION_DISPOSITION",
                Disposition::Keep,
            ),
            log_level: env_var_or("CWE_PROBE_LOG_LEVEL", "info".to_string()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries_per_prompt,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("standard".parse::<Mode>().unwrap(), Mode::Standard);
        assert_eq!("AS".parse::<Mode>().unwrap(), Mode::ArtificialSuicide);
        assert_eq!(
            "artificial-suicide".parse::<Mode>().unwrap(),
            Mode::ArtificialSuicide
        );
        assert!("attack".parse::<Mode>().is_err());
    }

    #[test]
    fn env_var_or_falls_back_on_garbage() {
        std::env::set_var("CWE_PROBE_TEST_ROUNDS", "not-a-number");
        assert_eq!(env_var_or("CWE_PROBE_TEST_ROUNDS", 7u32), 7);
        std::env::remove_var("CWE_PROBE_TEST_ROUNDS");
    }

    #[test]
    fn env_var_or_strips_inline_comments() {
        std::env::set_var("CWE_PROBE_TEST_DELAY", "5 # seconds");
        assert_eq!(env_var_or("CWE_PROBE_TEST_DELAY", 0u64), 5);
        std::env::remove_var("CWE_PROBE_TEST_DELAY");
    }

    #[test]
    fn defaults_are_usable() {
        let cfg = ProbeConfig::from_env();
        assert!(cfg.total_rounds >= 1);
        assert_eq!(cfg.retry_policy().max_attempts, cfg.max_retries_per_prompt);
    }
}
