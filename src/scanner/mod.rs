//! Vulnerability scan adapters.
//!
//! The detection algorithms themselves are external tools; this module wraps
//! them behind the `Scanner` trait, normalizes their findings, and combines
//! results from several scanners into a per-round verdict.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Severity of a single reported weakness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and Critical findings can trigger early termination in standard mode.
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A single weakness instance reported by a scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Weakness identifier, e.g. "CWE-022".
    pub weakness_id: String,
    pub description: String,
    pub severity: Severity,
    /// Scanner confidence in [0, 1].
    pub confidence: f32,
    pub file: PathBuf,
    pub line: u32,
    /// Name of the scanner that produced this finding.
    pub scanner: String,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner `{0}` failed to launch: {1}")]
    Launch(String, #[source] std::io::Error),
    #[error("scanner `{scanner}` exited with status {status}")]
    NonZeroExit { scanner: String, status: i32 },
    #[error("scanner `{0}` produced unparseable output: {1}")]
    BadOutput(String, #[source] serde_json::Error),
}

/// Capability interface for an external vulnerability scanner.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    /// Scan one file and return all findings for it. Stateless.
    async fn scan(&self, file: &Path) -> Result<Vec<Finding>, ScanError>;
}

/// How findings from multiple scanners combine into one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JudgeMode {
    /// Any scanner reporting a finding counts as a finding.
    #[default]
    Any,
    /// Every configured scanner must report before the round counts as a finding.
    All,
}

impl FromStr for JudgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "or" => Ok(JudgeMode::Any),
            "all" | "and" => Ok(JudgeMode::All),
            other => Err(format!("unknown judge mode: {other}")),
        }
    }
}

/// Combined result of running every configured scanner against one file.
#[derive(Debug, Clone, Default)]
pub struct ScanVerdict {
    pub findings: Vec<Finding>,
    /// Finding count per scanner name, including zero-entries for scanners
    /// that ran cleanly. Scanners that failed are absent here.
    pub per_scanner: BTreeMap<String, usize>,
    /// Number of scanners that failed outright. Tracked separately so a
    /// scanner crash is never conflated with a clean result.
    pub scan_errors: usize,
}

impl ScanVerdict {
    /// Whether this verdict counts as "finding present" under the judge mode.
    ///
    /// A scanner that failed to run cannot vote: it contributes nothing under
    /// Any, and it defeats All, since "every configured scanner reported"
    /// cannot hold when one of them never produced a result.
    pub fn has_finding(&self, mode: JudgeMode) -> bool {
        if self.per_scanner.is_empty() {
            return false;
        }
        match mode {
            JudgeMode::Any => self.per_scanner.values().any(|&n| n > 0),
            JudgeMode::All => {
                self.scan_errors == 0 && self.per_scanner.values().all(|&n| n > 0)
            }
        }
    }

    pub fn has_blocking_finding(&self) -> bool {
        self.findings.iter().any(|f| f.severity.is_blocking())
    }

    /// True when no scanner produced a usable result at all.
    pub fn all_scanners_failed(&self) -> bool {
        self.per_scanner.is_empty() && self.scan_errors > 0
    }
}

/// Run all scanners against a file and merge their results.
///
/// An individual scanner failure is logged and counted but does not abort the
/// scan; the remaining scanners still contribute.
pub async fn run_scanners(scanners: &[Arc<dyn Scanner>], file: &Path) -> ScanVerdict {
    let mut verdict = ScanVerdict::default();

    for scanner in scanners {
        match scanner.scan(file).await {
            Ok(findings) => {
                debug!(
                    scanner = scanner.name(),
                    file = %file.display(),
                    count = findings.len(),
                    "scan complete"
                );
                verdict
                    .per_scanner
                    .insert(scanner.name().to_string(), findings.len());
                verdict.findings.extend(findings);
            }
            Err(e) => {
                warn!(scanner = scanner.name(), file = %file.display(), error = %e, "scan failed");
                verdict.scan_errors += 1;
            }
        }
    }

    verdict
}

// ============================================================================
// Command adapter
// ============================================================================

/// Raw finding shape emitted by external scanner tools on stdout.
#[derive(Debug, Deserialize)]
struct RawFinding {
    weakness_id: String,
    #[serde(default)]
    description: String,
    severity: Severity,
    #[serde(default = "default_confidence")]
    confidence: f32,
    file: PathBuf,
    #[serde(default)]
    line: u32,
}

fn default_confidence() -> f32 {
    0.5
}

/// Scanner adapter that shells out to an external tool.
///
/// The tool is invoked as `program args... <file>` and must print a JSON array
/// of findings on stdout. An empty array is a clean result.
pub struct CommandScanner {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandScanner {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    /// Parse a `name:program arg1 arg2` spec from configuration.
    pub fn from_spec(spec: &str) -> Option<Self> {
        let (name, rest) = spec.split_once(':')?;
        let mut parts = rest.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(
            name.trim(),
            program,
            parts.map(str::to_string).collect(),
        ))
    }
}

#[async_trait]
impl Scanner for CommandScanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, file: &Path) -> Result<Vec<Finding>, ScanError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ScanError::Launch(self.name.clone(), e))?;

        if !output.status.success() {
            return Err(ScanError::NonZeroExit {
                scanner: self.name.clone(),
                status: output.status.code().unwrap_or(-1),
            });
        }

        let raw: Vec<RawFinding> = serde_json::from_slice(&output.stdout)
            .map_err(|e| ScanError::BadOutput(self.name.clone(), e))?;

        Ok(raw
            .into_iter()
            .map(|r| Finding {
                weakness_id: r.weakness_id,
                description: r.description,
                severity: r.severity,
                confidence: r.confidence.clamp(0.0, 1.0),
                file: r.file,
                line: r.line,
                scanner: self.name.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScanner {
        name: &'static str,
        count: usize,
        fail: bool,
    }

    #[async_trait]
    impl Scanner for FixedScanner {
        fn name(&self) -> &str {
            self.name
        }

        async fn scan(&self, file: &Path) -> Result<Vec<Finding>, ScanError> {
            if self.fail {
                return Err(ScanError::NonZeroExit {
                    scanner: self.name.to_string(),
                    status: 2,
                });
            }
            Ok((0..self.count)
                .map(|i| Finding {
                    weakness_id: "CWE-022".into(),
                    description: "path traversal".into(),
                    severity: Severity::High,
                    confidence: 0.9,
                    file: file.to_path_buf(),
                    line: i as u32 + 1,
                    scanner: self.name.to_string(),
                })
                .collect())
        }
    }

    fn scanners(specs: &[(&'static str, usize, bool)]) -> Vec<Arc<dyn Scanner>> {
        specs
            .iter()
            .map(|&(name, count, fail)| {
                Arc::new(FixedScanner { name, count, fail }) as Arc<dyn Scanner>
            })
            .collect()
    }

    #[tokio::test]
    async fn judge_any_vs_all() {
        let set = scanners(&[("alpha", 2, false), ("beta", 0, false)]);
        let verdict = run_scanners(&set, Path::new("x.py")).await;

        assert!(verdict.has_finding(JudgeMode::Any));
        assert!(!verdict.has_finding(JudgeMode::All));
        assert_eq!(verdict.findings.len(), 2);
    }

    #[tokio::test]
    async fn all_mode_requires_every_scanner() {
        let set = scanners(&[("alpha", 1, false), ("beta", 3, false)]);
        let verdict = run_scanners(&set, Path::new("x.py")).await;

        assert!(verdict.has_finding(JudgeMode::All));
    }

    #[tokio::test]
    async fn crashed_scanner_defeats_all_mode() {
        // One scanner crashes, the other reports a finding: the crashed
        // scanner never voted, so the round is not an All-mode finding.
        let set = scanners(&[("alpha", 0, true), ("beta", 1, false)]);
        let verdict = run_scanners(&set, Path::new("x.py")).await;

        assert!(!verdict.has_finding(JudgeMode::All));
        assert!(verdict.has_finding(JudgeMode::Any));
        assert_eq!(verdict.scan_errors, 1);
    }

    #[tokio::test]
    async fn scanner_failure_is_not_a_clean_result() {
        let set = scanners(&[("alpha", 0, true)]);
        let verdict = run_scanners(&set, Path::new("x.py")).await;

        assert!(!verdict.has_finding(JudgeMode::Any));
        assert!(verdict.all_scanners_failed());
        assert_eq!(verdict.scan_errors, 1);
    }

    #[tokio::test]
    async fn surviving_scanner_still_counts_after_peer_failure() {
        let set = scanners(&[("alpha", 0, true), ("beta", 1, false)]);
        let verdict = run_scanners(&set, Path::new("x.py")).await;

        assert!(verdict.has_finding(JudgeMode::Any));
        assert!(!verdict.all_scanners_failed());
        assert_eq!(verdict.scan_errors, 1);
    }

    #[test]
    fn blocking_severities() {
        assert!(Severity::High.is_blocking());
        assert!(Severity::Critical.is_blocking());
        assert!(!Severity::Medium.is_blocking());
        assert!(!Severity::Low.is_blocking());
    }

    #[test]
    fn command_scanner_spec_parsing() {
        let s = CommandScanner::from_spec("bandit:/usr/bin/bandit-json --cwe 022").unwrap();
        assert_eq!(s.name(), "bandit");
        assert_eq!(s.program, "/usr/bin/bandit-json");
        assert_eq!(s.args, vec!["--cwe", "022"]);

        assert!(CommandScanner::from_spec("no-colon-here").is_none());
    }

    #[test]
    fn judge_mode_from_str() {
        assert_eq!("or".parse::<JudgeMode>().unwrap(), JudgeMode::Any);
        assert_eq!("AND".parse::<JudgeMode>().unwrap(), JudgeMode::All);
        assert!("maybe".parse::<JudgeMode>().is_err());
    }
}
