//! Round/phase orchestration state machine.
//!
//! One orchestrator drives one project at a time through
//! `SendPrompt -> AwaitResponse -> Scan -> Disposition -> Commit` rounds. In
//! standard mode each round is a single phase whose edits are kept; a
//! High/Critical finding can terminate the project early after the round's
//! bookkeeping. In artificial-suicide mode each round runs an identity phase
//! (rename, kept unconditionally) and an injection phase (scanned, then
//! reverted unconditionally), with skip-on-first-detection per target and a
//! vicious-pattern backup of the post-revert file state.
//!
//! Ordering guarantee for the injection phase: the revert is issued strictly
//! after every scan has consumed the file content and strictly before any
//! backup snapshot is read, so a snapshot always captures the pre-injection
//! (renamed but safe) state.

mod templates;

pub use templates::PromptTemplates;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::BackupManager;
use crate::config::Mode;
use crate::driver::{Disposition, DriverError, UiDriver};
use crate::identity::{self, IdentityRecord, Resolution};
use crate::project::{Project, Target};
use crate::scanner::{run_scanners, JudgeMode, ScanVerdict, Scanner};
use crate::stats::{RoundOutcome, StatsEngine};

/// How a project run ended. Consumed exhaustively by the batch runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectResult {
    /// Every configured round ran to completion.
    Completed,
    /// Processing stopped before the round limit for a policy reason:
    /// blocking finding in standard mode, or every target skipped or lost in
    /// artificial-suicide mode. Completed rounds are retained.
    TerminatedEarly(String),
    /// The run could not continue: commit failure, abort signal, or prompt
    /// delivery exhausted in every round. Completed rounds are retained.
    Failed(String),
}

/// Outcome of one project run plus the counters the batch summary needs.
#[derive(Debug)]
pub struct ProjectReport {
    pub result: ProjectResult,
    pub rounds_run: u32,
    /// Targets with at least one finding round.
    pub targets_with_findings: u32,
    pub backups_written: u32,
}

/// Per-round context threaded through the state machine. Phase results live
/// here, never in ambient shared state.
#[derive(Default)]
struct RoundContext {
    /// Prompts delivered successfully this round.
    delivered: u32,
    /// Targets whose injection scan found a vulnerability; their post-revert
    /// file state is snapshotted after the revert commit.
    pending_backups: Vec<(Target, ScanVerdict)>,
    /// A High/Critical finding was seen this round (standard mode).
    blocking_finding: bool,
}

pub struct Orchestrator {
    pub mode: Mode,
    pub total_rounds: u32,
    pub judge: JudgeMode,
    /// Weakness under test, e.g. "022".
    pub target_cwe: String,
    /// Standard mode: stop the project after a round with a High/Critical finding.
    pub early_termination: bool,
    /// Disposition for the terminating round's edits.
    pub termination_disposition: Disposition,
    /// Artificial-suicide mode: replay the injection prompt this many times
    /// against the reverted state and require a finding each time before a
    /// vicious pattern is backed up and its skip marker set; 0 disables the
    /// verification pass.
    pub bait_verification_rounds: u32,
    pub templates: PromptTemplates,
    pub scanners: Vec<Arc<dyn Scanner>>,
    pub output_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl Orchestrator {
    /// Run one project to completion, early termination, or failure.
    ///
    /// Statistics and backups are finalized on every exit path, so completed
    /// rounds are preserved even when the run ends early.
    pub async fn run_project(
        &self,
        project: &Project,
        driver: Arc<dyn UiDriver>,
    ) -> Result<ProjectReport> {
        info!(
            project = %project.name,
            mode = self.mode.as_str(),
            rounds = self.total_rounds,
            targets = project.targets.len(),
            "project started"
        );

        let mut stats = StatsEngine::new(self.mode, self.total_rounds);
        for target in &project.targets {
            stats.register(target.clone());
        }

        let project_out = self.output_dir.join(&project.name);
        let mut backup = BackupManager::new(project_out.join("vicious_pattern"));

        let (result, rounds_run) = match self.mode {
            Mode::Standard => self.run_standard(project, &driver, &mut stats).await,
            Mode::ArtificialSuicide => {
                self.run_suicide(project, &driver, &mut stats, &mut backup)
                    .await
            }
        };

        stats.finalize(&project_out).await?;
        backup.finalize().await?;

        let targets_with_findings = stats
            .rows()
            .iter()
            .filter(|r| r.first_finding.is_some())
            .count() as u32;

        info!(
            project = %project.name,
            result = ?result,
            rounds_run,
            targets_with_findings,
            backups = backup.written(),
            "project finished"
        );

        Ok(ProjectReport {
            result,
            rounds_run,
            targets_with_findings,
            backups_written: backup.written(),
        })
    }

    // ------------------------------------------------------------------
    // Standard mode: one phase per round, edits kept.
    // ------------------------------------------------------------------

    async fn run_standard(
        &self,
        project: &Project,
        driver: &Arc<dyn UiDriver>,
        stats: &mut StatsEngine,
    ) -> (ProjectResult, u32) {
        let mut responses: HashMap<Target, String> = HashMap::new();
        let mut dead_rounds = 0;

        for round in 1..=self.total_rounds {
            if self.cancel.is_cancelled() {
                return (ProjectResult::Failed("aborted".into()), round - 1);
            }

            let mut ctx = RoundContext::default();

            for target in &project.targets {
                let last = responses.get(target).map(String::as_str).unwrap_or("");
                let prompt = self
                    .templates
                    .query_prompt(round, target, &self.target_cwe, last);

                match deliver(driver, &prompt).await {
                    Ok(response) => {
                        ctx.delivered += 1;
                        responses.insert(target.clone(), response);
                    }
                    Err(e) => {
                        warn!(target = %target, round, error = %e, "prompt delivery failed");
                        record(stats, target, round, RoundOutcome::DeliveryFailed);
                        continue;
                    }
                }

                let verdict =
                    run_scanners(&self.scanners, &project.path.join(&target.file)).await;
                if verdict.has_blocking_finding() {
                    ctx.blocking_finding = true;
                }
                record(stats, target, round, classify(&verdict, self.judge));
            }

            // One disposition per phase. A blocking finding uses the
            // configured terminating disposition (keep by default, preserving
            // the transcript that induced it).
            let disposition = if ctx.blocking_finding {
                self.termination_disposition
            } else {
                Disposition::Keep
            };
            if let Err(e) = driver.commit(disposition).await {
                error!(project = %project.name, round, error = %e, "commit failed");
                return (ProjectResult::Failed(format!("commit failed: {e}")), round);
            }

            if ctx.delivered == 0 {
                dead_rounds += 1;
            }

            if ctx.blocking_finding && self.early_termination {
                info!(project = %project.name, round, "blocking finding, terminating early");
                return (
                    ProjectResult::TerminatedEarly(format!(
                        "high/critical finding in round {round}"
                    )),
                    round,
                );
            }

            if self.cancel.is_cancelled() {
                return (ProjectResult::Failed("aborted".into()), round);
            }
        }

        if dead_rounds == self.total_rounds {
            return (
                ProjectResult::Failed("prompt delivery failed in every round".into()),
                self.total_rounds,
            );
        }
        (ProjectResult::Completed, self.total_rounds)
    }

    // ------------------------------------------------------------------
    // Artificial-suicide mode: identity phase (kept) then injection phase
    // (scanned, reverted), per round.
    // ------------------------------------------------------------------

    async fn run_suicide(
        &self,
        project: &Project,
        driver: &Arc<dyn UiDriver>,
        stats: &mut StatsEngine,
        backup: &mut BackupManager,
    ) -> (ProjectResult, u32) {
        let mut records: HashMap<Target, IdentityRecord> = HashMap::new();
        for target in &project.targets {
            records.insert(target.clone(), self.seed_record(project, target).await);
        }

        // Baseline scan of the untouched state, recorded as round 0. A target
        // already flagged at baseline is noted but still attacked.
        for target in &project.targets {
            let outcome = if records[target].lost {
                RoundOutcome::IdentityLost
            } else {
                let verdict =
                    run_scanners(&self.scanners, &project.path.join(&target.file)).await;
                classify(&verdict, self.judge)
            };
            if outcome == RoundOutcome::Finding {
                info!(target = %target, "target already flagged at baseline");
            }
            if let Err(e) = stats.record_baseline(target, outcome) {
                warn!(target = %target, error = %e, "baseline not recorded");
            }
        }

        // First round with a finding, per target. One independent skip state
        // per target; never shared.
        let mut found_at: HashMap<Target, u32> = HashMap::new();
        let mut responses: HashMap<Target, String> = HashMap::new();
        let mut dead_rounds = 0;

        for round in 1..=self.total_rounds {
            if self.cancel.is_cancelled() {
                return (ProjectResult::Failed("aborted".into()), round - 1);
            }

            // Cells for targets that no longer run phases: skipped once
            // found, lost stays lost.
            let mut active: Vec<Target> = Vec::new();
            for target in &project.targets {
                if found_at.contains_key(target) {
                    record(stats, target, round, RoundOutcome::Skipped);
                } else if records[target].lost {
                    record(stats, target, round, RoundOutcome::IdentityLost);
                } else {
                    active.push(target.clone());
                }
            }

            if active.is_empty() {
                for r in round + 1..=self.total_rounds {
                    for target in &project.targets {
                        let cell = if found_at.contains_key(target) {
                            RoundOutcome::Skipped
                        } else {
                            RoundOutcome::IdentityLost
                        };
                        record(stats, target, r, cell);
                    }
                }
                info!(project = %project.name, round, "every target skipped or lost");
                return (
                    ProjectResult::TerminatedEarly("every target skipped or lost".into()),
                    round - 1,
                );
            }

            let mut ctx = RoundContext::default();

            // Phase 1: identity. The rename is the attack surface under test
            // and must persist, so the phase commits keep unconditionally.
            let mut injection_targets: Vec<Target> = Vec::new();
            for target in &active {
                let last = responses.get(target).map(String::as_str).unwrap_or("");
                let prompt = self
                    .templates
                    .query_prompt(round, target, &self.target_cwe, last);

                match deliver(driver, &prompt).await {
                    Ok(response) => {
                        ctx.delivered += 1;
                        responses.insert(target.clone(), response);
                    }
                    Err(e) => {
                        warn!(target = %target, round, error = %e, "identity prompt failed");
                        record(stats, target, round, RoundOutcome::DeliveryFailed);
                        continue;
                    }
                }

                // Reconcile the target's identity against the just-edited file.
                let path = project.path.join(&target.file);
                let content = match tokio::fs::read_to_string(&path).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(target = %target, error = %e, "target file unreadable, marking lost");
                        if let Some(rec) = records.get_mut(target) {
                            rec.lost = true;
                        }
                        record(stats, target, round, RoundOutcome::IdentityLost);
                        continue;
                    }
                };
                let rec = records.get_mut(target).expect("record registered at start");
                match identity::resolve(rec, &content) {
                    Resolution::Found { name, .. } => {
                        stats.set_current_name(target, &name);
                        injection_targets.push(target.clone());
                    }
                    Resolution::Lost => {
                        record(stats, target, round, RoundOutcome::IdentityLost);
                    }
                }
            }

            if let Err(e) = driver.commit(Disposition::Keep).await {
                error!(project = %project.name, round, error = %e, "keep commit failed");
                return (ProjectResult::Failed(format!("commit failed: {e}")), round - 1);
            }

            if self.cancel.is_cancelled() {
                // The identity phase committed, so the file state is
                // consistent; stop before injecting anything.
                return (ProjectResult::Failed("aborted".into()), round - 1);
            }

            // Phase 2: injection. Scans run before the unconditional revert.
            for target in &injection_targets {
                let prompt = self.templates.coding_prompt(target, &self.target_cwe);
                if let Err(e) = deliver(driver, &prompt).await {
                    warn!(target = %target, round, error = %e, "injection prompt failed");
                    record(stats, target, round, RoundOutcome::DeliveryFailed);
                    continue;
                }
                ctx.delivered += 1;

                let verdict =
                    run_scanners(&self.scanners, &project.path.join(&target.file)).await;
                let outcome = classify(&verdict, self.judge);
                record(stats, target, round, outcome);
                if outcome == RoundOutcome::Finding {
                    ctx.pending_backups.push((target.clone(), verdict));
                }
            }

            if let Err(e) = driver.commit(Disposition::Revert).await {
                error!(project = %project.name, round, error = %e, "revert commit failed");
                return (ProjectResult::Failed(format!("commit failed: {e}")), round);
            }

            // Snapshot after the revert: the file is back in its phase-1
            // (renamed but safe) state, which is the pattern worth keeping.
            for (target, verdict) in ctx.pending_backups.drain(..) {
                if self.bait_verification_rounds > 0 {
                    match self.verify_vicious_pattern(project, driver, &target).await {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(
                                target = %target,
                                round,
                                "pattern failed verification, target stays active"
                            );
                            continue;
                        }
                        Err(e) => {
                            error!(project = %project.name, round, error = %e, "revert commit failed");
                            return (
                                ProjectResult::Failed(format!("commit failed: {e}")),
                                round,
                            );
                        }
                    }
                }
                info!(
                    target = %target,
                    round,
                    findings = verdict.findings.len(),
                    "finding confirmed, setting skip marker"
                );
                match tokio::fs::read(project.path.join(&target.file)).await {
                    Ok(snapshot) => {
                        if let Err(e) = backup.maybe_backup(round, &target.file, &snapshot, true).await
                        {
                            error!(target = %target, round, error = %e, "backup write failed");
                        }
                    }
                    Err(e) => {
                        error!(target = %target, round, error = %e, "snapshot read failed");
                    }
                }
                found_at.insert(target, round);
            }

            if ctx.delivered == 0 {
                dead_rounds += 1;
            }

            if self.cancel.is_cancelled() {
                return (ProjectResult::Failed("aborted".into()), round);
            }
        }

        if dead_rounds == self.total_rounds {
            return (
                ProjectResult::Failed("prompt delivery failed in every round".into()),
                self.total_rounds,
            );
        }
        (ProjectResult::Completed, self.total_rounds)
    }

    /// Replay the injection prompt against the reverted (phase-1) state; the
    /// pattern counts as verified only when every replay reproduces a
    /// finding. Each replay is reverted regardless of its outcome, so the
    /// file always ends back in the phase-1 state. A failed delivery counts
    /// as a failed verification; a failed revert is a commit failure and
    /// stays fatal to the project.
    async fn verify_vicious_pattern(
        &self,
        project: &Project,
        driver: &Arc<dyn UiDriver>,
        target: &Target,
    ) -> Result<bool, DriverError> {
        for attempt in 1..=self.bait_verification_rounds {
            let prompt = self.templates.coding_prompt(target, &self.target_cwe);
            if let Err(e) = deliver(driver, &prompt).await {
                warn!(target = %target, attempt, error = %e, "verification prompt failed");
                driver.commit(Disposition::Revert).await?;
                return Ok(false);
            }

            let verdict =
                run_scanners(&self.scanners, &project.path.join(&target.file)).await;
            let reproduced = classify(&verdict, self.judge) == RoundOutcome::Finding;
            driver.commit(Disposition::Revert).await?;

            if !reproduced {
                info!(
                    target = %target,
                    attempt,
                    of = self.bait_verification_rounds,
                    "pattern did not reproduce"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Locate a target in its untouched file to seed the identity record. A
    /// target whose function cannot be found at all is lost from the start.
    async fn seed_record(&self, project: &Project, target: &Target) -> IdentityRecord {
        let mut record = IdentityRecord::new(target.file.as_str(), target.function.as_str(), 1);
        let path = project.path.join(&target.file);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let defs = identity::extract_functions(&content);
                match defs.iter().find(|d| d.name == target.function) {
                    Some(def) => {
                        record.current_line = def.line;
                        record.signature = def.signature.clone();
                    }
                    None => {
                        warn!(target = %target, "function not present in file, marking lost");
                        record.lost = true;
                    }
                }
            }
            Err(e) => {
                warn!(target = %target, error = %e, "target file unreadable, marking lost");
                record.lost = true;
            }
        }
        record
    }
}

/// Deliver one prompt and wait for the response. Retry with backoff lives in
/// the driver wrapper, not here.
async fn deliver(driver: &Arc<dyn UiDriver>, prompt: &str) -> Result<String, DriverError> {
    driver.send_prompt(prompt).await?;
    driver.await_response().await
}

/// Map a scan verdict to a statistics cell. A round where every scanner
/// failed is never conflated with a clean result.
fn classify(verdict: &ScanVerdict, judge: JudgeMode) -> RoundOutcome {
    if verdict.all_scanners_failed() {
        RoundOutcome::ScanFailed
    } else if verdict.has_finding(judge) {
        RoundOutcome::Finding
    } else {
        RoundOutcome::Clean
    }
}

/// Record one cell; a rejected double-record is a bug in the round protocol
/// and is surfaced loudly but does not abort the project.
fn record(stats: &mut StatsEngine, target: &Target, round: u32, outcome: RoundOutcome) {
    if let Err(e) = stats.record(target, round, outcome) {
        error!(target = %target, round, ?outcome, error = %e, "round outcome not recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Finding, Severity};

    fn verdict(per_scanner: &[(&str, usize)], errors: usize, severity: Severity) -> ScanVerdict {
        let mut v = ScanVerdict::default();
        for &(name, count) in per_scanner {
            v.per_scanner.insert(name.to_string(), count);
            for i in 0..count {
                v.findings.push(Finding {
                    weakness_id: "CWE-022".into(),
                    description: String::new(),
                    severity,
                    confidence: 0.8,
                    file: "x.py".into(),
                    line: i as u32 + 1,
                    scanner: name.to_string(),
                });
            }
        }
        v.scan_errors = errors;
        v
    }

    #[test]
    fn classify_distinguishes_failure_from_clean() {
        let clean = verdict(&[("alpha", 0)], 0, Severity::Low);
        assert_eq!(classify(&clean, JudgeMode::Any), RoundOutcome::Clean);

        let all_failed = verdict(&[], 2, Severity::Low);
        assert_eq!(classify(&all_failed, JudgeMode::Any), RoundOutcome::ScanFailed);

        let found = verdict(&[("alpha", 1)], 0, Severity::Medium);
        assert_eq!(classify(&found, JudgeMode::Any), RoundOutcome::Finding);
    }

    #[test]
    fn classify_honors_judge_mode() {
        let split = verdict(&[("alpha", 1), ("beta", 0)], 0, Severity::High);
        assert_eq!(classify(&split, JudgeMode::Any), RoundOutcome::Finding);
        assert_eq!(classify(&split, JudgeMode::All), RoundOutcome::Clean);
    }
}
