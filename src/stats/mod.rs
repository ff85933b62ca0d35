//! Per-target, per-round vulnerability statistics.
//!
//! One row per target, one cell per round, append-only while the project is
//! processing and rendered to delimited text at finalize. The engine enforces
//! the skip-once-found bookkeeping for attack mode and rejects double
//! recording so a round can never be silently counted twice.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::config::Mode;
use crate::project::Target;

/// Outcome of one (target, round) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// At least one finding was produced for the target this round.
    Finding,
    /// Scanned clean.
    Clean,
    /// Intentionally not scanned because the target already triggered a
    /// finding in an earlier round. Never conflated with Clean.
    Skipped,
    /// Prompt delivery failed after retries; not counted as a finding.
    DeliveryFailed,
    /// Every scanner failed; distinct from a true clean result.
    ScanFailed,
    /// Identity resolution lost the target; terminal for the project.
    IdentityLost,
}

impl RoundOutcome {
    pub fn cell(self) -> &'static str {
        match self {
            RoundOutcome::Finding => "V",
            RoundOutcome::Clean => "-",
            RoundOutcome::Skipped => "S",
            RoundOutcome::DeliveryFailed => "F",
            RoundOutcome::ScanFailed => "E",
            RoundOutcome::IdentityLost => "L",
        }
    }
}

/// Statistics row for one target.
#[derive(Debug, Clone)]
pub struct StatisticsRow {
    pub target: Target,
    /// Name the target currently resolves to (attack mode renames it).
    pub current_name: String,
    /// Outcome of the pre-attack baseline scan, attack mode only.
    pub baseline: Option<RoundOutcome>,
    /// One entry per recorded round; index = round - 1, None = not recorded.
    outcomes: Vec<Option<RoundOutcome>>,
    /// 1-based round of first detection.
    pub first_finding: Option<u32>,
}

impl StatisticsRow {
    fn new(target: Target, total_rounds: u32) -> Self {
        let current_name = target.function.clone();
        Self {
            target,
            current_name,
            baseline: None,
            outcomes: vec![None; total_rounds as usize],
            first_finding: None,
        }
    }

    pub fn outcome(&self, round: u32) -> Option<RoundOutcome> {
        self.outcomes.get(round as usize - 1).copied().flatten()
    }

    fn finding_rounds(&self) -> u32 {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Some(RoundOutcome::Finding)))
            .count() as u32
    }
}

/// Statistics engine for one project run. Owned exclusively by that project's
/// orchestration; rows never cross project boundaries.
pub struct StatsEngine {
    mode: Mode,
    total_rounds: u32,
    rows: Vec<StatisticsRow>,
}

impl StatsEngine {
    pub fn new(mode: Mode, total_rounds: u32) -> Self {
        Self {
            mode,
            total_rounds,
            rows: Vec::new(),
        }
    }

    /// Register a target, creating its row. Row order is registration order.
    pub fn register(&mut self, target: Target) {
        if self.row(&target).is_none() {
            self.rows.push(StatisticsRow::new(target, self.total_rounds));
        }
    }

    fn row(&self, target: &Target) -> Option<&StatisticsRow> {
        self.rows.iter().find(|r| &r.target == target)
    }

    fn row_mut(&mut self, target: &Target) -> Option<&mut StatisticsRow> {
        self.rows.iter_mut().find(|r| &r.target == target)
    }

    /// Record the pre-attack baseline scan outcome.
    pub fn record_baseline(&mut self, target: &Target, outcome: RoundOutcome) -> Result<()> {
        let row = self
            .row_mut(target)
            .with_context(|| format!("unregistered target {target}"))?;
        row.baseline = Some(outcome);
        Ok(())
    }

    /// Record one (target, round) outcome. Recording the same cell twice is
    /// an error: the engine must never double-count a round.
    pub fn record(&mut self, target: &Target, round: u32, outcome: RoundOutcome) -> Result<()> {
        let total = self.total_rounds;
        let row = self
            .row_mut(target)
            .with_context(|| format!("unregistered target {target}"))?;

        if round == 0 || round > total {
            bail!("round {round} out of range 1..={total}");
        }
        let slot = &mut row.outcomes[round as usize - 1];
        if slot.is_some() {
            bail!("round {round} already recorded for {target}");
        }
        *slot = Some(outcome);

        if outcome == RoundOutcome::Finding && row.first_finding.is_none() {
            row.first_finding = Some(round);
            debug!(target = %target, round, "first finding recorded");
        }
        Ok(())
    }

    /// Update the name a target currently resolves to.
    pub fn set_current_name(&mut self, target: &Target, name: &str) {
        if let Some(row) = self.row_mut(target) {
            row.current_name = name.to_string();
        }
    }

    pub fn first_finding(&self, target: &Target) -> Option<u32> {
        self.row(target).and_then(|r| r.first_finding)
    }

    pub fn rows(&self) -> &[StatisticsRow] {
        &self.rows
    }

    /// Derived summary for one row: occurrence count in standard mode (capped
    /// at the round count), first-detection round or the not-found sentinel in
    /// attack mode.
    pub fn summary(&self, row: &StatisticsRow) -> String {
        match self.mode {
            Mode::Standard => row.finding_rounds().min(self.total_rounds).to_string(),
            Mode::ArtificialSuicide => match row.first_finding {
                Some(round) => round.to_string(),
                None => "not_found".to_string(),
            },
        }
    }

    /// Render the table as comma-delimited text with a header row.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("file,function");
        if self.mode == Mode::ArtificialSuicide {
            out.push_str(",current_function,baseline");
        }
        for round in 1..=self.total_rounds {
            out.push_str(&format!(",round_{round}"));
        }
        out.push_str(match self.mode {
            Mode::Standard => ",findings\n",
            Mode::ArtificialSuicide => ",first_finding\n",
        });

        for row in &self.rows {
            out.push_str(&format!("{},{}", row.target.file, row.target.function));
            if self.mode == Mode::ArtificialSuicide {
                let baseline = row.baseline.map(RoundOutcome::cell).unwrap_or("");
                out.push_str(&format!(",{},{}", row.current_name, baseline));
            }
            for round in 1..=self.total_rounds {
                let cell = row.outcome(round).map(RoundOutcome::cell).unwrap_or("");
                out.push_str(&format!(",{cell}"));
            }
            out.push_str(&format!(",{}\n", self.summary(row)));
        }

        out
    }

    /// Write the rendered table to `<dir>/statistics.csv`. Called when the
    /// project completes or terminates early; completed rounds are always
    /// preserved.
    pub async fn finalize(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating statistics dir {}", dir.display()))?;
        let path = dir.join("statistics.csv");
        tokio::fs::write(&path, self.render())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), rows = self.rows.len(), "statistics written");
        Ok(path)
    }
}
