//! Sequential batch runner.
//!
//! Processes discovered projects one at a time, persisting lifecycle status
//! after every transition so an interrupted batch resumes where it stopped.
//! Per-project failures never abort the batch; the abort signal stops it
//! after the current project finishes its disposition step.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::driver::DriverFactory;
use crate::orchestrator::{Orchestrator, ProjectResult};
use crate::project::{discover_projects, BatchStatus, Project, ProjectStatus};

const SUMMARY_FILENAME: &str = "summary_report.txt";

/// One line of the batch summary.
#[derive(Debug)]
struct ProjectLine {
    name: String,
    status: ProjectStatus,
    detail: String,
    rounds_run: u32,
    targets_with_findings: u32,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub done: u32,
    pub failed: u32,
    pub skipped_resume: u32,
    pub skipped_quota: u32,
    pub targets_processed: u32,
}

pub struct BatchRunner {
    pub orchestrator: Orchestrator,
    pub driver_factory: Arc<dyn DriverFactory>,
    pub projects_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Global cap on targets processed across the batch; 0 means unlimited.
    pub max_files_limit: u32,
    pub cancel: CancellationToken,
}

impl BatchRunner {
    /// Discover and process every project, then write the summary report.
    pub async fn run(&self) -> Result<BatchSummary> {
        let projects = discover_projects(&self.projects_dir)?;
        let mut status = BatchStatus::load(&self.output_dir).await?;
        let mut summary = BatchSummary::default();
        let mut lines: Vec<ProjectLine> = Vec::new();

        for mut project in projects {
            if self.cancel.is_cancelled() {
                warn!("abort signal received, stopping batch");
                break;
            }

            if status.is_done(&project.name) {
                info!(project = %project.name, "already done, skipping (resume)");
                summary.skipped_resume += 1;
                continue;
            }

            if self.max_files_limit > 0 {
                let remaining = self
                    .max_files_limit
                    .saturating_sub(summary.targets_processed);
                if remaining == 0 {
                    info!(project = %project.name, "file quota reached, skipping");
                    summary.skipped_quota += 1;
                    continue;
                }
                if project.targets.len() as u32 > remaining {
                    info!(
                        project = %project.name,
                        total = project.targets.len(),
                        remaining,
                        "file quota truncates target list"
                    );
                    project.targets.truncate(remaining as usize);
                }
            }

            project.status = ProjectStatus::Processing;
            status.set(&project.name, ProjectStatus::Processing);
            status.save(&self.output_dir).await?;

            let (final_status, detail, rounds_run, findings) =
                self.run_one(&project).await;

            summary.targets_processed += project.targets.len() as u32;
            match final_status {
                ProjectStatus::Done => summary.done += 1,
                ProjectStatus::Failed => summary.failed += 1,
                _ => unreachable!("projects finish as done or failed"),
            }
            status.set(&project.name, final_status);
            status.save(&self.output_dir).await?;

            lines.push(ProjectLine {
                name: project.name.clone(),
                status: final_status,
                detail,
                rounds_run,
                targets_with_findings: findings,
            });
        }

        self.write_summary(&summary, &lines)
            .await
            .context("writing batch summary")?;
        info!(
            done = summary.done,
            failed = summary.failed,
            skipped_resume = summary.skipped_resume,
            skipped_quota = summary.skipped_quota,
            targets = summary.targets_processed,
            "batch finished"
        );
        Ok(summary)
    }

    /// Run one project, mapping its result to a lifecycle status. Failures
    /// are reported per project and never propagate.
    async fn run_one(&self, project: &Project) -> (ProjectStatus, String, u32, u32) {
        let driver = match self.driver_factory.connect(project).await {
            Ok(driver) => driver,
            Err(e) => {
                error!(project = %project.name, error = %e, "driver connect failed");
                return (ProjectStatus::Failed, format!("driver connect: {e}"), 0, 0);
            }
        };

        match self.orchestrator.run_project(project, driver).await {
            Ok(report) => {
                // Every variant is handled; early termination is a successful
                // outcome with a reason worth keeping in the summary.
                let (status, detail) = match report.result {
                    ProjectResult::Completed => (ProjectStatus::Done, "completed".to_string()),
                    ProjectResult::TerminatedEarly(reason) => {
                        (ProjectStatus::Done, format!("terminated early: {reason}"))
                    }
                    ProjectResult::Failed(reason) => (ProjectStatus::Failed, reason),
                };
                (
                    status,
                    detail,
                    report.rounds_run,
                    report.targets_with_findings,
                )
            }
            Err(e) => {
                error!(project = %project.name, error = %e, "project run errored");
                (ProjectStatus::Failed, e.to_string(), 0, 0)
            }
        }
    }

    async fn write_summary(&self, summary: &BatchSummary, lines: &[ProjectLine]) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let mut out = String::new();
        out.push_str("cwe-probe batch summary\n");
        out.push_str(&format!("generated: {}\n", Utc::now().to_rfc3339()));
        out.push_str(&format!(
            "mode: {}  cwe: CWE-{}  rounds: {}\n\n",
            self.orchestrator.mode.as_str(),
            self.orchestrator.target_cwe,
            self.orchestrator.total_rounds
        ));
        out.push_str(&format!(
            "projects: {} done, {} failed, {} skipped (resume), {} skipped (quota)\n",
            summary.done, summary.failed, summary.skipped_resume, summary.skipped_quota
        ));
        out.push_str(&format!(
            "targets processed: {}\n\n",
            summary.targets_processed
        ));

        for line in lines {
            out.push_str(&format!(
                "{}: {:?} ({}) rounds={} findings={}\n",
                line.name, line.status, line.detail, line.rounds_run, line.targets_with_findings
            ));
        }

        let path = self.output_dir.join(SUMMARY_FILENAME);
        tokio::fs::write(&path, out)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "summary report written");
        Ok(())
    }
}
