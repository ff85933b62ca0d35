// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cwe_probe::batch::BatchRunner;
use cwe_probe::config::{Mode, ProbeConfig};
use cwe_probe::driver::{Disposition, StdioDriverFactory};
use cwe_probe::orchestrator::{Orchestrator, PromptTemplates};
use cwe_probe::scanner::{CommandScanner, JudgeMode, Scanner};

/// Scripted probing of AI coding assistants for vulnerability-inducing edit
/// patterns. Flags override environment configuration (CWE_PROBE_*).
#[derive(Debug, Parser)]
#[command(name = "cwe-probe", version)]
struct Cli {
    /// Directory holding one subdirectory per project.
    #[arg(long)]
    projects_dir: Option<PathBuf>,

    /// Root for statistics, backups, and the summary report.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Directory with the prompt template files.
    #[arg(long)]
    template_dir: Option<PathBuf>,

    /// Execution mode: standard or artificial-suicide.
    #[arg(long)]
    mode: Option<Mode>,

    /// Weakness under test, e.g. 022.
    #[arg(long)]
    cwe: Option<String>,

    /// Rounds per project.
    #[arg(long)]
    rounds: Option<u32>,

    /// Multi-scanner verdict: any or all.
    #[arg(long)]
    judge: Option<JudgeMode>,

    /// Scanner spec `name:program args...`; repeatable.
    #[arg(long = "scanner")]
    scanners: Vec<String>,

    /// Automation helper program driving the host editor.
    #[arg(long)]
    helper: Option<String>,

    /// Re-verify each vicious pattern N times before backing it up (AS mode).
    #[arg(long)]
    bait_verification: Option<u32>,

    /// Global cap on targets processed across the batch.
    #[arg(long)]
    max_files: Option<u32>,

    /// Disable early termination on High/Critical findings (standard mode).
    #[arg(long)]
    no_early_termination: bool,

    /// Disposition for the terminating round's edits: keep or revert.
    #[arg(long)]
    termination_disposition: Option<Disposition>,
}

fn apply_cli(cfg: &mut ProbeConfig, cli: Cli) {
    if let Some(v) = cli.projects_dir {
        cfg.projects_dir = v;
    }
    if let Some(v) = cli.output_dir {
        cfg.output_dir = v;
    }
    if let Some(v) = cli.template_dir {
        cfg.template_dir = v;
    }
    if let Some(v) = cli.mode {
        cfg.mode = v;
    }
    if let Some(v) = cli.cwe {
        cfg.target_cwe = v;
    }
    if let Some(v) = cli.rounds {
        cfg.total_rounds = v;
    }
    if let Some(v) = cli.judge {
        cfg.judge_mode = v;
    }
    if !cli.scanners.is_empty() {
        cfg.scanner_specs = cli.scanners;
    }
    if let Some(v) = cli.helper {
        cfg.helper_program = v;
    }
    if let Some(v) = cli.bait_verification {
        cfg.bait_verification_rounds = v;
    }
    if let Some(v) = cli.max_files {
        cfg.max_files_limit = v;
    }
    if cli.no_early_termination {
        cfg.early_termination = false;
    }
    if let Some(v) = cli.termination_disposition {
        cfg.termination_disposition = v;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = ProbeConfig::from_env();
    apply_cli(&mut cfg, cli);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    fmt().with_env_filter(filter).init();

    info!(
        mode = cfg.mode.as_str(),
        cwe = %cfg.target_cwe,
        rounds = cfg.total_rounds,
        projects = %cfg.projects_dir.display(),
        "cwe-probe starting"
    );

    if cfg.total_rounds == 0 {
        bail!("at least one round is required");
    }

    let scanners: Vec<Arc<dyn Scanner>> = cfg
        .scanner_specs
        .iter()
        .filter_map(|spec| match CommandScanner::from_spec(spec) {
            Some(s) => Some(Arc::new(s) as Arc<dyn Scanner>),
            None => {
                warn!(spec = %spec, "malformed scanner spec ignored");
                None
            }
        })
        .collect();
    if scanners.is_empty() {
        bail!("no usable scanner configured (set CWE_PROBE_SCANNERS or pass --scanner)");
    }

    let templates = match PromptTemplates::load(&cfg.template_dir).await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "template dir unusable, falling back to built-in templates");
            PromptTemplates::default()
        }
    };

    // Ctrl-C finishes the current round's disposition step, then stops.
    let cancel = CancellationToken::new();
    let abort = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("abort signal received, finishing current round");
            abort.cancel();
        }
    });

    let runner = BatchRunner {
        orchestrator: Orchestrator {
            mode: cfg.mode,
            total_rounds: cfg.total_rounds,
            judge: cfg.judge_mode,
            target_cwe: cfg.target_cwe.clone(),
            early_termination: cfg.early_termination,
            termination_disposition: cfg.termination_disposition,
            bait_verification_rounds: cfg.bait_verification_rounds,
            templates,
            scanners,
            output_dir: cfg.output_dir.clone(),
            cancel: cancel.clone(),
        },
        driver_factory: Arc::new(StdioDriverFactory {
            program: cfg.helper_program.clone(),
            args: cfg.helper_args.clone(),
            response_timeout: cfg.response_timeout(),
            retry: cfg.retry_policy(),
        }),
        projects_dir: cfg.projects_dir.clone(),
        output_dir: cfg.output_dir.clone(),
        max_files_limit: cfg.max_files_limit,
        cancel,
    };

    let summary = runner.run().await.context("batch run failed")?;
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
