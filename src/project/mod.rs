//! Project model, discovery, and batch status persistence.
//!
//! A project is one directory under the projects root containing a
//! `prompt.txt` that lists scan targets, one `path|function_name` per line.
//! Malformed lines are skipped with a warning; an empty target list makes the
//! project undiscoverable. Lifecycle status is persisted as JSON so an
//! interrupted batch can resume without reprocessing finished projects.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const PROMPT_FILENAME: &str = "prompt.txt";
const STATUS_FILENAME: &str = "batch_status.json";

/// Immutable identity of one scan target for the life of a project run. The
/// name or location it currently resolves to may change round over round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// File path relative to the project root.
    pub file: String,
    /// Function name as listed in the prompt file.
    pub function: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.file, self.function)
    }
}

/// Parse one prompt line in `path|function_name` format. Returns None for
/// malformed lines; the caller logs and skips them.
pub fn parse_prompt_line(line: &str) -> Option<Target> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (file, function) = line.split_once('|')?;
    let (file, function) = (file.trim(), function.trim());
    if file.is_empty() || function.is_empty() {
        return None;
    }
    Some(Target {
        file: file.to_string(),
        function: function.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    pub targets: Vec<Target>,
    pub status: ProjectStatus,
}

impl Project {
    /// Load one project from its directory, parsing the prompt file.
    pub fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("project directory has no usable name")?
            .to_string();

        let prompt_path = path.join(PROMPT_FILENAME);
        let raw = std::fs::read_to_string(&prompt_path)
            .with_context(|| format!("reading {}", prompt_path.display()))?;

        let mut targets = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_prompt_line(line) {
                Some(target) => targets.push(target),
                None => warn!(
                    project = %name,
                    line = idx + 1,
                    content = line,
                    "malformed prompt line skipped"
                ),
            }
        }

        Ok(Self {
            name,
            path: path.to_path_buf(),
            targets,
            status: ProjectStatus::Pending,
        })
    }
}

/// Discover projects: immediate subdirectories of the projects root that
/// contain a prompt file with at least one valid target. Sorted by name so
/// batch order is stable across runs.
pub fn discover_projects(projects_dir: &Path) -> Result<Vec<Project>> {
    let mut projects = Vec::new();

    for entry in WalkDir::new(projects_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("scanning {}", projects_dir.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if !entry.path().join(PROMPT_FILENAME).is_file() {
            debug!(path = %entry.path().display(), "no prompt file, skipping directory");
            continue;
        }
        match Project::load(entry.path()) {
            Ok(project) if project.targets.is_empty() => {
                warn!(project = %project.name, "prompt file has no valid targets, skipping");
            }
            Ok(project) => projects.push(project),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to load project"),
        }
    }

    info!(
        dir = %projects_dir.display(),
        count = projects.len(),
        "projects discovered"
    );
    Ok(projects)
}

/// Per-project lifecycle status for the whole batch, persisted after every
/// transition so an interrupted batch can resume. Projects recorded as done
/// are not reprocessed; processing or failed ones are retried.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BatchStatus {
    pub projects: BTreeMap<String, ProjectStatus>,
}

impl BatchStatus {
    pub async fn load(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(STATUS_FILENAME);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub async fn save(&self, output_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("creating {}", output_dir.display()))?;
        let path = output_dir.join(STATUS_FILENAME);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn set(&mut self, project: &str, status: ProjectStatus) {
        self.projects.insert(project.to_string(), status);
    }

    pub fn is_done(&self, project: &str) -> bool {
        matches!(self.projects.get(project), Some(ProjectStatus::Done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_line_parsing() {
        let t = parse_prompt_line("src/util/io.py|read_file").unwrap();
        assert_eq!(t.file, "src/util/io.py");
        assert_eq!(t.function, "read_file");

        // Whitespace around the separator is tolerated.
        let t = parse_prompt_line("  foo.py | calc  ").unwrap();
        assert_eq!(t.file, "foo.py");
        assert_eq!(t.function, "calc");

        assert!(parse_prompt_line("no-separator-here").is_none());
        assert!(parse_prompt_line("|missing_path").is_none());
        assert!(parse_prompt_line("missing_function|").is_none());
        assert!(parse_prompt_line("# comment").is_none());
        assert!(parse_prompt_line("").is_none());
    }

    #[test]
    fn load_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROMPT_FILENAME),
            "foo.py|calc\ngarbage line\nbar.py|process\n",
        )
        .unwrap();

        let project = Project::load(dir.path()).unwrap();
        assert_eq!(project.targets.len(), 2);
        assert_eq!(project.targets[0].function, "calc");
        assert_eq!(project.targets[1].file, "bar.py");
        assert_eq!(project.status, ProjectStatus::Pending);
    }

    #[test]
    fn discovery_requires_prompt_file_and_targets() {
        let root = tempfile::tempdir().unwrap();

        let with_prompt = root.path().join("alpha");
        std::fs::create_dir(&with_prompt).unwrap();
        std::fs::write(with_prompt.join(PROMPT_FILENAME), "a.py|main\n").unwrap();

        let no_prompt = root.path().join("beta");
        std::fs::create_dir(&no_prompt).unwrap();

        let empty_prompt = root.path().join("gamma");
        std::fs::create_dir(&empty_prompt).unwrap();
        std::fs::write(empty_prompt.join(PROMPT_FILENAME), "only garbage\n").unwrap();

        let projects = discover_projects(root.path()).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "alpha");
    }

    #[tokio::test]
    async fn batch_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();

        let mut status = BatchStatus::default();
        status.set("alpha", ProjectStatus::Done);
        status.set("beta", ProjectStatus::Failed);
        status.save(dir.path()).await.unwrap();

        let loaded = BatchStatus::load(dir.path()).await.unwrap();
        assert!(loaded.is_done("alpha"));
        assert!(!loaded.is_done("beta"));
        assert!(!loaded.is_done("unknown"));
    }

    #[tokio::test]
    async fn missing_status_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = BatchStatus::load(dir.path()).await.unwrap();
        assert!(loaded.projects.is_empty());
    }
}
