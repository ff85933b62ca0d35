//! Vicious pattern backups.
//!
//! When an injection phase produces a finding, the pre-injection file state
//! (renamed but still safe) is the valuable artifact: it is the pattern that
//! primed the assistant into a vulnerable completion. The manager persists
//! exactly those snapshots. The backup directory is created lazily on the
//! first write and pruned at finalize if nothing was ever written, so a
//! project that never triggers a finding leaves no empty directory behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Per-project snapshot store. Owned exclusively by one orchestration run.
pub struct BackupManager {
    dir: PathBuf,
    created: bool,
    written: u32,
}

impl BackupManager {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            created: false,
            written: 0,
        }
    }

    pub fn written(&self) -> u32 {
        self.written
    }

    /// Snapshot destination for a (round, file) pair. Path separators are
    /// flattened so one directory holds every snapshot.
    fn entry_path(&self, round: u32, rel_path: &str) -> PathBuf {
        let flat = rel_path.replace(['/', '\\'], "__");
        self.dir.join(format!("round_{round}__{flat}"))
    }

    /// Persist a snapshot if the round had a finding; a clean round writes
    /// nothing and creates nothing.
    pub async fn maybe_backup(
        &mut self,
        round: u32,
        rel_path: &str,
        snapshot: &[u8],
        had_finding: bool,
    ) -> Result<Option<PathBuf>> {
        if !had_finding {
            return Ok(None);
        }

        if !self.created {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("creating backup dir {}", self.dir.display()))?;
            self.created = true;
        }

        let path = self.entry_path(round, rel_path);
        tokio::fs::write(&path, snapshot)
            .await
            .with_context(|| format!("writing backup {}", path.display()))?;
        self.written += 1;
        info!(round, file = rel_path, path = %path.display(), "vicious pattern backed up");
        Ok(Some(path))
    }

    /// Remove the backup directory if it exists but never received a
    /// snapshot; a populated directory is left intact.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.written > 0 {
            return Ok(());
        }
        match tokio::fs::read_dir(&self.dir).await {
            Ok(mut entries) => {
                if entries.next_entry().await?.is_none() {
                    tokio::fs::remove_dir(&self.dir)
                        .await
                        .with_context(|| format!("removing empty {}", self.dir.display()))?;
                    debug!(dir = %self.dir.display(), "empty backup dir removed");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("inspecting {}", self.dir.display()))
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_paths_flatten_separators() {
        let mgr = BackupManager::new(PathBuf::from("/out/vicious_pattern"));
        let path = mgr.entry_path(2, "torch_utils/custom_ops.py");
        assert_eq!(
            path,
            PathBuf::from("/out/vicious_pattern/round_2__torch_utils__custom_ops.py")
        );
    }

    #[tokio::test]
    async fn clean_round_creates_nothing() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vicious_pattern");
        let mut mgr = BackupManager::new(dir.clone());

        let written = mgr.maybe_backup(1, "foo.py", b"content", false).await.unwrap();
        assert!(written.is_none());
        assert!(!dir.exists());

        mgr.finalize().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn finding_round_writes_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vicious_pattern");
        let mut mgr = BackupManager::new(dir.clone());

        let path = mgr
            .maybe_backup(1, "src/foo.py", b"def renamed(a, b):\n", true)
            .await
            .unwrap()
            .expect("snapshot written");
        assert_eq!(
            tokio::fs::read(&path).await.unwrap(),
            b"def renamed(a, b):\n"
        );
        assert_eq!(mgr.written(), 1);

        mgr.finalize().await.unwrap();
        assert!(dir.exists());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn finalize_prunes_speculatively_created_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vicious_pattern");
        // Directory created out of band, e.g. by a terminated earlier run.
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut mgr = BackupManager::new(dir.clone());
        mgr.finalize().await.unwrap();
        assert!(!dir.exists());
    }
}
