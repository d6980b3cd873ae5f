//! Downloader stage: fetch the selected files into the target directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use archivist_archive::ArchiveClient;
use archivist_shared::{ArchivistError, PipelineState, Result, StateUpdate};

use crate::graph::{Node, StageId};

/// Download the selected files into a target directory.
///
/// A failed download is recorded and the remaining items are still fetched.
pub struct DownloaderNode {
    archive: Arc<dyn ArchiveClient>,
    target_dir: PathBuf,
}

impl DownloaderNode {
    /// Build the stage, checking once that `target_dir` is a writable directory.
    pub fn new(archive: Arc<dyn ArchiveClient>, target_dir: impl Into<PathBuf>) -> Result<Self> {
        let target_dir = target_dir.into();
        check_target_dir(&target_dir)?;
        Ok(Self {
            archive,
            target_dir,
        })
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }
}

fn check_target_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Err(ArchivistError::config(format!(
            "target directory {} does not exist",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(ArchivistError::config(format!(
            "target directory {} is not a directory",
            dir.display()
        )));
    }

    let probe = dir.join(format!(".archivist-probe-{}", Uuid::now_v7()));
    std::fs::write(&probe, b"").map_err(|e| {
        ArchivistError::config(format!(
            "target directory {} is not writable: {e}",
            dir.display()
        ))
    })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[async_trait]
impl Node for DownloaderNode {
    fn id(&self) -> StageId {
        StageId::Downloader
    }

    async fn run(&self, state: &PipelineState) -> Result<StateUpdate> {
        let Some(pdfs) = &state.pdfs_to_download else {
            return Ok(StateUpdate::new());
        };

        let mut errors = Vec::new();
        for (identifier, files) in pdfs {
            if files.is_empty() {
                continue;
            }
            match self
                .archive
                .download(identifier, files, &self.target_dir)
                .await
            {
                Ok(()) => info!(%identifier, files = files.len(), "downloaded"),
                Err(e) => {
                    warn!(%identifier, error = %e, "download failed");
                    errors.push(format!("Download error for {identifier}: {e}"));
                }
            }
        }

        Ok(StateUpdate::new().errors(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::stages::testing::{StubArchive, temp_dir};

    #[test]
    fn rejects_missing_or_non_directory_targets() {
        let archive: Arc<dyn ArchiveClient> = Arc::new(StubArchive::default());

        let missing = std::env::temp_dir().join(format!("archivist-missing-{}", Uuid::now_v7()));
        let err = DownloaderNode::new(archive.clone(), &missing).err().unwrap();
        assert!(matches!(err, ArchivistError::Config { .. }));
        assert!(err.to_string().contains("does not exist"));

        let file = std::env::temp_dir().join(format!("archivist-file-{}", Uuid::now_v7()));
        std::fs::write(&file, "x").unwrap();
        let err = DownloaderNode::new(archive, &file).err().unwrap();
        assert!(err.to_string().contains("is not a directory"));
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn probe_leaves_no_trace() {
        let dir = temp_dir("archivist-dl-probe");
        DownloaderNode::new(Arc::new(StubArchive::default()), &dir).unwrap();
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_downloads() {
        let dir = temp_dir("archivist-dl");
        let stub = Arc::new(StubArchive {
            failing_downloads: vec!["broken".into()],
            ..StubArchive::default()
        });
        let node = DownloaderNode::new(stub.clone(), &dir).unwrap();

        let mut state = PipelineState::new("q");
        state.pdfs_to_download = Some(BTreeMap::from([
            ("broken".to_string(), vec!["a.pdf".to_string()]),
            ("empty".to_string(), vec![]),
            ("fine".to_string(), vec!["b.pdf".to_string()]),
        ]));
        let next = state.apply(node.run(&state).await.unwrap());

        assert_eq!(next.errors.len(), 1);
        assert!(next.errors[0].starts_with("Download error for broken:"));
        let downloads = stub.downloads.lock().unwrap();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].0, "fine");
        assert!(dir.join("fine").join("b.pdf").exists());
        drop(downloads);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn nothing_to_download_is_a_no_op() {
        let dir = temp_dir("archivist-dl-empty");
        let node = DownloaderNode::new(Arc::new(StubArchive::default()), &dir).unwrap();
        let update = node.run(&PipelineState::new("q")).await.unwrap();
        assert!(update.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
