//! Artifact retrieval and batch download archives.

pub mod http;

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::domain::{PipelineKind, TaskStatus};
use crate::queue::{BatchOutcome, Task, TaskQueue};
use crate::{Error, Result};

/// One downloaded asset.
#[derive(Debug, Clone)]
pub struct ArtifactAsset {
    /// Archive entry name, `task_<id>_<n>.<ext>`.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// All assets of one task.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub task_id: String,
    pub assets: Vec<ArtifactAsset>,
}

/// Fetches the generated assets of a finished task.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch_single(&self, task: &Task) -> Result<ArtifactBundle>;
}

fn default_extension(kind: PipelineKind) -> &'static str {
    match kind {
        PipelineKind::Text2Img | PipelineKind::Img2Img => "png",
        _ => "mp4",
    }
}

fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Extension of a path or URL, ignoring any query string.
fn extension_of(reference: &str) -> Option<String> {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let file = path.rsplit('/').next().unwrap_or(path);
    Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5)
        .map(|e| e.to_ascii_lowercase())
}

pub fn asset_name(task: &Task, index: usize, reference: &str) -> String {
    let ext = extension_of(reference).unwrap_or_else(|| default_extension(task.kind).to_string());
    format!("task_{}_{}.{}", task.id, index + 1, ext)
}

/// Reads local artifact paths and downloads `http(s)` references.
pub struct DefaultArtifactFetcher {
    client: reqwest::Client,
    /// Base for relative artifact paths.
    base_dir: PathBuf,
}

impl DefaultArtifactFetcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            client: http::build_download_client(Duration::from_secs(300))?,
            base_dir: base_dir.into(),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url = %url, "Downloading artifact");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::external(format!("download {} failed: {}", url, e)))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::external(format!("download {} failed: {}", url, e)))?;
        Ok(bytes.to_vec())
    }

    async fn read_local(&self, reference: &str) -> Result<Vec<u8>> {
        let path = Path::new(reference);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        tokio::fs::read(&path).await.map_err(|e| {
            Error::external(format!("cannot read artifact {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl ArtifactFetcher for DefaultArtifactFetcher {
    async fn fetch_single(&self, task: &Task) -> Result<ArtifactBundle> {
        let references = task
            .result
            .as_ref()
            .map(|r| r.artifacts.as_slice())
            .unwrap_or_default();
        if references.is_empty() {
            return Err(Error::not_found("Artifact", &task.id));
        }

        let mut assets = Vec::with_capacity(references.len());
        for (index, reference) in references.iter().enumerate() {
            let bytes = if is_remote(reference) {
                self.download(reference).await?
            } else {
                self.read_local(reference).await?
            };
            assets.push(ArtifactAsset {
                name: asset_name(task, index, reference),
                bytes,
            });
        }
        Ok(ArtifactBundle {
            task_id: task.id.clone(),
            assets,
        })
    }
}

/// Result of a batch download.
#[derive(Debug, Clone)]
pub struct BatchFetch {
    /// Zip archive of every fetched asset; `None` when nothing could be fetched.
    pub archive: Option<Vec<u8>>,
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchFetch {
    pub fn failed(&self) -> Vec<&BatchOutcome> {
        self.outcomes.iter().filter(|o| !o.success).collect()
    }
}

/// Build a deflate zip archive from assets.
pub fn build_zip(assets: &[ArtifactAsset]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for asset in assets {
        zip.start_file(asset.name.as_str(), options)
            .map_err(|e| Error::Other(format!("Failed to add zip entry: {e}")))?;
        zip.write_all(&asset.bytes)?;
    }
    zip.finish()
        .map_err(|e| Error::Other(format!("Failed to finish zip: {e}")))?;

    Ok(cursor.into_inner())
}

/// Download surface over the task queue.
pub struct ArtifactService {
    queue: Arc<TaskQueue>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl ArtifactService {
    pub fn new(queue: Arc<TaskQueue>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { queue, fetcher }
    }

    /// Assets of one succeeded task.
    pub async fn fetch_one(&self, kind: PipelineKind, task_id: &str) -> Result<ArtifactBundle> {
        let task = self.queue.get_for_kind(kind, task_id).await?;
        if task.status != TaskStatus::Succeeded {
            return Err(Error::conflict(format!(
                "task {} has not succeeded (status {})",
                task_id, task.status
            )));
        }
        self.fetcher.fetch_single(&task).await
    }

    /// Fetch several tasks into one archive, with a per-id outcome.
    pub async fn fetch(&self, kind: PipelineKind, task_ids: &[String]) -> Result<BatchFetch> {
        let mut assets = Vec::new();
        let mut outcomes = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            let result = self.fetch_one(kind, id).await;
            outcomes.push(BatchOutcome::from_result(id.clone(), &result));
            if let Ok(bundle) = result {
                assets.extend(bundle.assets);
            }
        }

        let archive = if assets.is_empty() {
            None
        } else {
            let archive = tokio::task::spawn_blocking(move || build_zip(&assets))
                .await
                .map_err(|e| Error::Other(format!("archive task failed: {e}")))??;
            Some(archive)
        };

        info!(
            kind = %kind,
            requested = task_ids.len(),
            fetched = outcomes.iter().filter(|o| o.success).count(),
            "Built artifact archive"
        );
        Ok(BatchFetch { archive, outcomes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxTaskRepository;
    use crate::database::test_pool;
    use crate::domain::FailureKind;
    use crate::queue::TaskResult;
    use serde_json::json;
    use std::io::Read;

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("https://cdn/x/video.MP4?sig=1"), Some("mp4".into()));
        assert_eq!(extension_of("/out/a.png"), Some("png".into()));
        assert_eq!(extension_of("https://cdn/x/blob"), None);
    }

    async fn finished_task(queue: &TaskQueue, artifact: &str, succeed: bool) -> String {
        let task = queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "p"}))
            .await
            .unwrap();
        queue
            .dequeue_next(PipelineKind::Text2Img, "w0")
            .await
            .unwrap();
        queue.mark_running(&task.id, "acc", "w0").await.unwrap();
        if succeed {
            let result = TaskResult {
                artifacts: vec![artifact.to_string()],
                metadata: None,
            };
            queue.mark_succeeded(&task.id, &result).await.unwrap();
        } else {
            queue
                .mark_failed(&task.id, "boom", FailureKind::Other)
                .await
                .unwrap();
        }
        task.id
    }

    #[tokio::test]
    async fn test_batch_fetch_builds_zip_with_per_id_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.png"), b"image-bytes")
            .await
            .unwrap();

        let queue = Arc::new(TaskQueue::new(Arc::new(SqlxTaskRepository::new(
            test_pool().await,
        ))));
        let ok = finished_task(&queue, "a.png", true).await;
        let failed = finished_task(&queue, "", false).await;

        let fetcher = Arc::new(DefaultArtifactFetcher::new(dir.path()).unwrap());
        let service = ArtifactService::new(queue, fetcher);
        let batch = service
            .fetch(PipelineKind::Text2Img, &[ok.clone(), failed.clone()])
            .await
            .unwrap();

        assert_eq!(batch.failed().len(), 1);
        assert_eq!(batch.failed()[0].task_id, failed);

        let archive = batch.archive.unwrap();
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        assert_eq!(zip.len(), 1);
        let mut entry = zip.by_index(0).unwrap();
        assert_eq!(entry.name(), format!("task_{}_1.png", ok));
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"image-bytes");
    }

    #[tokio::test]
    async fn test_batch_fetch_without_assets_has_no_archive() {
        let queue = Arc::new(TaskQueue::new(Arc::new(SqlxTaskRepository::new(
            test_pool().await,
        ))));
        let fetcher = Arc::new(DefaultArtifactFetcher::new("/nonexistent").unwrap());
        let service = ArtifactService::new(queue, fetcher);
        let batch = service
            .fetch(PipelineKind::Img2Img, &["missing".to_string()])
            .await
            .unwrap();
        assert!(batch.archive.is_none());
        assert_eq!(batch.outcomes.len(), 1);
    }
}
