use super::{FileTransfer, LocalWorkspace};
use crate::config::WorkspaceConfig;
use crate::model::types::InvocationSpec;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared by every worker in the process so two workers never allocate or
/// populate the same folder at once.
static WORKSPACE_GATE: Mutex<()> = Mutex::const_new(());

/// Creates local workspaces from remote ones. A workspace that already exists
/// for the same source host and invocation is reused as is.
pub struct WorkspaceHandler {
    config: WorkspaceConfig,
    transfer: Arc<dyn FileTransfer>,
}

impl WorkspaceHandler {
    pub fn new(config: WorkspaceConfig, transfer: Arc<dyn FileTransfer>) -> Arc<Self> {
        Arc::new(Self { config, transfer })
    }

    pub async fn create_local_workspace(&self, spec: &InvocationSpec) -> Result<LocalWorkspace> {
        let remote = &spec.source_path;

        let base_path = {
            let _gate = WORKSPACE_GATE.lock().await;

            let base_path = self
                .working_folder(&remote.host_id, &spec.id)
                .await
                .context("Failed allocating a working folder")?;

            if tokio::fs::try_exists(&base_path).await.unwrap_or(false) {
                tracing::debug!(
                    "Workspace {:?} already exists, skipping download",
                    base_path
                );
            } else {
                tracing::debug!(
                    "Copying {}:{} into {:?}",
                    remote.host_id,
                    remote.source_path,
                    base_path
                );
                tokio::fs::create_dir_all(&base_path).await?;

                if let Err(e) = self.transfer.copy_remote_files(remote, &base_path).await {
                    // Neither the partial copy nor its folder number may be reused by a retry.
                    let _ = tokio::fs::remove_dir_all(&base_path).await;
                    let _ = tokio::fs::remove_file(self.map_file(&remote.host_id, &spec.id)).await;
                    tracing::error!("Failed creating local workspace: {:#}", e);
                    return Err(e);
                }

                tracing::info!("Local workspace ready at {:?}", base_path);
            }

            base_path
        };

        Ok(LocalWorkspace {
            spec: spec.clone(),
            base_path,
        })
    }

    /// Returns the folder recorded for this host/run pair, allocating the next
    /// free numbered folder on first use. Caller holds the gate.
    async fn working_folder(&self, host_id: &str, run_id: &str) -> Result<PathBuf> {
        let root = &self.config.working_folder;
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("Failed to create working folder {:?}", root))?;

        let map_file = self.map_file(host_id, run_id);
        if tokio::fs::try_exists(&map_file).await.unwrap_or(false) {
            let recorded = tokio::fs::read_to_string(&map_file).await?;
            return Ok(PathBuf::from(recorded.trim()));
        }

        let folder = next_free_folder(root).await?;
        tokio::fs::write(&map_file, folder.to_string_lossy().as_bytes()).await?;
        Ok(folder)
    }

    fn map_file(&self, host_id: &str, run_id: &str) -> PathBuf {
        self.config
            .working_folder
            .join(map_file_name(host_id, run_id))
    }
}

fn map_file_name(host_id: &str, run_id: &str) -> String {
    let sanitize = |s: &str| {
        s.chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>()
    };
    format!("Host_{}_{}.txt", sanitize(host_id), sanitize(run_id))
}

async fn next_free_folder(root: &Path) -> Result<PathBuf> {
    let mut ix = 1u32;
    loop {
        let candidate = root.join(ix.to_string());
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        ix += 1;
    }
}
