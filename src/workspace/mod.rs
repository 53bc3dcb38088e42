//! Local Workspaces
//!
//! Every host that runs or enumerates tests needs a local copy of the invoker's
//! build output. This module allocates per-run working folders and fills them
//! from the remote host.
//!
//! ## Submodules
//! - **`handler`**: Working folder allocation behind a process-wide gate.
//! - **`transfer`**: The tar-over-HTTP `FileTransfer` implementation.

pub mod handler;
pub mod transfer;

#[cfg(test)]
mod tests;

use crate::model::types::{InvocationSpec, RemotePathInfo};

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A populated local folder for one invocation.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    pub spec: InvocationSpec,
    pub base_path: PathBuf,
}

impl LocalWorkspace {
    /// Absolute location of the test binary inside the workspace.
    pub fn test_binary(&self) -> PathBuf {
        self.base_path.join(&self.spec.test_assembly_path)
    }
}

/// Copies a folder from another host on the bus into a local folder.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Resolves once the whole folder is present under `local_dest`.
    async fn copy_remote_files(&self, source: &RemotePathInfo, local_dest: &Path) -> Result<()>;
}
