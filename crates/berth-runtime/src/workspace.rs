use std::path::{Path, PathBuf};

use berth_lifecycle::IsolationKey;

use crate::RuntimeError;

const WORKSPACES_DIR: &str = "workspaces";
const SECRETS_DIR: &str = "secrets";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub workspace: PathBuf,
    pub secrets: PathBuf,
}

/// Per-bot directories keyed by isolation key.
#[async_trait::async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn ensure(&self, key: &IsolationKey) -> Result<WorkspacePaths, RuntimeError>;
    async fn list_workspace_keys(&self) -> Result<Vec<IsolationKey>, RuntimeError>;
    async fn list_secret_keys(&self) -> Result<Vec<IsolationKey>, RuntimeError>;
    /// Deleting a missing directory succeeds.
    async fn delete_workspace(&self, key: &IsolationKey) -> Result<(), RuntimeError>;
    async fn delete_secrets(&self, key: &IsolationKey) -> Result<(), RuntimeError>;
}

/// `<root>/workspaces/<key>` and `<root>/secrets/<key>` on the local disk.
#[derive(Debug, Clone)]
pub struct FsWorkspaces {
    root: PathBuf,
}

impl FsWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, kind: &str, key: &IsolationKey) -> Result<PathBuf, RuntimeError> {
        validate_key(key.as_str())?;
        Ok(self.root.join(kind).join(key.as_str()))
    }

    async fn list(&self, kind: &str) -> Result<Vec<IsolationKey>, RuntimeError> {
        let dir = self.root.join(kind);
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_key(&name).is_err() {
                tracing::debug!(dir = %dir.display(), name, "ignoring foreign directory");
                continue;
            }
            out.push(IsolationKey::from_raw(name));
        }
        out.sort();
        Ok(out)
    }

    async fn delete(&self, kind: &str, key: &IsolationKey) -> Result<(), RuntimeError> {
        let dir = self.dir(kind, key)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys become directory names; only the characters key derivation emits
/// are accepted so nothing can escape the root.
fn validate_key(raw: &str) -> Result<(), RuntimeError> {
    let ok = !raw.is_empty()
        && raw.len() <= 128
        && !raw.starts_with('-')
        && raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::InvalidKey(raw.to_string()))
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait::async_trait]
impl WorkspaceStore for FsWorkspaces {
    async fn ensure(&self, key: &IsolationKey) -> Result<WorkspacePaths, RuntimeError> {
        let workspace = self.dir(WORKSPACES_DIR, key)?;
        let secrets = self.dir(SECRETS_DIR, key)?;
        tokio::fs::create_dir_all(&workspace).await?;
        tokio::fs::create_dir_all(&secrets).await?;
        restrict_permissions(&secrets).await?;
        Ok(WorkspacePaths { workspace, secrets })
    }

    async fn list_workspace_keys(&self) -> Result<Vec<IsolationKey>, RuntimeError> {
        self.list(WORKSPACES_DIR).await
    }

    async fn list_secret_keys(&self) -> Result<Vec<IsolationKey>, RuntimeError> {
        self.list(SECRETS_DIR).await
    }

    async fn delete_workspace(&self, key: &IsolationKey) -> Result<(), RuntimeError> {
        self.delete(WORKSPACES_DIR, key).await
    }

    async fn delete_secrets(&self, key: &IsolationKey) -> Result<(), RuntimeError> {
        self.delete(SECRETS_DIR, key).await
    }
}
