use std::{
    io,
    path::{Path, PathBuf},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::fs;
use uuid::Uuid;

use crate::core::domain::{JobId, Workspace};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace for job {0} is already allocated")]
    Conflict(JobId),
    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Roots {
    pub uploads: PathBuf,
    pub games: PathBuf,
    pub patches: PathBuf,
}

impl Roots {
    pub fn under<P: AsRef<Path>>(data: P) -> Self {
        let data = data.as_ref();
        Self {
            uploads: data.join("uploads"),
            games: data.join("games"),
            patches: data.join("patches"),
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.uploads, &self.games, &self.patches]
    }
}

#[derive(Debug)]
struct Allocation {
    workspace: Workspace,
    retain_output: bool,
    released: bool,
}

/// Owns every per-job path below the uploads, games and patches roots.
///
/// A job's upload dir is `uploads/<id>`, its generator working dir is
/// `games/<id>` and its output dir is `patches/<id>`.
#[derive(Debug)]
pub struct WorkspaceManager {
    roots: Roots,
    allocations: DashMap<JobId, Allocation>,
}

impl WorkspaceManager {
    /// Creates the three roots if needed and checks each is a writable
    /// directory. Safe to call on every startup.
    #[tracing::instrument]
    pub async fn init(roots: Roots) -> Result<Self, WorkspaceError> {
        for root in roots.all() {
            fs::create_dir_all(root)
                .await
                .map_err(|e| WorkspaceError::io(root, e))?;
            check_writable(root).await?;
        }
        tracing::info!(
            uploads = %roots.uploads.display(),
            games = %roots.games.display(),
            patches = %roots.patches.display(),
            "Workspace roots ready"
        );

        Ok(Self {
            roots,
            allocations: DashMap::new(),
        })
    }

    #[cfg(test)]
    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    #[tracing::instrument(skip(self))]
    pub async fn allocate(&self, job_id: JobId) -> Result<Workspace, WorkspaceError> {
        let workspace = Workspace {
            job_id,
            upload_dir: self.roots.uploads.join(job_id.to_string()),
            working_dir: self.roots.games.join(job_id.to_string()),
            output_dir: self.roots.patches.join(job_id.to_string()),
        };

        match self.allocations.entry(job_id) {
            Entry::Occupied(_) => return Err(WorkspaceError::Conflict(job_id)),
            Entry::Vacant(entry) => {
                entry.insert(Allocation {
                    workspace: workspace.clone(),
                    retain_output: false,
                    released: false,
                });
            }
        }

        if let Err(e) = create_dirs(&workspace).await {
            self.allocations.remove(&job_id);
            return Err(match e {
                WorkspaceError::Io { source, .. } if source.kind() == io::ErrorKind::AlreadyExists => {
                    WorkspaceError::Conflict(job_id)
                }
                other => other,
            });
        }

        tracing::debug!("Workspace allocated: {:?}", workspace);
        Ok(workspace)
    }

    pub fn get(&self, job_id: &JobId) -> Option<Workspace> {
        self.allocations
            .get(job_id)
            .map(|allocation| allocation.workspace.clone())
    }

    /// Hands the output dir over to the patches area: `release` keeps it.
    pub fn retain_output(&self, job_id: &JobId) {
        if let Some(mut allocation) = self.allocations.get_mut(job_id) {
            allocation.retain_output = true;
        }
    }

    /// Empties the working dir so a retried attempt starts clean.
    pub async fn reset_working(&self, job_id: &JobId) -> Result<(), WorkspaceError> {
        let Some(workspace) = self.get(job_id) else {
            return Ok(());
        };
        remove_dir_if_exists(&workspace.working_dir).await?;
        fs::create_dir(&workspace.working_dir)
            .await
            .map_err(|e| WorkspaceError::io(&workspace.working_dir, e))
    }

    /// Removes the upload and working dirs. The output dir goes too unless it
    /// was retained. Releasing twice, or releasing an unknown job, does
    /// nothing.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, job_id: &JobId) -> Result<(), WorkspaceError> {
        let (workspace, retain_output) = {
            let Some(mut allocation) = self.allocations.get_mut(job_id) else {
                return Ok(());
            };
            if allocation.released {
                return Ok(());
            }
            allocation.released = true;
            (allocation.workspace.clone(), allocation.retain_output)
        };

        remove_dir_if_exists(&workspace.upload_dir).await?;
        remove_dir_if_exists(&workspace.working_dir).await?;
        if !retain_output {
            remove_dir_if_exists(&workspace.output_dir).await?;
        }

        tracing::debug!(retain_output, "Workspace released");
        Ok(())
    }

    /// Deletes everything the job still owns, retained output included, and
    /// forgets the allocation.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self, job_id: &JobId) -> Result<(), WorkspaceError> {
        let Some((_, allocation)) = self.allocations.remove(job_id) else {
            return Ok(());
        };
        let workspace = allocation.workspace;
        remove_dir_if_exists(&workspace.upload_dir).await?;
        remove_dir_if_exists(&workspace.working_dir).await?;
        remove_dir_if_exists(&workspace.output_dir).await?;

        tracing::debug!("Workspace purged");
        Ok(())
    }
}

async fn create_dirs(workspace: &Workspace) -> Result<(), WorkspaceError> {
    let dirs = [
        &workspace.upload_dir,
        &workspace.working_dir,
        &workspace.output_dir,
    ];
    for (idx, dir) in dirs.iter().enumerate() {
        if let Err(e) = fs::create_dir(dir).await {
            // Undo only what this call created; an AlreadyExists dir belongs
            // to someone else.
            for created in &dirs[..idx] {
                let _ = fs::remove_dir_all(created).await;
            }
            return Err(WorkspaceError::io(dir, e));
        }
    }
    Ok(())
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkspaceError::io(dir, e)),
    }
}

async fn check_writable(root: &Path) -> Result<(), WorkspaceError> {
    let metadata = fs::metadata(root)
        .await
        .map_err(|e| WorkspaceError::io(root, e))?;
    if !metadata.is_dir() {
        return Err(WorkspaceError::io(
            root,
            io::Error::other("not a directory"),
        ));
    }

    let probe = root.join(format!(".probe-{}", Uuid::new_v4()));
    fs::write(&probe, b"")
        .await
        .map_err(|e| WorkspaceError::io(root, e))?;
    fs::remove_file(&probe)
        .await
        .map_err(|e| WorkspaceError::io(&probe, e))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    async fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::init(Roots::under(dir.path()))
            .await
            .unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_init_creates_roots_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let roots = Roots::under(dir.path().join("data"));

        WorkspaceManager::init(roots.clone()).await.unwrap();
        WorkspaceManager::init(roots.clone()).await.unwrap();

        assert!(roots.uploads.is_dir());
        assert!(roots.games.is_dir());
        assert!(roots.patches.is_dir());
    }

    #[tokio::test]
    async fn test_init_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let roots = Roots::under(dir.path());
        std::fs::write(&roots.uploads, b"not a dir").unwrap();

        let result = WorkspaceManager::init(roots).await;
        assert!(matches!(result, Err(WorkspaceError::Io { .. })));
    }

    #[tokio::test]
    async fn test_allocate_creates_three_dirs() {
        let (_dir, manager) = manager().await;
        let id = Uuid::new_v4();

        let workspace = manager.allocate(id).await.unwrap();

        assert!(workspace.upload_dir.is_dir());
        assert!(workspace.working_dir.is_dir());
        assert!(workspace.output_dir.is_dir());
        assert!(workspace.upload_dir.starts_with(&manager.roots().uploads));
        assert!(workspace.working_dir.starts_with(&manager.roots().games));
        assert!(workspace.output_dir.starts_with(&manager.roots().patches));
        assert_eq!(manager.get(&id), Some(workspace));
    }

    #[tokio::test]
    async fn test_allocate_twice_conflicts() {
        let (_dir, manager) = manager().await;
        let id = Uuid::new_v4();

        manager.allocate(id).await.unwrap();
        let second = manager.allocate(id).await;

        assert!(matches!(second, Err(WorkspaceError::Conflict(conflict)) if conflict == id));
    }

    #[tokio::test]
    async fn test_allocate_conflicts_with_leftover_dir() {
        let (_dir, manager) = manager().await;
        let id = Uuid::new_v4();
        std::fs::create_dir(manager.roots().games.join(id.to_string())).unwrap();

        let result = manager.allocate(id).await;

        assert!(matches!(result, Err(WorkspaceError::Conflict(_))));
        assert!(manager.get(&id).is_none());
        // The pre-existing dir is not ours to delete.
        assert!(manager.roots().games.join(id.to_string()).is_dir());
        assert!(!manager.roots().uploads.join(id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_dir, manager) = manager().await;
        let id = Uuid::new_v4();
        let workspace = manager.allocate(id).await.unwrap();
        std::fs::write(workspace.upload_dir.join("Alice.yaml"), "name: Alice").unwrap();

        manager.release(&id).await.unwrap();
        manager.release(&id).await.unwrap();
        manager.release(&Uuid::new_v4()).await.unwrap();

        assert!(!workspace.upload_dir.exists());
        assert!(!workspace.working_dir.exists());
        assert!(!workspace.output_dir.exists());
    }

    #[tokio::test]
    async fn test_release_keeps_retained_output() {
        let (_dir, manager) = manager().await;
        let id = Uuid::new_v4();
        let workspace = manager.allocate(id).await.unwrap();
        std::fs::write(workspace.artifact_path("zip"), b"PK").unwrap();

        manager.retain_output(&id);
        manager.release(&id).await.unwrap();

        assert!(!workspace.upload_dir.exists());
        assert!(!workspace.working_dir.exists());
        assert!(workspace.artifact_path("zip").is_file());

        manager.purge(&id).await.unwrap();
        assert!(!workspace.output_dir.exists());
        assert!(manager.get(&id).is_none());
        manager.purge(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_working_empties_dir() {
        let (_dir, manager) = manager().await;
        let id = Uuid::new_v4();
        let workspace = manager.allocate(id).await.unwrap();
        std::fs::write(workspace.working_dir.join("partial.zip"), b"PK").unwrap();

        manager.reset_working(&id).await.unwrap();

        assert!(workspace.working_dir.is_dir());
        assert_eq!(std::fs::read_dir(&workspace.working_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_disjoint() {
        let (_dir, manager) = manager().await;
        let manager = std::sync::Arc::new(manager);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.allocate(Uuid::new_v4()).await.unwrap() })
            })
            .collect();
        let workspaces = futures::future::join_all(handles).await;

        let mut seen = HashSet::new();
        for workspace in workspaces {
            let workspace = workspace.unwrap();
            for dir in [
                workspace.upload_dir,
                workspace.working_dir,
                workspace.output_dir,
            ] {
                assert!(seen.insert(dir.clone()), "shared dir {}", dir.display());
            }
        }
        assert_eq!(seen.len(), 48);
    }
}
