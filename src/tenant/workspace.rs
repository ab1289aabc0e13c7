use crate::runtime::StatePaths;
use crate::shared::TenantId;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Every directory one tenant's worker may touch. All paths are derived
/// from the validated tenant id, so two distinct tenants never share one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantWorkspace {
    pub tenant_id: TenantId,
    pub working_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub messages_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub session_dir: PathBuf,
    pub global_dir: PathBuf,
}

impl TenantWorkspace {
    pub fn resolve(paths: &StatePaths, tenant_id: &TenantId) -> Self {
        let ipc_dir = paths.ipc_dir().join(tenant_id.as_str());
        let working_dir = paths.groups_dir().join(tenant_id.as_str());
        Self {
            tenant_id: tenant_id.clone(),
            logs_dir: working_dir.join("logs"),
            working_dir,
            messages_dir: ipc_dir.join("messages"),
            tasks_dir: ipc_dir.join("tasks"),
            ipc_dir,
            session_dir: paths.sessions_dir().join(tenant_id.as_str()),
            global_dir: paths.global_dir(),
        }
    }

    pub fn current_tasks_snapshot(&self) -> PathBuf {
        self.ipc_dir.join("current_tasks.json")
    }

    pub fn available_groups_snapshot(&self) -> PathBuf {
        self.ipc_dir.join("available_groups.json")
    }

    fn owned_directories(&self) -> [&Path; 6] {
        [
            &self.working_dir,
            &self.logs_dir,
            &self.messages_dir,
            &self.tasks_dir,
            &self.session_dir,
            &self.global_dir,
        ]
    }
}

/// Creates (or confirms) the full directory tree for a tenant. Safe to call
/// before every invocation.
pub fn ensure_workspace(
    paths: &StatePaths,
    tenant_id: &TenantId,
) -> Result<TenantWorkspace, WorkspaceError> {
    let workspace = TenantWorkspace::resolve(paths, tenant_id);
    for dir in workspace.owned_directories() {
        fs::create_dir_all(dir).map_err(|source| WorkspaceError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;
    }
    Ok(workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(raw: &str) -> TenantId {
        TenantId::parse(raw).expect("tenant id")
    }

    #[test]
    fn ensure_workspace_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());

        let first = ensure_workspace(&paths, &id("family")).expect("first");
        fs::write(first.working_dir.join("notes.md"), "keep").expect("write note");
        let second = ensure_workspace(&paths, &id("family")).expect("second");

        assert_eq!(first, second);
        assert!(second.messages_dir.is_dir());
        assert!(second.tasks_dir.is_dir());
        assert!(second.session_dir.is_dir());
        assert_eq!(
            fs::read_to_string(second.working_dir.join("notes.md")).expect("note"),
            "keep"
        );
    }

    #[test]
    fn distinct_tenants_resolve_disjoint_private_paths() {
        let paths = StatePaths::new("/state");
        let a = TenantWorkspace::resolve(&paths, &id("alpha"));
        let b = TenantWorkspace::resolve(&paths, &id("alpha-2"));

        for own in [&a.working_dir, &a.ipc_dir, &a.session_dir] {
            for other in [&b.working_dir, &b.ipc_dir, &b.session_dir] {
                assert!(!own.starts_with(other) && !other.starts_with(own));
            }
        }
        assert_eq!(a.global_dir, b.global_dir);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_root_is_returned_as_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("locked");
        fs::create_dir_all(&root).expect("mkdir");
        fs::set_permissions(&root, fs::Permissions::from_mode(0o500)).expect("chmod");

        let result = ensure_workspace(&StatePaths::new(&root), &id("family"));
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700)).expect("restore");

        // Root bypasses permission bits, so only assert when the check can bite.
        if let Err(err) = result {
            assert!(err.to_string().contains("failed to create workspace directory"));
        }
    }
}
