use crate::tenant::TenantWorkspace;
use std::collections::BTreeMap;
use std::path::Path;

pub const ENV_TENANT_ID: &str = "CLAWKEEPER_TENANT_ID";
pub const ENV_WORKSPACE_DIR: &str = "CLAWKEEPER_WORKSPACE_DIR";
pub const ENV_GLOBAL_DIR: &str = "CLAWKEEPER_GLOBAL_DIR";
pub const ENV_IPC_DIR: &str = "CLAWKEEPER_IPC_DIR";
pub const ENV_SESSION_DIR: &str = "CLAWKEEPER_SESSION_DIR";
pub const ENV_PROJECT_ROOT: &str = "CLAWKEEPER_PROJECT_ROOT";

/// Variables layered on top of the inherited host environment. The project
/// root is only ever set for the privileged tenant; callers must also strip
/// any inherited value for everyone else.
pub fn worker_environment(
    workspace: &TenantWorkspace,
    is_privileged: bool,
    project_root: Option<&Path>,
) -> BTreeMap<&'static str, String> {
    let mut env = BTreeMap::new();
    env.insert(ENV_TENANT_ID, workspace.tenant_id.to_string());
    env.insert(ENV_WORKSPACE_DIR, display(&workspace.working_dir));
    env.insert(ENV_GLOBAL_DIR, display(&workspace.global_dir));
    env.insert(ENV_IPC_DIR, display(&workspace.ipc_dir));
    env.insert(ENV_SESSION_DIR, display(&workspace.session_dir));
    if is_privileged {
        if let Some(root) = project_root {
            env.insert(ENV_PROJECT_ROOT, display(root));
        }
    }
    env
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::StatePaths;
    use crate::shared::TenantId;

    #[test]
    fn project_root_is_privileged_only() {
        let paths = StatePaths::new("/state");
        let workspace = TenantWorkspace::resolve(&paths, &TenantId::parse("family").expect("id"));
        let root = Path::new("/srv/project");

        let plain = worker_environment(&workspace, false, Some(root));
        assert!(!plain.contains_key(ENV_PROJECT_ROOT));
        assert_eq!(plain[ENV_IPC_DIR], "/state/ipc/family");
        assert_eq!(plain[ENV_WORKSPACE_DIR], "/state/groups/family");

        let privileged = worker_environment(&workspace, true, Some(root));
        assert_eq!(privileged[ENV_PROJECT_ROOT], "/srv/project");
    }
}
