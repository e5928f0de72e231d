//! Volume mount builder: constructs the mount list for sandbox execution.

use std::fs;
use std::path::Path;

use nanoclaw_core::{runner_container_path, runner_dir_name, RuntimeKind, VolumeMount};
use tracing::debug;

use super::security::{validate_additional_mounts, ContainerConfig, MountAllowlist};

/// Registered chat-folder information needed for mount building.
pub struct FolderInfo {
    pub folder: String,
    pub name: String,
    pub container_config: Option<ContainerConfig>,
}

/// Build the volume mount list for a sandbox invocation.
///
/// Mount structure:
/// - Main: project root (ro) + chat folder (rw) + global (if exists)
/// - Non-main: chat folder (rw) + global (ro)
/// - Claude: per-folder `.claude/` sessions directory
/// - All: per-folder IPC namespace, runner source (ro), shared source (non-Claude)
/// - Additional mounts from folder config (validated against allowlist)
pub fn build_volume_mounts(
    folder: &FolderInfo,
    is_main: bool,
    runtime: RuntimeKind,
    project_root: &Path,
    folders_dir: &Path,
    data_dir: &Path,
    allowlist: Option<&MountAllowlist>,
) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    let folder_dir = folders_dir.join(&folder.folder);

    if is_main {
        mounts.push(VolumeMount {
            host_path: project_root.to_string_lossy().to_string(),
            container_path: "/workspace/project".to_string(),
            readonly: true,
            exclude: vec![],
        });

        fs::create_dir_all(&folder_dir).ok();
        mounts.push(VolumeMount {
            host_path: folder_dir.to_string_lossy().to_string(),
            container_path: "/workspace/group".to_string(),
            readonly: false,
            exclude: vec![],
        });
    } else {
        fs::create_dir_all(&folder_dir).ok();
        mounts.push(VolumeMount {
            host_path: folder_dir.to_string_lossy().to_string(),
            container_path: "/workspace/group".to_string(),
            readonly: false,
            exclude: vec![],
        });

        let global_dir = folders_dir.join("global");
        if global_dir.exists() {
            mounts.push(VolumeMount {
                host_path: global_dir.to_string_lossy().to_string(),
                container_path: "/workspace/global".to_string(),
                readonly: true,
                exclude: vec![],
            });
        }
    }

    // Claude runtime: per-folder .claude/ sessions directory with settings and skills.
    if runtime == RuntimeKind::Claude {
        let sessions_dir = data_dir
            .join("sessions")
            .join(&folder.folder)
            .join(".claude");
        fs::create_dir_all(&sessions_dir).ok();

        let settings_file = sessions_dir.join("settings.json");
        if !settings_file.exists() {
            let default_settings = serde_json::json!({
                "env": {
                    "CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS": "1",
                    "CLAUDE_CODE_ADDITIONAL_DIRECTORIES_CLAUDE_MD": "1",
                    "CLAUDE_CODE_DISABLE_AUTO_MEMORY": "0"
                }
            });
            fs::write(
                &settings_file,
                serde_json::to_string_pretty(&default_settings).unwrap() + "\n",
            )
            .ok();
        }

        let skills_src = project_root.join("container").join("skills");
        if skills_src.exists() {
            let skills_dst = sessions_dir.join("skills");
            if let Ok(entries) = fs::read_dir(&skills_src) {
                for entry in entries.flatten() {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        let src_dir = entry.path();
                        let dst_dir = skills_dst.join(entry.file_name());
                        copy_dir_recursive(&src_dir, &dst_dir);
                    }
                }
            }
        }

        mounts.push(VolumeMount {
            host_path: sessions_dir.to_string_lossy().to_string(),
            container_path: "/home/node/.claude".to_string(),
            readonly: false,
            exclude: vec![],
        });
    }

    // Per-folder IPC namespace: `requests`/`results` for sandbox-initiated RPCs,
    // `input` for host-to-sandbox piped follow-up messages.
    let ipc_dir = data_dir.join("ipc").join(&folder.folder);
    for sub in &["requests", "results", "input"] {
        fs::create_dir_all(ipc_dir.join(sub)).ok();
    }
    mounts.push(VolumeMount {
        host_path: ipc_dir.to_string_lossy().to_string(),
        container_path: "/workspace/ipc".to_string(),
        readonly: false,
        exclude: vec![],
    });

    // Mount agent-runner source from host (recompiled on sandbox startup).
    let runner_src = project_root
        .join("container")
        .join(runner_dir_name(runtime))
        .join("src");
    if runner_src.exists() {
        mounts.push(VolumeMount {
            host_path: runner_src.to_string_lossy().to_string(),
            container_path: runner_container_path(runtime),
            readonly: true,
            exclude: vec![],
        });
    }

    // Non-Claude runtimes also need the shared code mounted.
    if runtime != RuntimeKind::Claude {
        let shared_src = project_root.join("container").join("shared");
        if shared_src.exists() {
            mounts.push(VolumeMount {
                host_path: shared_src.to_string_lossy().to_string(),
                container_path: "/app/shared".to_string(),
                readonly: true,
                exclude: vec![],
            });
        }
    }

    // Additional mounts validated against external allowlist.
    if let Some(ref config) = folder.container_config {
        if !config.additional_mounts.is_empty() {
            if let Some(allowlist) = allowlist {
                let validated = validate_additional_mounts(
                    &config.additional_mounts,
                    &folder.name,
                    is_main,
                    allowlist,
                );
                for vm in validated {
                    mounts.push(VolumeMount {
                        host_path: vm.host_path,
                        container_path: vm.container_path,
                        readonly: vm.readonly,
                        exclude: vm.exclude,
                    });
                }
            } else {
                debug!(
                    folder = %folder.name,
                    count = config.additional_mounts.len(),
                    "skipping additional mounts — no allowlist loaded"
                );
            }
        }
    }

    mounts
}

/// Recursively copy a directory.
fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).ok();
    if let Ok(entries) = fs::read_dir(src) {
        for entry in entries.flatten() {
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());
            if src_path.is_dir() {
                copy_dir_recursive(&src_path, &dst_path);
            } else {
                fs::copy(&src_path, &dst_path).ok();
            }
        }
    }
}

/// Generate a safe container name from the workspace folder and timestamp.
pub fn container_name(workspace_folder: &str) -> String {
    let safe_name: String = workspace_folder
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("nanoclaw-{}-{}", safe_name, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_project_dirs(tmp: &TempDir) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
        let project_root = tmp.path().join("project");
        let folders_dir = tmp.path().join("groups");
        let data_dir = tmp.path().join("data");
        fs::create_dir_all(&project_root).unwrap();
        fs::create_dir_all(&folders_dir).unwrap();
        fs::create_dir_all(&data_dir).unwrap();
        (project_root, folders_dir, data_dir)
    }

    #[test]
    fn main_folder_gets_project_root_and_folder_dir() {
        let tmp = TempDir::new().unwrap();
        let (project_root, folders_dir, data_dir) = setup_project_dirs(&tmp);

        let folder = FolderInfo {
            folder: "main".to_string(),
            name: "Main".to_string(),
            container_config: None,
        };

        let mounts = build_volume_mounts(
            &folder,
            true,
            RuntimeKind::Claude,
            &project_root,
            &folders_dir,
            &data_dir,
            None,
        );

        let project_mount = mounts.iter().find(|m| m.container_path == "/workspace/project");
        assert!(project_mount.is_some());
        assert!(project_mount.unwrap().readonly);

        let folder_mount = mounts.iter().find(|m| m.container_path == "/workspace/group");
        assert!(folder_mount.is_some());
        assert!(!folder_mount.unwrap().readonly);
    }

    #[test]
    fn non_main_folder_gets_global_memory() {
        let tmp = TempDir::new().unwrap();
        let (project_root, folders_dir, data_dir) = setup_project_dirs(&tmp);

        fs::create_dir_all(folders_dir.join("global")).unwrap();

        let folder = FolderInfo {
            folder: "team-eng".to_string(),
            name: "Engineering".to_string(),
            container_config: None,
        };

        let mounts = build_volume_mounts(
            &folder,
            false,
            RuntimeKind::Claude,
            &project_root,
            &folders_dir,
            &data_dir,
            None,
        );

        let global_mount = mounts.iter().find(|m| m.container_path == "/workspace/global");
        assert!(global_mount.is_some());
        assert!(global_mount.unwrap().readonly);

        let project_mount = mounts.iter().find(|m| m.container_path == "/workspace/project");
        assert!(project_mount.is_none());
    }

    #[test]
    fn claude_runtime_creates_sessions_dir() {
        let tmp = TempDir::new().unwrap();
        let (project_root, folders_dir, data_dir) = setup_project_dirs(&tmp);

        let folder = FolderInfo {
            folder: "main".to_string(),
            name: "Main".to_string(),
            container_config: None,
        };

        let mounts = build_volume_mounts(
            &folder,
            true,
            RuntimeKind::Claude,
            &project_root,
            &folders_dir,
            &data_dir,
            None,
        );

        let claude_mount = mounts.iter().find(|m| m.container_path == "/home/node/.claude");
        assert!(claude_mount.is_some());

        let settings_path = data_dir.join("sessions/main/.claude/settings.json");
        assert!(settings_path.exists());
    }

    #[test]
    fn non_claude_runtime_skips_sessions_dir() {
        let tmp = TempDir::new().unwrap();
        let (project_root, folders_dir, data_dir) = setup_project_dirs(&tmp);

        let folder = FolderInfo {
            folder: "main".to_string(),
            name: "Main".to_string(),
            container_config: None,
        };

        let mounts = build_volume_mounts(
            &folder,
            true,
            RuntimeKind::Gemini,
            &project_root,
            &folders_dir,
            &data_dir,
            None,
        );

        let claude_mount = mounts.iter().find(|m| m.container_path == "/home/node/.claude");
        assert!(claude_mount.is_none());
    }

    #[test]
    fn ipc_directories_created() {
        let tmp = TempDir::new().unwrap();
        let (project_root, folders_dir, data_dir) = setup_project_dirs(&tmp);

        let folder = FolderInfo {
            folder: "main".to_string(),
            name: "Main".to_string(),
            container_config: None,
        };

        build_volume_mounts(
            &folder,
            true,
            RuntimeKind::Claude,
            &project_root,
            &folders_dir,
            &data_dir,
            None,
        );

        let ipc_base = data_dir.join("ipc/main");
        assert!(ipc_base.join("requests").exists());
        assert!(ipc_base.join("results").exists());
        assert!(ipc_base.join("input").exists());
    }

    #[test]
    fn container_name_sanitizes_folder() {
        let name = container_name("team.eng/special");
        assert!(name.starts_with("nanoclaw-team-eng-special-"));
        assert!(!name.contains('.'));
        assert!(!name.contains('/'));
    }
}
