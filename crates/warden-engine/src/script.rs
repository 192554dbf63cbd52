//! Script file materialisation.
//!
//! Script files are left on disk after the run as an audit surface; the one
//! exception is a script whose resolved content carried interpolated
//! secrets, which the task deletes once the invocation finishes.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use warden_core::config::AgentConfig;
use warden_core::error::{EngineError, EngineResult};
use warden_core::types::{CommandKind, RunTaskInfo};

/// Resolve (and create if needed) the directory scripts are written to.
pub fn script_dir(config: &AgentConfig) -> EngineResult<PathBuf> {
    let dir = config.script_dir.clone();
    std::fs::create_dir_all(&dir).map_err(|source| EngineError::WriteFile {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// `{dir}/{commandName-}?{taskId}{ext}`. Shell scripts that run under a
/// target user go to `/tmp` instead so that user can read them.
pub fn script_path(info: &RunTaskInfo, kind: CommandKind, dir: &Path) -> PathBuf {
    let dir = if kind == CommandKind::Shell && !info.username.is_empty() {
        Path::new("/tmp")
    } else {
        dir
    };
    let file_name = if info.command_name.is_empty() {
        format!("{}{}", info.task_id, kind.extension())
    } else {
        format!("{}-{}{}", info.command_name, info.task_id, kind.extension())
    };
    dir.join(file_name)
}

/// Write the script with create-new semantics so a re-delivered task id is
/// detected instead of silently overwritten.
pub async fn save_script_file(path: &Path, content: &[u8]) -> EngineResult<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::AlreadyExists {
                EngineError::ScriptFileExists {
                    path: path.to_path_buf(),
                }
            } else {
                EngineError::WriteFile {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

    file.write_all(content)
        .await
        .map_err(|source| EngineError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;
    file.flush().await.map_err(|source| EngineError::WriteFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> std::io::Result<()> {
    // Windows script access is granted through the target user's ACL by the
    // platform layer; nothing to do here.
    Ok(())
}
