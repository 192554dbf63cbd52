use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Stable error codes reported on the `error-output` endpoint.
///
/// The numeric values are part of the reporting contract with the control
/// plane and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetErrorCode {
    NoEnoughSpace,
    ScriptFileExisted,
    SaveScriptFileFailed,
    GetScriptPathFailed,
    SetExecutablePermissionFailed,
    SetWindowsPermissionFailed,
    PowershellNotFound,
    SystemDefaultShellNotFound,
    UnknownCommandType,
    Base64DecodeFailed,
    ResolveEnvironmentParameterFailed,
    ExecuteScriptFailed,
}

impl PresetErrorCode {
    pub fn code(self) -> i32 {
        match self {
            PresetErrorCode::NoEnoughSpace => 1001,
            PresetErrorCode::ScriptFileExisted => 1002,
            PresetErrorCode::SaveScriptFileFailed => 1003,
            PresetErrorCode::GetScriptPathFailed => 1004,
            PresetErrorCode::SetExecutablePermissionFailed => 1005,
            PresetErrorCode::SetWindowsPermissionFailed => 1006,
            PresetErrorCode::PowershellNotFound => 1007,
            PresetErrorCode::SystemDefaultShellNotFound => 1008,
            PresetErrorCode::UnknownCommandType => 1009,
            PresetErrorCode::Base64DecodeFailed => 1010,
            PresetErrorCode::ResolveEnvironmentParameterFailed => 1011,
            PresetErrorCode::ExecuteScriptFailed => 1012,
        }
    }

    /// Description prefix for `errDesc`, e.g. `"NoEnoughSpace: ..."`.
    pub fn prefix(self) -> &'static str {
        match self {
            PresetErrorCode::NoEnoughSpace => "NoEnoughSpace",
            PresetErrorCode::ScriptFileExisted => "ScriptFileExisted",
            PresetErrorCode::SaveScriptFileFailed => "SaveScriptFileFailed",
            PresetErrorCode::GetScriptPathFailed => "GetScriptPathFailed",
            PresetErrorCode::SetExecutablePermissionFailed => "SetExecutablePermissionFailed",
            PresetErrorCode::SetWindowsPermissionFailed => "SetWindowsPermissionFailed",
            PresetErrorCode::PowershellNotFound => "PowershellNotFound",
            PresetErrorCode::SystemDefaultShellNotFound => "SystemDefaultShellNotFound",
            PresetErrorCode::UnknownCommandType => "UnknownCommandType",
            PresetErrorCode::Base64DecodeFailed => "Base64DecodeFailed",
            PresetErrorCode::ResolveEnvironmentParameterFailed => {
                "ResolveEnvironmentParameterFailed"
            }
            PresetErrorCode::ExecuteScriptFailed => "ExecuteScriptFailed",
        }
    }
}

/// Validation failure kinds reported on the `invalid-task` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTaskKind {
    UsernameOrPasswordInvalid,
    TypeInvalid,
    CommandContentInvalid,
    WorkingDirectory,
    InvalidEnvironmentParameter,
}

impl InvalidTaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidTaskKind::UsernameOrPasswordInvalid => "UsernameOrPasswordInvalid",
            InvalidTaskKind::TypeInvalid => "TypeInvalid",
            InvalidTaskKind::CommandContentInvalid => "CommandContentInvalid",
            // Wire value kept lowercase for compatibility.
            InvalidTaskKind::WorkingDirectory => "workingDirectory",
            InvalidTaskKind::InvalidEnvironmentParameter => "InvalidEnvironmentParameter",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to read file {path}: {source}")]
    ReadFile { path: PathBuf, source: io::Error },

    #[error("failed to write file {path}: {source}")]
    WriteFile { path: PathBuf, source: io::Error },

    #[error("script file {path} already exists")]
    ScriptFileExists { path: PathBuf },

    #[error("WorkingDirectoryNotExist")]
    WorkingDirectoryNotExist,

    #[error("DefaultWorkingDirectoryNotAvailable")]
    DefaultWorkingDirectoryNotAvailable,

    #[error("HomeDirectoryNotAvailable")]
    HomeDirectoryNotAvailable,

    #[error("invalid task ({}): {info}", .kind.as_str())]
    InvalidTask { kind: InvalidTaskKind, info: String },

    #[error("{}: {detail}", .code.prefix())]
    Preset { code: PresetErrorCode, detail: String },

    #[error("unregistered periodic task {0}")]
    UnregisteredPeriodicTask(String),

    #[error("invalid schedule expression {0:?}")]
    InvalidSchedule(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn preset(code: PresetErrorCode, detail: impl Into<String>) -> Self {
        EngineError::Preset {
            code,
            detail: detail.into(),
        }
    }
}

/// True for errno values that mean the disk (or quota) is full.
#[cfg(unix)]
pub fn is_no_space_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}

/// ERROR_HANDLE_DISK_FULL (39) and ERROR_DISK_FULL (112).
#[cfg(not(unix))]
pub fn is_no_space_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(39) | Some(112))
}

/// Map an io error to a preset code: disk-full errors override the supplied
/// fallback, anything else keeps it with the raw errno echoed in the detail.
pub fn categorize_io_error(err: &io::Error, fallback: PresetErrorCode) -> (PresetErrorCode, String) {
    if is_no_space_error(err) {
        return (PresetErrorCode::NoEnoughSpace, err.to_string());
    }
    match err.raw_os_error() {
        Some(errno) => (fallback, format!("errno {errno}: {err}")),
        None => (fallback, err.to_string()),
    }
}
