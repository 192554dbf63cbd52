//! Child-process supervisor: spawns the interpreter, pumps stdout/stderr
//! into shared buffers, and races process exit against the task deadline
//! and the cancel signal.
//!
//! On Unix the child is started in its own session so the whole process
//! group can be signalled; on Windows the child is bound to a job object
//! with kill-on-close before it can spawn descendants.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::output::SharedBuffer;

/// Grace period after process exit so the OS can flush pipe buffers.
const PIPE_FLUSH_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Fail,
    Timeout,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub kind: ExitKind,
    pub error: Option<io::Error>,
}

impl RunOutcome {
    fn failed(error: io::Error) -> Self {
        Self {
            exit_code: -1,
            kind: ExitKind::Fail,
            error: Some(error),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    username: StdMutex<Option<String>>,
    #[allow(dead_code)] // consumed by the Windows logon path only
    password: StdMutex<Option<String>>,
    home_dir: StdMutex<Option<PathBuf>>,
    cancel: StdMutex<CancellationToken>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_username(&self, username: &str) {
        *self.username.lock().expect("supervisor state poisoned") = Some(username.to_string());
    }

    pub fn set_password(&self, password: &str) {
        *self.password.lock().expect("supervisor state poisoned") = Some(password.to_string());
    }

    pub fn set_home_dir(&self, home: &Path) {
        *self.home_dir.lock().expect("supervisor state poisoned") = Some(home.to_path_buf());
    }

    /// Signal the running child (if any) to be killed. Safe from any thread;
    /// idempotent.
    pub fn cancel(&self) {
        self.cancel.lock().expect("supervisor state poisoned").cancel();
    }

    /// Re-arm the cancel signal before reusing the supervisor for another
    /// invocation of a periodic task.
    pub fn reset(&self) {
        *self.cancel.lock().expect("supervisor state poisoned") = CancellationToken::new();
    }

    /// Run the child to completion, deadline, or cancellation.
    ///
    /// Captured stdout/stderr bytes are appended to the shared buffers as
    /// they arrive; the buffers stay valid after return for the final drain.
    pub async fn sync_run(
        &self,
        work_dir: &Path,
        program: &str,
        args: &[String],
        stdout: &SharedBuffer,
        stderr: &SharedBuffer,
        env: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> RunOutcome {
        let token = self.cancel.lock().expect("supervisor state poisoned").clone();
        let username = self.username.lock().expect("supervisor state poisoned").clone();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !work_dir.as_os_str().is_empty() {
            cmd.current_dir(work_dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(home) = self.home_dir.lock().expect("supervisor state poisoned").clone() {
            cmd.env("HOME", home);
        }

        #[cfg(unix)]
        {
            let creds = match &username {
                Some(name) => match lookup_user(name) {
                    Ok(creds) => Some(creds),
                    Err(err) => return RunOutcome::failed(io::Error::other(err.to_string())),
                },
                None => None,
            };
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if let Some(creds) = &creds {
                        if libc::initgroups(creds.name.as_ptr(), creds.gid as _) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                        if libc::setgid(creds.gid) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                        if libc::setuid(creds.uid) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }
        #[cfg(windows)]
        if username.is_some() {
            // Running under another identity needs CreateProcessWithLogonW,
            // which the process builder cannot express.
            return RunOutcome::failed(io::Error::other(
                "run-as is not supported by this build on Windows",
            ));
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => return RunOutcome::failed(source),
        };

        #[cfg(windows)]
        let _job = match job::KillOnCloseJob::wrap(&child) {
            Ok(job) => Some(job),
            Err(err) => {
                warn!(error = %err, "failed to bind child to job object");
                None
            }
        };

        let mut out_pipe = child.stdout.take().expect("stdout must be piped");
        let stdout_buf = stdout.clone();
        let stdout_task = tokio::spawn(async move {
            let mut chunk = [0u8; 1024];
            loop {
                match out_pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stdout_buf.write(&chunk[..n]),
                }
            }
        });

        let mut err_pipe = child.stderr.take().expect("stderr must be piped");
        let stderr_buf = stderr.clone();
        let stderr_task = tokio::spawn(async move {
            let mut chunk = [0u8; 1024];
            loop {
                match err_pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stderr_buf.write(&chunk[..n]),
                }
            }
        });

        let deadline = sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);

        let (kind, status, error) = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => {
                    sleep(PIPE_FLUSH_WAIT).await;
                    let kind = if status.success() { ExitKind::Success } else { ExitKind::Fail };
                    (kind, Some(status), None)
                }
                Err(source) => (ExitKind::Fail, None, Some(source)),
            },
            _ = &mut deadline => {
                kill_process_tree(&mut child);
                let _ = child.wait().await;
                (ExitKind::Timeout, None, None)
            }
            _ = token.cancelled() => {
                kill_process_tree(&mut child);
                match child.wait().await {
                    Ok(status) => {
                        let kind = if status.success() { ExitKind::Success } else { ExitKind::Fail };
                        (kind, Some(status), None)
                    }
                    Err(source) => (ExitKind::Fail, None, Some(source)),
                }
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        RunOutcome {
            exit_code: status.map(exit_code_of).unwrap_or(-1),
            kind,
            error,
        }
    }

    /// Run a helper command to completion, discarding its output. Used for
    /// interpreter preambles such as setting the PowerShell execution policy.
    pub async fn sync_run_simple(
        &self,
        program: &str,
        args: &[String],
        timeout_secs: u64,
    ) -> anyhow::Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => anyhow::bail!("{program} exited with {status}"),
            Ok(Err(source)) => Err(source.into()),
            Err(_) => {
                kill_process_tree(&mut child);
                let _ = child.wait().await;
                anyhow::bail!("{program} timed out after {timeout_secs}s")
            }
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    match child.id() {
        // The child called setsid, so its pid names the whole group.
        Some(pid) => {
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            if rc != 0 {
                warn!(pid, "failed to signal process group, killing child only");
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    // Descendants die with the job object; this only needs the direct child.
    let _ = child.start_kill();
}

#[cfg(unix)]
pub struct UserCredentials {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    name: std::ffi::CString,
}

#[cfg(unix)]
pub fn lookup_user(name: &str) -> anyhow::Result<UserCredentials> {
    use users::os::unix::UserExt;

    let user =
        users::get_user_by_name(name).ok_or_else(|| anyhow::anyhow!("unknown user {name:?}"))?;
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| anyhow::anyhow!("invalid username {name:?}"))?;
    Ok(UserCredentials {
        uid: user.uid(),
        gid: user.primary_group_id(),
        home: user.home_dir().to_path_buf(),
        name: c_name,
    })
}

/// Validate that the task's target identity exists (and, on Windows, that
/// the password logs on).
#[cfg(unix)]
pub fn check_credentials(username: &str, _password: &str) -> anyhow::Result<()> {
    lookup_user(username).map(|_| ())
}

#[cfg(windows)]
pub fn check_credentials(username: &str, password: &str) -> anyhow::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::Security::{
        LOGON32_LOGON_INTERACTIVE, LOGON32_PROVIDER_DEFAULT, LogonUserW,
    };

    fn wide(s: &str) -> Vec<u16> {
        std::ffi::OsStr::new(s)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    let user = wide(username);
    let domain = wide(".");
    let pass = wide(password);
    let mut token = std::ptr::null_mut();
    let ok = unsafe {
        LogonUserW(
            user.as_ptr(),
            domain.as_ptr(),
            pass.as_ptr(),
            LOGON32_LOGON_INTERACTIVE,
            LOGON32_PROVIDER_DEFAULT,
            &mut token,
        )
    };
    if ok == 0 {
        anyhow::bail!(
            "logon failed for user {username:?}: {}",
            io::Error::last_os_error()
        );
    }
    unsafe { CloseHandle(token) };
    Ok(())
}

#[cfg(windows)]
mod job {
    use std::io;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
        SetInformationJobObject,
    };

    /// Job object with kill-on-close: dropping it terminates the child and
    /// every descendant, even ones the child re-parented.
    pub struct KillOnCloseJob {
        handle: HANDLE,
    }

    // The raw handle is only closed on drop and the job object itself is
    // thread-safe.
    unsafe impl Send for KillOnCloseJob {}

    impl KillOnCloseJob {
        /// Create the job and assign the freshly spawned child before it has
        /// a chance to create descendants of its own.
        pub fn wrap(child: &tokio::process::Child) -> io::Result<Self> {
            let handle = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            let job = Self { handle };

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            let ok = unsafe {
                SetInformationJobObject(
                    job.handle,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const _,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }

            let raw = child
                .raw_handle()
                .ok_or_else(|| io::Error::other("child already reaped"))?;
            let ok = unsafe { AssignProcessToJobObject(job.handle, raw as HANDLE) };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(job)
        }
    }

    impl Drop for KillOnCloseJob {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

#[cfg(test)]
mod tests;
