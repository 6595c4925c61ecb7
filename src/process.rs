//! Process launching and reclaiming.
//!
//! A session owns exactly one child. The launcher hands back the child
//! together with its stdin/stdout pipes; it never waits for the child to exit.
//! Once the session has closed the pipes, [`reclaim`] applies the configured
//! [`ReclaimPolicy`].

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::LaunchError;

/// What to run for a session.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Send stderr to /dev/null instead of inheriting the server's.
    pub discard_stderr: bool,
}

/// What to do with a child that may still be running once its pipes are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Reap it if it has already exited, otherwise leave it to a background waiter.
    #[default]
    Detach,
    /// Wait `grace` between each of SIGINT, SIGTERM and SIGKILL.
    Escalate { grace: Duration },
}

/// A freshly started child with both pipes ready for use.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Start `spec` with exactly the given environment.
///
/// The parent environment is cleared first; entries are applied in order so a
/// later duplicate key wins. An entry without `=` sets an empty value.
pub fn launch(spec: &ProcessSpec, env: &[String]) -> Result<LaunchedProcess, LaunchError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);

    if let Some(ref dir) = spec.working_dir {
        cmd.current_dir(dir);
    }

    cmd.env_clear();
    for entry in env {
        match entry.split_once('=') {
            Some((key, value)) => cmd.env(key, value),
            None => cmd.env(entry, ""),
        };
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(if spec.discard_stderr {
        Stdio::null()
    } else {
        Stdio::inherit()
    });

    let mut child = cmd.spawn().map_err(|e| spawn_error(spec, e))?;

    let stdin = child.stdin.take().ok_or_else(|| LaunchError::StdinUnavailable {
        program: spec.program.clone(),
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LaunchError::StdoutUnavailable {
            program: spec.program.clone(),
        })?;

    debug!(program = %spec.program, pid = ?child.id(), "Process started");

    Ok(LaunchedProcess {
        child,
        stdin,
        stdout,
    })
}

fn spawn_error(spec: &ProcessSpec, e: io::Error) -> LaunchError {
    // A missing working directory also surfaces as NotFound.
    let bad_dir = spec.working_dir.as_ref().is_some_and(|dir| !dir.is_dir());
    if e.kind() == io::ErrorKind::NotFound && !bad_dir {
        LaunchError::NotFound {
            program: spec.program.clone(),
        }
    } else {
        LaunchError::Spawn {
            program: spec.program.clone(),
            source: e,
        }
    }
}

/// Reclaim a child whose pipes have been closed.
///
/// Returns the exit status when it is known by the time this returns.
pub async fn reclaim(mut child: Child, policy: ReclaimPolicy) -> Option<ExitStatus> {
    match policy {
        ReclaimPolicy::Detach => match child.try_wait() {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                debug!(pid = ?child.id(), "Process still running after pipe close");
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => debug!(%status, "Detached process exited"),
                        Err(e) => debug!(error = %e, "Failed to wait for detached process"),
                    }
                });
                None
            }
            Err(e) => {
                debug!(error = %e, "Failed to poll process status");
                None
            }
        },
        ReclaimPolicy::Escalate { grace } => escalate(&mut child, grace).await,
    }
}

async fn escalate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let mut signals = [libc::SIGINT, libc::SIGTERM].into_iter();

    loop {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for process");
                return None;
            }
            Err(_) => {}
        }

        match signals.next() {
            Some(signal) => send_signal(child, signal),
            None => break,
        }
    }

    warn!(pid = ?child.id(), "Process ignored SIGINT and SIGTERM, killing");
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
        return None;
    }
    child.try_wait().ok().flatten()
}

fn send_signal(child: &Child, signal: libc::c_int) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!(pid, signal, "Signalling process");
    // SAFETY: kill(2) has no memory-safety preconditions; pid is our own unreaped child.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        debug!(pid, signal, error = %io::Error::last_os_error(), "kill failed");
    }
}

/// Signal number that terminated the child, if any.
pub fn terminating_signal(status: &ExitStatus) -> Option<i32> {
    status.signal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn spec(program: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            discard_stderr: true,
        }
    }

    #[tokio::test]
    async fn test_launch_pipes_are_ready() {
        let mut launched = launch(&spec("/bin/cat", &[]), &[]).unwrap();

        launched.stdin.write_all(b"ping\n").await.unwrap();
        drop(launched.stdin);

        let mut output = String::new();
        launched.stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "ping\n");

        let status = launched.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_launch_passes_environment_in_order() {
        let env = vec![
            "GREETING=hello".to_string(),
            "GREETING=hi".to_string(),
            "EMPTY".to_string(),
        ];
        let mut launched = launch(
            &spec("/bin/sh", &["-c", "echo \"$GREETING:${EMPTY-unset}:${HOME-none}\""]),
            &env,
        )
        .unwrap();
        drop(launched.stdin);

        let mut output = String::new();
        launched.stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "hi::none\n");
        launched.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_in_working_dir() {
        let mut spec = spec("/bin/sh", &["-c", "pwd"]);
        spec.working_dir = Some(PathBuf::from("/"));
        let mut launched = launch(&spec, &[]).unwrap();
        drop(launched.stdin);

        let mut output = String::new();
        launched.stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "/\n");
        launched.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let err = launch(&spec("/definitely/not/a/program", &[]), &[]).unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_launch_missing_working_dir() {
        let mut spec = spec("/bin/cat", &[]);
        spec.working_dir = Some(PathBuf::from("/definitely/not/a/dir"));
        let err = launch(&spec, &[]).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_launch_not_executable() {
        let err = launch(&spec("/", &[]), &[]).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_reclaim_detach_reports_exited_child() {
        let mut launched = launch(&spec("/bin/sh", &["-c", "exit 3"]), &[]).unwrap();
        drop(launched.stdin);
        drop(launched.stdout);
        // Let the child finish so try_wait observes it.
        let status = launched.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));

        let status = reclaim(launched.child, ReclaimPolicy::Detach).await;
        assert_eq!(status.and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn test_reclaim_escalate_interrupts_sleeper() {
        let launched = launch(&spec("/bin/sleep", &["30"]), &[]).unwrap();
        drop(launched.stdin);
        drop(launched.stdout);

        let policy = ReclaimPolicy::Escalate {
            grace: Duration::from_millis(50),
        };
        let status = reclaim(launched.child, policy).await.unwrap();
        assert_eq!(terminating_signal(&status), Some(libc::SIGINT));
    }

    #[tokio::test]
    async fn test_reclaim_escalate_kills_stubborn_child() {
        let launched = launch(
            &spec("/bin/sh", &["-c", "trap '' INT TERM; exec /bin/sleep 30"]),
            &[],
        )
        .unwrap();
        drop(launched.stdin);
        drop(launched.stdout);

        // Give the shell time to install its traps before escalation starts.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let policy = ReclaimPolicy::Escalate {
            grace: Duration::from_millis(50),
        };
        let status = reclaim(launched.child, policy).await.unwrap();
        assert_eq!(terminating_signal(&status), Some(libc::SIGKILL));
    }
}
