//! Host subprocess gateway.
//!
//! Every host-side shell invocation goes through [`run`]: it never returns
//! an error for a failing child — failure is encoded in the returned
//! [`ShellOutput`] — and a timeout terminates the child's whole process
//! group before reporting `timed_out`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::utils::strip_ansi;

/// Outcome of one host shell command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ShellOutput {
    fn failure(stderr: String) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            exit_code: -1,
            timed_out: false,
        }
    }
}

/// Run `cmd` under `bash -c` in `cwd` with a hard timeout.
///
/// Output is decoded lossily and ANSI-stripped. On timeout the child's
/// process group receives SIGTERM and the direct child is killed.
pub async fn run(cmd: &str, cwd: impl AsRef<Path>, timeout: Duration) -> ShellOutput {
    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return ShellOutput::failure(format!("spawn failed: {e}")),
    };
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ShellOutput {
            stdout: strip_ansi(&String::from_utf8_lossy(&output.stdout)),
            stderr: strip_ansi(&String::from_utf8_lossy(&output.stderr)),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        },
        Ok(Err(e)) => ShellOutput::failure(format!("wait failed: {e}")),
        Err(_) => {
            // the dropped future killed the direct child; sweep the group
            if let Some(pid) = pid {
                let _ = std::process::Command::new("kill")
                    .args(["-TERM", &format!("-{pid}")])
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .status();
            }
            ShellOutput {
                stdout: String::new(),
                stderr: format!("timed out after {}s", timeout.as_secs()),
                exit_code: -1,
                timed_out: true,
            }
        }
    }
}
