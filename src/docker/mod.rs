//! Docker Engine API wrapper using the bollard crate.
//!
//! Everything the builder and validator need from the daemon lives here:
//! image existence/removal, streaming tar-context builds, the idle
//! validation container lifecycle, and timeout-killed execs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, PushImageOptions, RemoveImageOptions};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::BuildError;

/// Heredoc delimiter for writing scripts into containers. Chosen so no
/// realistic script body contains it as a full line.
const SCRIPT_HEREDOC: &str = "EOF_SWE_KILN_1399519320";

/// Seconds a container gets to stop gracefully before SIGKILL.
const STOP_GRACE_SECS: i64 = 10;

/// Output of a streamed, timeout-bounded container exec.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Combined stdout+stderr collected so far (partial on timeout).
    pub output: String,
    pub timed_out: bool,
}

/// Output of an exec that ran to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub output: String,
    pub exit_code: i64,
}

/// Thin wrapper over a bollard [`Docker`] handle.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect to the local Docker daemon.
    pub fn connect() -> Result<Self, bollard::errors::Error> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Whether an image with this exact tag exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Force-remove an image. Returns `true` on success.
    pub async fn remove_image(&self, image: &str) -> bool {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => true,
            Err(e) => {
                debug!(image = %image, error = %e, "image removal failed");
                false
            }
        }
    }

    /// Build `tag` from the Dockerfile and scripts in `context_dir`.
    ///
    /// The directory is shipped as an in-memory tar archive; the streamed
    /// response is ANSI-stripped into the returned build log. An `error` /
    /// `errorDetail` chunk fails the build with the partial log attached.
    pub async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        platform: &str,
        nocache: bool,
    ) -> Result<String, BuildError> {
        let context = tar_directory(context_dir)
            .map_err(|e| BuildError::Context(format!("tar of {context_dir:?} failed: {e}")))?;

        let options = BuildImageOptions::<String> {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            nocache,
            platform: platform.to_string(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context.into()));

        let mut build_log = String::new();
        while let Some(chunk) = stream.next().await {
            let info = match chunk {
                Ok(info) => info,
                Err(e) => {
                    return Err(BuildError::Failed {
                        image: tag.to_string(),
                        message: e.to_string(),
                        build_log,
                    })
                }
            };
            if let Some(text) = info.stream {
                build_log.push_str(&crate::utils::strip_ansi(&text));
            }
            if info.error.is_some() || info.error_detail.is_some() {
                let message = info
                    .error_detail
                    .and_then(|d| d.message)
                    .or(info.error)
                    .unwrap_or_else(|| "unknown build error".to_string());
                return Err(BuildError::Failed {
                    image: tag.to_string(),
                    message: crate::utils::strip_ansi(&message),
                    build_log,
                });
            }
        }

        Ok(build_log)
    }

    /// Push an image to its registry. The tag is split off the name.
    pub async fn push_image(&self, image: &str) -> Result<(), bollard::errors::Error> {
        let (name, tag) = match image.rsplit_once(':') {
            Some((name, tag)) => (name, tag),
            None => (image, "latest"),
        };
        let options = PushImageOptions { tag };
        let mut stream = self.docker.push_image(name, Some(options), None);
        while let Some(chunk) = stream.next().await {
            let info = chunk?;
            if let Some(error) = info.error {
                return Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 500,
                    message: error,
                });
            }
        }
        Ok(())
    }

    /// Create (but do not start) a container that idles forever, so execs
    /// can be issued against it repeatedly.
    pub async fn create_idle_container(
        &self,
        name: &str,
        image: &str,
        platform: &str,
    ) -> Result<String, bollard::errors::Error> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: Some(platform.to_string()),
        };
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), bollard::errors::Error> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
    }

    /// Stop (graceful, then SIGKILL) and force-remove a container.
    ///
    /// Idempotent: every failure is swallowed after a debug log, so cleanup
    /// can run on any exit path without masking the original error.
    pub async fn cleanup_container(&self, id: &str) {
        if let Err(e) = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            debug!(container = %id, error = %e, "container stop failed (may already be gone)");
        }
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            debug!(container = %id, error = %e, "container removal failed (may already be gone)");
        }
    }

    /// Exec `cmd` in a running container, streaming combined output, for at
    /// most `timeout`.
    ///
    /// On timeout the exec's inner process receives SIGTERM (via its PID
    /// from exec inspect) and the partial output is returned with
    /// `timed_out = true`; the container stays up for subsequent calls.
    pub async fn exec_streamed(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        workdir: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome, bollard::errors::Error> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(workdir.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let start = self.docker.start_exec(&exec.id, None).await?;

        let mut timed_out = false;
        if let StartExecResults::Attached { mut output, .. } = start {
            let sink = buffer.clone();
            let mut reader = tokio::spawn(async move {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(log) => sink.lock().await.extend_from_slice(&log.into_bytes()),
                        Err(_) => break,
                    }
                }
            });

            if tokio::time::timeout(timeout, &mut reader).await.is_err() {
                reader.abort();
                timed_out = true;
                match self.docker.inspect_exec(&exec.id).await {
                    Ok(inspect) => {
                        if let Some(pid) = inspect.pid {
                            self.kill_in_container(container_id, pid).await;
                        }
                    }
                    Err(e) => debug!(container = %container_id, error = %e, "exec inspect failed"),
                }
            }
        }

        let output = String::from_utf8_lossy(&buffer.lock().await).to_string();
        Ok(ExecOutcome { output, timed_out })
    }

    /// Exec `cmd` to completion and report its exit code with combined
    /// output. Used where the caller branches on the code (patch attempts).
    pub async fn exec_with_exit(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        workdir: &str,
    ) -> Result<ExecResult, bollard::errors::Error> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(workdir.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let mut output = String::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                    Err(e) => {
                        warn!(container = %container_id, error = %e, "exec stream error");
                        break;
                    }
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecResult {
            output,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    /// Write `content` to `path` inside the container and mark it
    /// executable.
    ///
    /// The body travels inside a quoted-delimiter heredoc passed as a
    /// single argv element, so shell metacharacters in the script arrive
    /// verbatim.
    pub async fn write_script(
        &self,
        container_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), bollard::errors::Error> {
        let write_cmd = format!("cat <<'{SCRIPT_HEREDOC}' > {path}\n{content}\n{SCRIPT_HEREDOC}");
        let result = self
            .exec_with_exit(
                container_id,
                vec!["bash".to_string(), "-c".to_string(), write_cmd],
                "/",
            )
            .await?;
        if result.exit_code != 0 {
            return Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: format!("writing {path} failed: {}", result.output),
            });
        }
        self.exec_with_exit(
            container_id,
            vec!["chmod".to_string(), "+x".to_string(), path.to_string()],
            "/",
        )
        .await?;
        Ok(())
    }

    /// Send SIGTERM to a PID inside a container, detached.
    async fn kill_in_container(&self, container_id: &str, pid: i64) {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "kill".to_string(),
                        "-TERM".to_string(),
                        pid.to_string(),
                    ]),
                    ..Default::default()
                },
            )
            .await;
        match exec {
            Ok(exec) => {
                let options = StartExecOptions {
                    detach: true,
                    ..Default::default()
                };
                if let Err(e) = self.docker.start_exec(&exec.id, Some(options)).await {
                    debug!(container = %container_id, pid, error = %e, "kill exec failed");
                }
            }
            Err(e) => debug!(container = %container_id, pid, error = %e, "kill exec create failed"),
        }
    }
}

/// Tar up a build-context directory in memory.
fn tar_directory(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all("", dir)?;
    builder.into_inner()
}
