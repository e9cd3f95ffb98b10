//! Docker adapter - Engine API execs through bollard
//!
//! A running container gets an exec (`create_exec` / `start_exec` /
//! `inspect_exec`). An image target gets an ephemeral container that is
//! removed once the command ends. One client handle serves up to
//! `max_concurrent_execs` invocations at a time.
//!
//! The API has no exec cancel. Each exec starts behind a small wrapper that
//! reports its in-container pid on stderr (stripped from the output), and a
//! cancel kills that process tree from a second exec.

use crate::adapter::{ensure_kind, Adapter, AdapterState, ExecutingGuard, PreparedInvocation, StateTracker};
use crate::handle::{ExecutionHandle, HandleSink};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use xrun_foundation::{
    DockerConfig, DockerTarget, EngineConfig, Error, ExitStatus, OutputStream, Result, Target,
    TargetKind,
};

const CLIENT_TIMEOUT_SECS: u64 = 120;

type OutputStreamBox = Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>>;
type InputBox = Pin<Box<dyn AsyncWrite + Send>>;

/// Connect to `host`, or to the local daemon when unset
pub fn connect_docker(host: Option<&str>) -> std::result::Result<Docker, BollardError> {
    match host {
        None => Docker::connect_with_local_defaults(),
        Some(h) if h.starts_with("tcp://") || h.starts_with("http://") => {
            Docker::connect_with_http(h, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        }
        Some(h) => Docker::connect_with_socket(
            h.trim_start_matches("unix://"),
            CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        ),
    }
}

/// Map a bollard error into the engine taxonomy
///
/// Daemon responses keep their HTTP status; socket-level failures are
/// connection errors.
pub fn docker_error(err: BollardError, endpoint: &str, container: Option<&str>) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => Error::Docker {
            message,
            status: Some(status_code),
            container: container.map(str::to_string),
        },
        e @ (BollardError::IOError { .. }
        | BollardError::RequestTimeoutError
        | BollardError::HyperResponseError { .. }
        | BollardError::SocketNotFoundError(_)) => {
            Error::connection(endpoint, e.to_string())
        }
        other => Error::Docker {
            message: other.to_string(),
            status: None,
            container: container.map(str::to_string),
        },
    }
}

fn env_list(invocation: &PreparedInvocation) -> Option<Vec<String>> {
    if invocation.env.is_empty() {
        return None;
    }
    Some(
        invocation
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect(),
    )
}

fn shell_argv(invocation: &PreparedInvocation, default_shell: &str) -> Vec<String> {
    vec![
        invocation.shell.clone().unwrap_or_else(|| default_shell.to_string()),
        "-c".to_string(),
        invocation.command_line.clone(),
    ]
}

/// Prefix of the line the exec wrapper writes to stderr before the command
const PID_MARKER: &str = "__xrun_exec_pid=";

/// Reports `$$` on stderr, then becomes the command so the pid stays valid
const EXEC_WRAPPER: &str = "echo \"__xrun_exec_pid=$$\" >&2; exec \"$@\"";

/// Stops `$1` and every descendant found through `/proc`, then kills them
const KILL_TREE: &str = r#"tree() {
  kill -STOP "$1" 2>/dev/null
  for stat in /proc/[0-9]*/stat; do
    read -r pid comm state ppid rest 2>/dev/null < "$stat" || continue
    [ "$ppid" = "$1" ] && tree "$pid"
  done
  kill -KILL "$1" 2>/dev/null
}
tree "$1""#;

/// Exec argv: the wrapper, then the shell running the command line
///
/// `inspect_exec` reports a host pid, which means nothing inside the
/// container, so the exec reports its own.
fn exec_argv(invocation: &PreparedInvocation, default_shell: &str) -> Vec<String> {
    let mut argv = vec![
        default_shell.to_string(),
        "-c".to_string(),
        EXEC_WRAPPER.to_string(),
        "xrun".to_string(),
    ];
    argv.extend(shell_argv(invocation, default_shell));
    argv
}

/// Pulls the wrapper's pid line off the front of the exec's stderr
#[derive(Debug, Default)]
struct PidLine {
    held: Vec<u8>,
    pid: Option<u32>,
    done: bool,
}

impl PidLine {
    /// Bytes of `message` that belong to the command's own output
    fn strip(&mut self, message: &[u8]) -> Vec<u8> {
        if self.done {
            return message.to_vec();
        }
        self.held.extend_from_slice(message);
        let Some(nl) = self.held.iter().position(|&b| b == b'\n') else {
            if self.held.len() > PID_MARKER.len() + 16 {
                self.done = true;
                return std::mem::take(&mut self.held);
            }
            return Vec::new();
        };

        self.done = true;
        let reported: Option<Option<u32>> = {
            let line = String::from_utf8_lossy(&self.held[..nl]);
            let reported = line
                .trim_end_matches('\r')
                .strip_prefix(PID_MARKER)
                .map(|pid| pid.parse().ok());
            reported
        };
        if let Some(pid) = reported {
            self.pid = pid;
            self.held.drain(..=nl);
        }
        std::mem::take(&mut self.held)
    }

    /// Whatever is still held when the stream ends
    fn flush(&mut self) -> Vec<u8> {
        self.done = true;
        std::mem::take(&mut self.held)
    }
}

/// Exec request for a running container
pub fn exec_options(
    target: &DockerTarget,
    invocation: &PreparedInvocation,
    default_shell: &str,
) -> CreateExecOptions<String> {
    CreateExecOptions {
        cmd: Some(exec_argv(invocation, default_shell)),
        env: env_list(invocation),
        working_dir: invocation.cwd.clone().or_else(|| target.workdir.clone()),
        user: target.user.clone(),
        tty: Some(target.tty),
        attach_stdin: Some(!invocation.stdin.is_null()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    }
}

/// Container definition for an image target
pub fn container_config(
    image: &str,
    target: &DockerTarget,
    invocation: &PreparedInvocation,
    default_shell: &str,
) -> Config<String> {
    let stdin = !invocation.stdin.is_null();
    Config {
        image: Some(image.to_string()),
        cmd: Some(shell_argv(invocation, default_shell)),
        env: env_list(invocation),
        working_dir: invocation.cwd.clone().or_else(|| target.workdir.clone()),
        user: target.user.clone(),
        tty: Some(target.tty),
        attach_stdin: Some(stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(stdin),
        stdin_once: Some(stdin),
        ..Default::default()
    }
}

pub struct DockerAdapter {
    config: DockerConfig,
    client: Mutex<Option<Docker>>,
    execs: Arc<Semaphore>,
    state: Arc<StateTracker>,
}

impl DockerAdapter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            execs: Arc::new(Semaphore::new(config.docker.max_concurrent_execs.max(1))),
            config: config.docker.clone(),
            client: Mutex::new(None),
            state: StateTracker::new("docker", AdapterState::Disconnected),
        }
    }

    fn endpoint(&self) -> String {
        self.config
            .host
            .clone()
            .unwrap_or_else(|| "local docker daemon".to_string())
    }

    /// Client handle, created on first use
    fn client(&self) -> Result<Docker> {
        let mut client = self.client.lock();
        if let Some(docker) = client.as_ref() {
            return Ok(docker.clone());
        }
        self.state.set(AdapterState::Connecting);
        match connect_docker(self.config.host.as_deref()) {
            Ok(docker) => {
                debug!(endpoint = %self.endpoint(), "Docker client created");
                *client = Some(docker.clone());
                self.state.set(AdapterState::Connected);
                Ok(docker)
            }
            Err(e) => {
                self.state.set(AdapterState::Disconnected);
                Err(Error::connection(self.endpoint(), e.to_string()))
            }
        }
    }

    async fn exec_in_container(
        &self,
        docker: Docker,
        container: &str,
        target: &DockerTarget,
        invocation: &PreparedInvocation,
        permit: OwnedSemaphorePermit,
        guard: ExecutingGuard,
    ) -> Result<ExecutionHandle> {
        let endpoint = self.endpoint();
        let options = exec_options(target, invocation, &self.config.default_shell);
        let exec = docker
            .create_exec(container, options)
            .await
            .map_err(|e| docker_error(e, &endpoint, Some(container)))?;

        let started = docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: target.tty,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| docker_error(e, &endpoint, Some(container)))?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(Error::docker("exec started detached", None));
        };
        write_stdin(input, invocation.stdin.as_bytes().map(<[u8]>::to_vec));

        let (sink, handle) = ExecutionHandle::channel();
        let run = ExecRun {
            docker,
            exec_id: exec.id,
            container: container.to_string(),
            endpoint,
        };
        tokio::spawn(run.drive(output, sink, permit, guard));
        Ok(handle)
    }

    async fn run_image(
        &self,
        docker: Docker,
        image: &str,
        target: &DockerTarget,
        invocation: &PreparedInvocation,
        permit: OwnedSemaphorePermit,
        guard: ExecutingGuard,
    ) -> Result<ExecutionHandle> {
        let endpoint = self.endpoint();
        let config = container_config(image, target, invocation, &self.config.default_shell);
        let created = docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| docker_error(e, &endpoint, Some(image)))?;
        let run = ContainerRun {
            docker,
            id: created.id,
            endpoint,
        };
        debug!(image, container = %run.id, "Created ephemeral container");

        let stdin = invocation.stdin.as_bytes().map(<[u8]>::to_vec);
        let attached = run
            .docker
            .attach_container(
                &run.id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(stdin.is_some()),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await;
        let attached = match attached {
            Ok(attached) => attached,
            Err(e) => {
                run.remove().await;
                return Err(docker_error(e, &run.endpoint, Some(run.id.as_str())));
            }
        };

        if let Err(e) = run
            .docker
            .start_container(&run.id, None::<StartContainerOptions<String>>)
            .await
        {
            run.remove().await;
            return Err(docker_error(e, &run.endpoint, Some(run.id.as_str())));
        }
        write_stdin(attached.input, stdin);

        let (sink, handle) = ExecutionHandle::channel();
        tokio::spawn(run.drive(attached.output, sink, permit, guard));
        Ok(handle)
    }
}

fn write_stdin(mut input: InputBox, bytes: Option<Vec<u8>>) {
    let Some(bytes) = bytes else { return };
    tokio::spawn(async move {
        if let Err(e) = input.write_all(&bytes).await {
            debug!(error = %e, "stdin write to container ended early");
        }
        let _ = input.shutdown().await;
    });
}

enum Step {
    Output(Option<std::result::Result<LogOutput, BollardError>>),
    Cancel,
}

/// Forward attached output until it ends, fails or is cancelled
///
/// Returns `Ok(false)` when cancelled. With `pid_line` set, the wrapper's
/// pid report is taken off stderr (or the tty console) first.
async fn pump_output(
    output: &mut OutputStreamBox,
    sink: &mut HandleSink,
    mut pid_line: Option<&mut PidLine>,
) -> std::result::Result<bool, BollardError> {
    loop {
        let step = tokio::select! {
            item = output.next() => Step::Output(item),
            _ = sink.cancelled() => Step::Cancel,
        };
        match step {
            Step::Output(Some(Ok(LogOutput::StdOut { message }))) => {
                sink.send(OutputStream::Stdout, message.to_vec());
            }
            Step::Output(Some(Ok(LogOutput::Console { message }))) => {
                let data = match pid_line.as_deref_mut() {
                    Some(line) => line.strip(&message),
                    None => message.to_vec(),
                };
                if !data.is_empty() {
                    sink.send(OutputStream::Stdout, data);
                }
            }
            Step::Output(Some(Ok(LogOutput::StdErr { message }))) => {
                let data = match pid_line.as_deref_mut() {
                    Some(line) => line.strip(&message),
                    None => message.to_vec(),
                };
                if !data.is_empty() {
                    sink.send(OutputStream::Stderr, data);
                }
            }
            Step::Output(Some(Ok(LogOutput::StdIn { .. }))) => {}
            Step::Output(Some(Err(e))) => return Err(e),
            Step::Output(None) => {
                if let Some(rest) = pid_line.map(PidLine::flush).filter(|rest| !rest.is_empty()) {
                    sink.send(OutputStream::Stderr, rest);
                }
                return Ok(true);
            }
            Step::Cancel => return Ok(false),
        }
    }
}

struct ExecRun {
    docker: Docker,
    exec_id: String,
    container: String,
    endpoint: String,
}

impl ExecRun {
    async fn drive(
        self,
        mut output: OutputStreamBox,
        mut sink: HandleSink,
        permit: OwnedSemaphorePermit,
        mut guard: ExecutingGuard,
    ) {
        let mut pid_line = PidLine::default();
        let result = match pump_output(&mut output, &mut sink, Some(&mut pid_line)).await {
            Ok(true) => self.exit_status().await,
            Ok(false) => {
                drop(output);
                self.kill(pid_line.pid).await;
                Err(Error::Cancelled)
            }
            Err(e) => {
                let err = docker_error(e, &self.endpoint, Some(self.container.as_str()));
                if matches!(err, Error::Connection { .. }) {
                    guard.mark_broken();
                }
                Err(err)
            }
        };
        drop(permit);
        drop(guard);
        sink.finish(result);
    }

    async fn exit_status(&self) -> Result<ExitStatus> {
        let inspect = self
            .docker
            .inspect_exec(&self.exec_id)
            .await
            .map_err(|e| docker_error(e, &self.endpoint, Some(self.container.as_str())))?;
        match inspect.exit_code {
            Some(code) => Ok(ExitStatus::code(code as i32)),
            None => Err(Error::Docker {
                message: "exec finished without an exit code".into(),
                status: None,
                container: Some(self.container.clone()),
            }),
        }
    }

    /// Execs cannot be cancelled through the API; kill the exec's process
    /// tree from a second exec
    async fn kill(&self, pid: Option<u32>) {
        match self.docker.inspect_exec(&self.exec_id).await {
            Ok(inspect) if inspect.running == Some(true) => {}
            Ok(_) => return,
            Err(e) => {
                warn!(container = %self.container, error = %e, "Cannot inspect cancelled exec");
                return;
            }
        }
        let Some(pid) = pid else {
            warn!(container = %self.container, exec = %self.exec_id, "Cancelled exec never reported its pid");
            return;
        };

        let options = CreateExecOptions {
            cmd: Some(kill_tree_argv(pid)),
            user: Some("root".to_string()),
            ..Default::default()
        };
        let killed = match self.docker.create_exec(&self.container, options).await {
            Ok(exec) => self
                .docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match killed {
            Ok(()) => debug!(container = %self.container, pid, "Killed cancelled exec"),
            Err(e) => warn!(container = %self.container, pid, error = %e, "Failed to kill cancelled exec"),
        }
    }
}

fn kill_tree_argv(pid: u32) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        KILL_TREE.to_string(),
        "xrun".to_string(),
        pid.to_string(),
    ]
}

struct ContainerRun {
    docker: Docker,
    id: String,
    endpoint: String,
}

impl ContainerRun {
    async fn drive(
        self,
        mut output: OutputStreamBox,
        mut sink: HandleSink,
        permit: OwnedSemaphorePermit,
        mut guard: ExecutingGuard,
    ) {
        let result = match pump_output(&mut output, &mut sink, None).await {
            Ok(true) => self.wait().await,
            Ok(false) => Err(Error::Cancelled),
            Err(e) => {
                let err = docker_error(e, &self.endpoint, Some(self.id.as_str()));
                if matches!(err, Error::Connection { .. }) {
                    guard.mark_broken();
                }
                Err(err)
            }
        };
        drop(output);
        self.remove().await;
        drop(permit);
        drop(guard);
        sink.finish(result);
    }

    async fn wait(&self) -> Result<ExitStatus> {
        let mut waits = Box::pin(self.docker.wait_container(
            &self.id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));
        match waits.next().await {
            Some(Ok(response)) => Ok(ExitStatus::code(response.status_code as i32)),
            // bollard reports a non-zero exit as an error
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                Ok(ExitStatus::code(code as i32))
            }
            Some(Err(e)) => Err(docker_error(e, &self.endpoint, Some(self.id.as_str()))),
            None => Err(Error::Docker {
                message: "container wait returned no status".into(),
                status: None,
                container: Some(self.id.clone()),
            }),
        }
    }

    async fn remove(&self) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&self.id, Some(options)).await {
            warn!(container = %self.id, error = %e, "Failed to remove ephemeral container");
        }
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Docker
    }

    async fn execute(&self, invocation: PreparedInvocation) -> Result<ExecutionHandle> {
        let Target::Docker(target) = &invocation.target else {
            ensure_kind(TargetKind::Docker, &invocation.target)?;
            return Err(Error::Internal("docker target expected".into()));
        };

        let docker = self.client()?;
        let permit = Arc::clone(&self.execs)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("docker exec limiter closed".into()))?;
        let guard = self.state.begin();

        match (&target.container, &target.image) {
            (Some(container), _) => {
                self.exec_in_container(docker, container, target, &invocation, permit, guard)
                    .await
            }
            (None, Some(image)) => {
                self.run_image(docker, image, target, &invocation, permit, guard)
                    .await
            }
            (None, None) => Err(Error::Validation(
                "docker target requires a container or an image".into(),
            )),
        }
    }

    async fn connect(&self, target: &Target) -> Result<()> {
        ensure_kind(TargetKind::Docker, target)?;
        let docker = self.client()?;
        docker
            .ping()
            .await
            .map_err(|e| Error::connection(self.endpoint(), e.to_string()))?;
        info!(endpoint = %self.endpoint(), "Docker daemon reachable");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.lock().take();
        self.state.set(AdapterState::Disconnected);
        Ok(())
    }

    async fn validate(&self, target: &Target) -> Result<()> {
        ensure_kind(TargetKind::Docker, target)?;
        target.validate()?;
        self.connect(target).await?;

        let Target::Docker(DockerTarget {
            container: Some(name),
            ..
        }) = target
        else {
            return Ok(());
        };
        let inspect = self
            .client()?
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| docker_error(e, &self.endpoint(), Some(name.as_str())))?;
        let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
        if running {
            Ok(())
        } else {
            Err(Error::Docker {
                message: format!("container {} is not running", name),
                status: None,
                container: Some(name.clone()),
            })
        }
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }
}
