//! Child-process driver shared by the local and kubectl-based adapters

use crate::adapter::ExecutingGuard;
use crate::handle::{ExecutionHandle, HandleSink};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use xrun_foundation::{Error, ExitStatus, OutputStream, Result};

const READ_BUF: usize = 8 * 1024;

/// Classifies a finished process before its status is published
///
/// Receives the captured stderr. Returning an error replaces the exit status.
pub(crate) type ExitClassifier = Box<dyn FnOnce(&ExitStatus, &[u8]) -> Option<Error> + Send>;

/// Spawn `cmd` with piped output and drive it on a background task
///
/// `program` is only used in error messages.
pub(crate) fn spawn(
    mut cmd: Command,
    program: &str,
    stdin: Option<Vec<u8>>,
    guard: ExecutingGuard,
    classify: Option<ExitClassifier>,
) -> Result<ExecutionHandle> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // own group, so cancel reaches everything the shell started
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Execution(format!("failed to spawn {}: {}", program, e)))?;
    debug!(program, pid = child.id(), "Spawned process");

    let (sink, handle) = ExecutionHandle::channel();
    let io = child_io(&mut child, stdin, &sink, classify.is_some());
    let group = child.id();
    tokio::spawn(drive(io, child, group, sink, guard, classify, program.to_string()));
    Ok(handle)
}

struct ChildIo {
    readers: Vec<JoinHandle<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
}

fn child_io(child: &mut Child, stdin: Option<Vec<u8>>, sink: &HandleSink, keep_stderr: bool) -> ChildIo {
    let mut readers = Vec::with_capacity(2);
    if let (Some(out), Some(tx)) = (child.stdout.take(), sink.chunk_sender()) {
        readers.push(tokio::spawn(pump(out, OutputStream::Stdout, tx, false)));
    }
    if let (Some(err), Some(tx)) = (child.stderr.take(), sink.chunk_sender()) {
        readers.push(tokio::spawn(pump(err, OutputStream::Stderr, tx, keep_stderr)));
    }

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(bytes)) => Some(tokio::spawn(async move {
            // EPIPE when the command exits without reading is expected
            if let Err(e) = pipe.write_all(&bytes).await {
                trace!(error = %e, "stdin write ended early");
            }
            let _ = pipe.shutdown().await;
        })),
        _ => None,
    };

    ChildIo { readers, writer }
}

/// Forward one pipe as chunks; optionally keep a copy for the classifier
async fn pump<R>(mut pipe: R, stream: OutputStream, tx: crate::handle::ChunkSender, keep: bool) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if keep {
                    kept.extend_from_slice(&buf[..n]);
                }
                tx.send(stream, &buf[..n]);
            }
            Err(e) => {
                warn!(stream = stream.as_str(), error = %e, "Output read failed");
                break;
            }
        }
    }
    kept
}

/// Await the stdout/stderr readers, returning what they kept
async fn drain(readers: &mut [JoinHandle<Vec<u8>>]) -> Vec<u8> {
    let mut kept = Vec::new();
    for reader in readers.iter_mut() {
        if let Ok(bytes) = reader.await {
            kept.extend(bytes);
        }
    }
    kept
}

/// SIGKILL the process group led by the spawned child
///
/// Reaches background jobs and subshells that outlive the shell itself.
#[cfg(unix)]
fn kill_group(group: Option<u32>, program: &str) {
    let Some(pgid) = group else {
        return;
    };
    // SAFETY: killpg takes plain integers; a group that is already gone gives ESRCH
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        trace!(program, pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>, _program: &str) {}

async fn drive(
    mut io: ChildIo,
    mut child: Child,
    group: Option<u32>,
    mut sink: HandleSink,
    guard: ExecutingGuard,
    classify: Option<ExitClassifier>,
    program: String,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = sink.cancelled() => None,
    };

    let result = match waited {
        Some(Ok(status)) => {
            // background jobs can keep the pipes open after the shell exits
            let drained = tokio::select! {
                kept = drain(&mut io.readers) => Some(kept),
                _ = sink.cancelled() => None,
            };
            match drained {
                Some(stderr) => {
                    let status = exit_status(status);
                    match classify.and_then(|f| f(&status, &stderr)) {
                        Some(err) => Err(err),
                        None => Ok(status),
                    }
                }
                None => {
                    debug!(program = %program, pgid = ?group, "Killing processes left behind by the cancelled command");
                    kill_group(group, &program);
                    for reader in &io.readers {
                        reader.abort();
                    }
                    Err(Error::Cancelled)
                }
            }
        }
        Some(Err(e)) => Err(Error::Execution(format!("failed to wait for {}: {}", program, e))),
        None => {
            debug!(program = %program, pgid = ?group, "Killing cancelled process");
            kill_group(group, &program);
            if let Err(e) = child.kill().await {
                warn!(program = %program, error = %e, "Failed to kill process");
            }
            // anything outside the group may still hold the pipes open
            for reader in &io.readers {
                reader.abort();
            }
            Err(Error::Cancelled)
        }
    };

    if let Some(writer) = io.writer {
        writer.abort();
    }
    drop(guard);
    sink.finish(result);
}

/// Convert a std exit status, reporting the signal name when killed
pub(crate) fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::signal(signal_name(signal));
        }
    }
    ExitStatus::default()
}

/// Conventional name for a signal number
#[cfg(unix)]
pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGBUS => "SIGBUS",
        _ => return format!("SIG{}", signal),
    };
    name.to_string()
}

/// Signal name as reported by SSH (`KILL`, `TERM`, ...) normalized to `SIGKILL`
pub fn normalize_signal(name: &str) -> String {
    if name.starts_with("SIG") {
        name.to_string()
    } else {
        format!("SIG{}", name)
    }
}
