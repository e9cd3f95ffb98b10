//! Exec channels over a pooled SSH session

use super::session::{SshConnection, SshPool};
use crate::adapter::ExecutingGuard;
use crate::handle::{ExecutionHandle, HandleSink};
use crate::process::{normalize_signal, ExitClassifier};
use russh::{Channel, ChannelMsg, Sig};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};
use xrun_command::{posix_group, quote, ShellDialect};
use xrun_foundation::{Error, ExitStatus, OutputStream, Result, SshTarget};

/// Login-shell command line with `cd` / `export` prefixes
///
/// Everything interpolated goes through POSIX quoting since the remote login
/// shell parses the line before the command runs. With a prefix the line is
/// wrapped in a `{ ...\n}` group, so a failed `cd` stops all of it.
pub fn remote_command_line(
    line: &str,
    cwd: Option<&str>,
    env: &BTreeMap<String, String>,
    shell: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(dir) = cwd {
        parts.push(format!("cd {}", quote(dir, ShellDialect::Posix)));
    }
    if !env.is_empty() {
        let assignments: Vec<String> = env
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote(v, ShellDialect::Posix)))
            .collect();
        parts.push(format!("export {}", assignments.join(" ")));
    }
    match shell {
        Some(shell) => parts.push(format!(
            "{} -c {}",
            quote(shell, ShellDialect::Posix),
            quote(line, ShellDialect::Posix)
        )),
        None if parts.is_empty() => return line.to_string(),
        None => parts.push(posix_group(line)),
    }
    parts.join(" && ")
}

fn signal_text(sig: &Sig) -> String {
    let name = match sig {
        Sig::ABRT => "SIGABRT",
        Sig::ALRM => "SIGALRM",
        Sig::FPE => "SIGFPE",
        Sig::HUP => "SIGHUP",
        Sig::ILL => "SIGILL",
        Sig::INT => "SIGINT",
        Sig::KILL => "SIGKILL",
        Sig::PIPE => "SIGPIPE",
        Sig::QUIT => "SIGQUIT",
        Sig::SEGV => "SIGSEGV",
        Sig::TERM => "SIGTERM",
        Sig::USR1 => "SIGUSR1",
        Sig::Custom(name) => return normalize_signal(name),
    };
    name.to_string()
}

/// Open an exec channel on a pooled session and drive it in the background
///
/// The session goes back to the pool when the channel ends. Transport
/// failures mark it broken so the next attempt gets a fresh one.
pub(crate) async fn run_remote(
    pool: &SshPool,
    target: &SshTarget,
    line: String,
    stdin: Option<Vec<u8>>,
    mut guard: ExecutingGuard,
    classify: Option<ExitClassifier>,
) -> Result<ExecutionHandle> {
    let label = target.label();
    let mut conn = pool.acquire(target).await?;

    let channel = match conn.handle.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => {
            conn.mark_broken();
            guard.mark_broken();
            return Err(Error::connection(&label, format!("cannot open session channel: {}", e)));
        }
    };

    trace!(endpoint = %label, connection = conn.id(), command = %line, "exec");
    if let Err(e) = channel.exec(true, line.as_str()).await {
        conn.mark_broken();
        guard.mark_broken();
        return Err(Error::Execution(format!("{}: exec request failed: {}", label, e)));
    }

    if let Some(bytes) = stdin {
        if let Err(e) = channel.data(&bytes[..]).await {
            warn!(endpoint = %label, error = %e, "Failed to send stdin");
        }
    }
    if let Err(e) = channel.eof().await {
        debug!(endpoint = %label, error = %e, "Failed to send EOF");
    }

    let (sink, handle) = ExecutionHandle::channel();
    tokio::spawn(drive(channel, conn, sink, guard, classify, label));
    Ok(handle)
}

enum Step {
    Msg(Option<ChannelMsg>),
    Cancel,
}

async fn drive(
    mut channel: Channel<russh::client::Msg>,
    mut conn: SshConnection,
    mut sink: HandleSink,
    mut guard: ExecutingGuard,
    classify: Option<ExitClassifier>,
    label: String,
) {
    let mut exit: Option<ExitStatus> = None;
    let mut stderr = Vec::new();
    let mut cancelled = false;

    loop {
        let step = tokio::select! {
            msg = channel.wait() => Step::Msg(msg),
            _ = sink.cancelled() => Step::Cancel,
        };
        match step {
            Step::Msg(Some(ChannelMsg::Data { ref data })) => {
                sink.send(OutputStream::Stdout, data.to_vec());
            }
            Step::Msg(Some(ChannelMsg::ExtendedData { ref data, .. })) => {
                if classify.is_some() {
                    stderr.extend_from_slice(data);
                }
                sink.send(OutputStream::Stderr, data.to_vec());
            }
            Step::Msg(Some(ChannelMsg::ExitStatus { exit_status })) => {
                exit = Some(ExitStatus::code(exit_status as i32));
            }
            Step::Msg(Some(ChannelMsg::ExitSignal { signal_name, .. })) => {
                exit = Some(ExitStatus::signal(signal_text(&signal_name)));
            }
            Step::Msg(Some(_)) => {}
            Step::Msg(None) => break,
            Step::Cancel => {
                cancelled = true;
                debug!(endpoint = %label, "Closing cancelled exec channel");
                if let Err(e) = channel.close().await {
                    debug!(endpoint = %label, error = %e, "Channel close failed");
                    conn.mark_broken();
                }
                break;
            }
        }
    }

    let result = if cancelled {
        Err(Error::Cancelled)
    } else {
        match exit {
            Some(status) => match classify.and_then(|f| f(&status, &stderr)) {
                Some(err) => Err(err),
                None => Ok(status),
            },
            None => {
                conn.mark_broken();
                guard.mark_broken();
                Err(Error::connection(&label, "channel closed without an exit status"))
            }
        }
    };

    if conn.is_closed() {
        conn.mark_broken();
    }
    drop(conn);
    drop(guard);
    sink.finish(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_line() {
        assert_eq!(remote_command_line("uptime", None, &BTreeMap::new(), None), "uptime");
    }

    #[test]
    fn test_prefixes_are_quoted() {
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello world".to_string());
        env.insert("MODE".to_string(), "prod".to_string());

        let line = remote_command_line("./deploy.sh", Some("/srv/my app"), &env, None);
        assert_eq!(
            line,
            "cd '/srv/my app' && export GREETING='hello world' MODE=prod && { ./deploy.sh\n}"
        );
    }

    #[test]
    fn test_shell_override_wraps_line() {
        let line = remote_command_line("echo $HOME; ls", None, &BTreeMap::new(), Some("/bin/bash"));
        assert_eq!(line, "/bin/bash -c 'echo $HOME; ls'");
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_cwd_stops_compound_line() {
        let line = remote_command_line(
            "false || echo ran-anyway; echo after",
            Some("/nonexistent/xrun-missing-dir"),
            &BTreeMap::new(),
            None,
        );
        let out = std::process::Command::new("sh").arg("-c").arg(&line).output().unwrap();
        assert!(!out.status.success());
        assert!(out.stdout.is_empty(), "ran: {:?}", String::from_utf8_lossy(&out.stdout));
    }

    #[cfg(unix)]
    #[test]
    fn test_grouped_line_keeps_its_exit_code() {
        let dir = std::env::temp_dir();
        let line = remote_command_line("echo $X # trailing comment", dir.to_str(), &env_of("X", "1"), None);
        let out = std::process::Command::new("sh").arg("-c").arg(&line).output().unwrap();
        assert_eq!(out.stdout, b"1\n");

        let line = remote_command_line("exit 3", dir.to_str(), &BTreeMap::new(), None);
        let out = std::process::Command::new("sh").arg("-c").arg(&line).output().unwrap();
        assert_eq!(out.status.code(), Some(3));
    }

    fn env_of(key: &str, value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(key.to_string(), value.to_string())])
    }

    #[test]
    fn test_signal_text() {
        assert_eq!(signal_text(&Sig::KILL), "SIGKILL");
        assert_eq!(signal_text(&Sig::Custom("WINCH".into())), "SIGWINCH");
    }
}
