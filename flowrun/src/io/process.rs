//! Running step processes with live tee capture and an optional timeout.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::capture::CaptureLog;

/// How a child process ended.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub timed_out: bool,
}

/// Run `cmd`, forwarding stdout and stderr into `capture` as they arrive.
///
/// Both pipes are drained on their own threads so a chatty child cannot
/// deadlock. When `timeout` elapses the child is killed and `timed_out` is
/// set; output produced up to that point stays in the log.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs())))]
pub fn run_command_with_tee(
    mut cmd: Command,
    timeout: Option<Duration>,
    capture: &CaptureLog,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_capture = capture.clone();
    let stdout_handle =
        thread::spawn(move || tee_lines(stdout, |line| stdout_capture.write_stdout(line)));
    let stderr_capture = capture.clone();
    let stderr_handle =
        thread::spawn(move || tee_lines(stderr, |line| stderr_capture.write_stderr(line)));

    let mut timed_out = false;
    let status = match timeout {
        None => child.wait().context("wait for command")?,
        Some(limit) => match child.wait_timeout(limit).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
    };

    join_reader(stdout_handle).context("join stdout")?;
    join_reader(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput { status, timed_out })
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Forward a stream line by line; the final unterminated line is forwarded as-is.
fn tee_lines<R: Read>(reader: R, mut sink: impl FnMut(&[u8])) -> Result<()> {
    let mut buf_reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }
        sink(&line);
    }
    Ok(())
}

/// Whether a process with `pid` still exists on this host.
///
/// Platforms without a liveness check report every process as alive.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
