//! Local process execution with timeout, guaranteed kill and line streaming

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::session::{CommandOutput, OutputLine, OutputStream};

/// Output kept per pipe; older bytes are dropped first
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// How a process run ended
#[derive(Debug)]
pub enum Completion {
    Exited(CommandOutput),
    TimedOut,
}

/// Run `command` to completion or until `timeout`, then kill it.
///
/// stdout and stderr are drained concurrently with `wait()` so a chatty
/// child can never block on a full pipe.
pub async fn run_to_completion(
    mut command: Command,
    timeout: Duration,
    lines: Option<mpsc::UnboundedSender<OutputLine>>,
) -> std::io::Result<Completion> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    tokio::select! {
        result = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                drain(stdout_handle, OutputStream::Stdout, lines.clone()),
                drain(stderr_handle, OutputStream::Stderr, lines.clone()),
            );
            let status = status?;
            Ok::<_, std::io::Error>(Completion::Exited(CommandOutput {
                // killed by a signal: report like a shell would
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            }))
        } => result,
        () = tokio::time::sleep(timeout) => {
            let _ = child.kill().await;
            Ok(Completion::TimedOut)
        }
    }
}

/// Read a pipe line by line, forwarding and capturing
pub async fn drain<R>(
    reader: Option<R>,
    stream: OutputStream,
    lines: Option<mpsc::UnboundedSender<OutputLine>>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let Some(reader) = reader else {
        return captured;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if let Some(tx) = &lines {
                    let _ = tx.send(OutputLine {
                        stream,
                        line: line.to_string(),
                    });
                }
                captured.push_str(line);
                captured.push('\n');
                if captured.len() > MAX_CAPTURE_BYTES {
                    let mut cut = captured.len() - MAX_CAPTURE_BYTES;
                    while !captured.is_char_boundary(cut) {
                        cut += 1;
                    }
                    captured.drain(..cut);
                }
            }
        }
    }
    captured
}
