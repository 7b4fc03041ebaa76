//! In-process execution through a local `/bin/sh` child.

use std::net::IpAddr;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{CommandOutput, ExecutionTarget, OutputSink};
use crate::error::{Error, Result};

pub(super) async fn run(
    target: &ExecutionTarget,
    command: &str,
    sink: Option<&OutputSink>,
) -> Result<CommandOutput> {
    let host = target.host;
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .envs(target.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::connection(host, format!("failed to start command '{command}': {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::connection(host, "failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::connection(host, "failed to capture stderr"))?;

    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    // Partial reads survive a lost select race, so the buffers outlive the loop body.
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut output = String::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    // Interleave both pipes in arrival order.
    while stdout_open || stderr_open {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                let read = read.map_err(|e| Error::connection(host, format!("failed to read stdout: {e}")))?;
                stdout_open = read > 0;
                push_line(&mut output, host, &stdout_buf, sink);
                stdout_buf.clear();
            }
            read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                let read = read.map_err(|e| Error::connection(host, format!("failed to read stderr: {e}")))?;
                stderr_open = read > 0;
                push_line(&mut output, host, &stderr_buf, sink);
                stderr_buf.clear();
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::connection(host, format!("failed to wait for command: {e}")))?;

    Ok(CommandOutput {
        status: status.code().unwrap_or(-1),
        output,
    })
}

/// Append one raw output line exactly as read and hand it, without its
/// terminator, to the sink. Invalid UTF-8 is replaced, never rejected.
pub(super) fn push_line(output: &mut String, host: IpAddr, raw: &[u8], sink: Option<&OutputSink>) {
    if raw.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(raw);
    if let Some(sink) = sink {
        sink(host, text.trim_end_matches(['\n', '\r']));
    }
    output.push_str(&text);
}
