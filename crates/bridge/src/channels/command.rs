//! Subprocess plumbing shared by the command-driven channels.
//!
//! Commands are configured as a program plus argument templates. Captured
//! commands run under a timeout; streamed commands hand their stdout to the
//! transfer engine, are killed when they stall, and are reaped when the
//! stream ends or is dropped.

use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use access::{BridgeError, DeviceDescriptor, RemoteStream, Result};

/// Interval between two exit checks of a captured command.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Most stderr bytes kept for error messages.
const MAX_STDERR: usize = 4096;

/// Read size of the stdout pump of a streamed command.
const STREAM_CHUNK: usize = 64 * 1024;

/// Chunks a streamed command may run ahead of its reader.
const STREAM_BACKLOG: usize = 4;

/// Values substituted into argument templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub device: &'a DeviceDescriptor,
    pub handle: &'a str,
    pub path: &'a str,
}

/// Replaces `{device}`, `{vendor_id}`, `{product_id}`, `{handle}` and
/// `{path}` in every template.
pub fn render_args(templates: &[String], vars: &TemplateVars<'_>) -> Vec<String> {
    templates
        .iter()
        .map(|t| {
            t.replace("{device}", &vars.device.display_name)
                .replace("{vendor_id}", &vars.device.vendor_id)
                .replace("{product_id}", &vars.device.product_id)
                .replace("{handle}", vars.handle)
                .replace("{path}", vars.path)
        })
        .collect()
}

/// Whether `program` can be found on PATH (or is an existing path).
pub fn is_program_available(program: &str) -> bool {
    !program.is_empty() && which::which(program).is_ok()
}

fn spawn_error(program: &str, err: io::Error) -> BridgeError {
    let base = match err.kind() {
        io::ErrorKind::NotFound => BridgeError::not_supported(format!("{program} not found")),
        io::ErrorKind::PermissionDenied => {
            BridgeError::access_denied(format!("{program} is not executable"))
        }
        _ => BridgeError::transport(format!("failed to start {program}")),
    };
    base.with_source(err).with_context("program", program)
}

fn collect_stderr(mut stderr: impl Read + Send + 'static) -> (Arc<Mutex<String>>, JoinHandle<()>) {
    let buffer = Arc::new(Mutex::new(String::new()));
    let sink = buffer.clone();
    let handle = thread::spawn(move || {
        let mut chunk = [0u8; 1024];
        loop {
            match stderr.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut out) = sink.lock() {
                        if out.len() < MAX_STDERR {
                            out.push_str(&String::from_utf8_lossy(&chunk[..n]));
                        }
                    }
                }
            }
        }
    });
    (buffer, handle)
}

fn stderr_text(buffer: &Arc<Mutex<String>>) -> String {
    buffer
        .lock()
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn exit_error(program: &str, status: ExitStatus, stderr: &str) -> BridgeError {
    let mut err = BridgeError::transport(format!("{program} exited with {status}"))
        .with_context("program", program);
    if !stderr.is_empty() {
        err = err.with_context("stderr", stderr);
    }
    err
}

/// Runs a command to completion and returns its stdout.
///
/// Fails with `Timeout` (after killing the child) if it runs longer than
/// `timeout`, and with `TransportFailure` on a non-zero exit.
pub fn run_capture(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    tracing::debug!(program, ?args, "Running command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let stdout_reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut out = Vec::new();
            let _ = stdout.read_to_end(&mut out);
            out
        })
    });
    let stderr = child.stderr.take().map(collect_stderr);

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BridgeError::timeout(format!(
                "{program} did not finish within {timeout:?}"
            ))
            .with_context("program", program));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let stderr = match stderr {
        Some((buffer, handle)) => {
            let _ = handle.join();
            stderr_text(&buffer)
        }
        None => String::new(),
    };

    if !status.success() {
        return Err(exit_error(program, status, &stderr));
    }
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Starts a command whose stdout is the content of one file.
///
/// A read that sees no output for `idle_timeout` kills the child and fails
/// with `TimedOut`.
pub fn spawn_stream(program: &str, args: &[String], idle_timeout: Duration) -> Result<ChildStream> {
    tracing::debug!(program, ?args, ?idle_timeout, "Starting streaming command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::transport(format!("{program} has no stdout")))?;
    let stderr = child.stderr.take().map(collect_stderr);

    Ok(ChildStream {
        program: program.to_string(),
        child,
        output: pump_stdout(stdout),
        pending: Vec::new(),
        offset: 0,
        idle_timeout,
        stderr,
        reaped: false,
    })
}

/// Forwards stdout in chunks; an empty chunk marks end of stream.
fn pump_stdout(mut stdout: ChildStdout) -> Receiver<io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::sync_channel(STREAM_BACKLOG);
    thread::spawn(move || {
        let mut chunk = vec![0u8; STREAM_CHUNK];
        loop {
            match stdout.read(&mut chunk) {
                Ok(n) => {
                    if tx.send(Ok(chunk[..n].to_vec())).is_err() || n == 0 {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });
    rx
}

/// Non-seekable stream over a child's stdout.
///
/// At end of stream the child is reaped and a non-zero exit status turns
/// into a read error, so a fetch that dies halfway is never mistaken for a
/// short file.
pub struct ChildStream {
    program: String,
    child: Child,
    output: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    idle_timeout: Duration,
    stderr: Option<(Arc<Mutex<String>>, JoinHandle<()>)>,
    reaped: bool,
}

impl ChildStream {
    fn reap(&mut self) -> io::Result<()> {
        self.reaped = true;
        let status = self.child.wait()?;
        let stderr = match self.stderr.take() {
            Some((buffer, handle)) => {
                let _ = handle.join();
                stderr_text(&buffer)
            }
            None => String::new(),
        };
        if status.success() {
            return Ok(());
        }
        let msg = if stderr.is_empty() {
            format!("{} exited with {}", self.program, status)
        } else {
            format!("{} exited with {}: {}", self.program, status, stderr)
        };
        Err(io::Error::other(msg))
    }

    fn stall(&mut self) -> io::Error {
        tracing::warn!(
            program = %self.program,
            timeout = ?self.idle_timeout,
            "Fetch stalled, killing it"
        );
        self.reaped = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} produced no output for {:?}", self.program, self.idle_timeout),
        )
    }
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset >= self.pending.len() {
            if self.reaped {
                return Ok(0);
            }
            match self.output.recv_timeout(self.idle_timeout) {
                Ok(Ok(chunk)) if chunk.is_empty() => {
                    self.reap()?;
                    return Ok(0);
                }
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => return Err(self.stall()),
                Err(RecvTimeoutError::Disconnected) => {
                    self.reap()?;
                    return Ok(0);
                }
            }
        }
        let n = (self.pending.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl RemoteStream for ChildStream {}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
