//! Bounded process output capture
//!
//! Reads stdout and stderr concurrently into a shared byte budget. Once
//! the budget is spent further output is drained and discarded so the
//! child never blocks on a full pipe, and the exit status is still
//! collected. On timeout the whole process group is killed.

use crate::error::{Error, Result};
use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead};

/// Limits applied to one captured process
#[derive(Debug, Clone)]
pub struct CaptureLimits {
    /// Wall-clock limit after which the process is killed
    pub timeout: Duration,
    /// Combined stdout + stderr bytes kept
    pub max_output_bytes: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_output_bytes: 50_000,
        }
    }
}

/// Which pipe a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of buffered output, forwarded while the process runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// What happened to a captured process
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration: Duration,
    /// OS pid of the spawned process
    pub pid: Option<u32>,
}

/// Runs a process under `CaptureLimits`
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    limits: CaptureLimits,
    chunks: Option<mpsc::Sender<OutputChunk>>,
}

impl OutputCapture {
    pub fn new(limits: CaptureLimits) -> Self {
        Self {
            limits,
            chunks: None,
        }
    }

    /// Forward kept output to `tx` as it arrives (best-effort, never blocks).
    pub fn with_chunks(mut self, tx: Option<mpsc::Sender<OutputChunk>>) -> Self {
        self.chunks = tx;
        self
    }

    pub fn limits(&self) -> &CaptureLimits {
        &self.limits
    }

    /// Spawn `command` and capture it.
    ///
    /// Only a spawn failure is an `Err`; timeouts and non-zero exits are
    /// reported in the outcome.
    pub async fn run(&self, mut command: Command) -> Result<CaptureOutcome> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.limits.timeout;

        let mut child = command
            .spawn()
            .map_err(|e| Error::Execution(format!("Failed to spawn process: {}", e)))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr was not piped".to_string()))?;
        let mut stdout = FramedRead::new(stdout, BytesCodec::new());
        let mut stderr = FramedRead::new(stderr, BytesCodec::new());

        let mut buffer = CaptureBuffer::new(self.limits.max_output_bytes);
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut timed_out = false;

        while stdout_open || stderr_open {
            tokio::select! {
                frame = stdout.next(), if stdout_open => {
                    stdout_open = self.accept_frame(&mut buffer, OutputStream::Stdout, frame);
                }
                frame = stderr.next(), if stderr_open => {
                    stderr_open = self.accept_frame(&mut buffer, OutputStream::Stderr, frame);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let mut status = None;
        if !timed_out {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(exit)) => status = Some(exit),
                Ok(Err(e)) => {
                    tracing::warn!(pid = ?pid, "Failed to wait for process: {}", e);
                }
                Err(_) => timed_out = true,
            }
        }

        if timed_out {
            tracing::warn!(
                pid = ?pid,
                timeout_secs = self.limits.timeout.as_secs(),
                "Process exceeded time limit, killing"
            );
            kill_process_tree(&mut child).await;
        }

        let (stdout, stderr) = buffer.finish();
        Ok(CaptureOutcome {
            stdout,
            stderr,
            exit_code: status.and_then(exit_code_of),
            timed_out,
            truncated: buffer.truncated,
            duration: started.elapsed(),
            pid,
        })
    }

    /// Buffer one frame; returns whether the stream is still open.
    fn accept_frame(
        &self,
        buffer: &mut CaptureBuffer,
        stream: OutputStream,
        frame: Option<std::io::Result<BytesMut>>,
    ) -> bool {
        match frame {
            Some(Ok(bytes)) => {
                let kept = buffer.push(stream, &bytes);
                if kept > 0 {
                    if let Some(tx) = &self.chunks {
                        let _ = tx.try_send(OutputChunk {
                            stream,
                            text: String::from_utf8_lossy(&bytes[..kept]).into_owned(),
                        });
                    }
                }
                true
            }
            Some(Err(e)) => {
                tracing::debug!(stream = ?stream, "Output read error: {}", e);
                false
            }
            None => false,
        }
    }
}

/// Kill the child and everything in its process group, then reap it.
pub(crate) async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a negative pid signals the process group we created.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}

/// Shared byte budget for both pipes
#[derive(Debug)]
struct CaptureBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CaptureBuffer {
    fn new(cap: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Keep as much of `bytes` as the budget allows; returns bytes kept.
    fn push(&mut self, stream: OutputStream, bytes: &[u8]) -> usize {
        let used = self.stdout.len() + self.stderr.len();
        let room = self.cap.saturating_sub(used);
        let keep = room.min(bytes.len());
        if keep < bytes.len() {
            self.truncated = true;
        }
        let target = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        target.extend_from_slice(&bytes[..keep]);
        keep
    }

    /// Decode both buffers, keeping the combined length within the cap.
    fn finish(&self) -> (String, String) {
        let mut stdout = String::from_utf8_lossy(&self.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&self.stderr).into_owned();
        // Lossy decoding of a split code point can grow the text slightly.
        if stdout.len() + stderr.len() > self.cap {
            truncate_at_char_boundary(&mut stderr, self.cap.saturating_sub(stdout.len().min(self.cap)));
            truncate_at_char_boundary(&mut stdout, self.cap.saturating_sub(stderr.len()));
        }
        (stdout, stderr)
    }
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut idx = max;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    text.truncate(idx);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn limits(timeout_ms: u64, cap: usize) -> CaptureLimits {
        CaptureLimits {
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: cap,
        }
    }

    fn is_process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let capture = OutputCapture::new(limits(5_000, 1_000));
        let outcome = capture
            .run(sh("echo out; echo err 1>&2; exit 3"))
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let capture = OutputCapture::new(limits(200, 1_000));
        let outcome = capture.run(sh("sleep 30")).await.unwrap();

        assert!(outcome.timed_out);
        assert!(outcome.duration < Duration::from_secs(10));
        let pid = outcome.pid.unwrap();
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let capture = OutputCapture::new(limits(300, 1_000));
        let outcome = capture
            .run(sh("sleep 30 & echo started; wait"))
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.stdout, "started\n");
    }

    #[tokio::test]
    async fn test_output_cap_truncates_but_collects_exit() {
        let capture = OutputCapture::new(limits(10_000, 1_000));
        let outcome = capture
            .run(sh("yes hello | head -n 20000; echo tail 1>&2"))
            .await
            .unwrap();

        assert!(outcome.truncated);
        assert!(outcome.stdout.len() + outcome.stderr.len() <= 1_000);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let capture = OutputCapture::default();
        let err = capture
            .run(Command::new("/definitely/not/a/binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[tokio::test]
    async fn test_chunks_forwarded() {
        let (tx, mut rx) = mpsc::channel(16);
        let capture = OutputCapture::new(limits(5_000, 1_000)).with_chunks(Some(tx));
        capture.run(sh("echo streamed")).await.unwrap();

        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.stream, OutputStream::Stdout);
        assert_eq!(chunk.text, "streamed\n");
    }

    #[test]
    fn test_buffer_shares_budget() {
        let mut buffer = CaptureBuffer::new(8);
        assert_eq!(buffer.push(OutputStream::Stdout, b"12345"), 5);
        assert_eq!(buffer.push(OutputStream::Stderr, b"6789"), 3);
        assert!(buffer.truncated);
        assert_eq!(buffer.push(OutputStream::Stdout, b"more"), 0);

        let (stdout, stderr) = buffer.finish();
        assert_eq!(stdout, "12345");
        assert_eq!(stderr, "678");
    }

    #[test]
    fn test_buffer_split_code_point_stays_within_cap() {
        let mut buffer = CaptureBuffer::new(4);
        buffer.push(OutputStream::Stdout, "aé€".as_bytes());
        let (stdout, stderr) = buffer.finish();
        assert!(stdout.len() + stderr.len() <= 4);
        assert!(stdout.starts_with("aé"));
    }
}
