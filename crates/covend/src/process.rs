//! Child process management.
//!
//! Owns every process the daemon spawns, script or agent. Children run in
//! their own process group so the whole tree can be signalled. Output is
//! line-split into a per-child ring buffer with sequence numbers that never
//! reset, mirrored as JSON lines to `.coven/output/<task-key>.log`, and fed
//! live to the spawner for question detection and event publication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no process for task key: {0}")]
    NotFound(String),
    #[error("agent not running: {0}")]
    AgentNotRunning(String),
    #[error("stdin closed: {0}")]
    StdinClosed(String),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Which stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One captured output line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub text: String,
}

/// Slice of a ring buffer returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct OutputSlice {
    pub lines: Vec<OutputLine>,
    /// Set when the requested cursor predates the eviction horizon; the
    /// oldest sequence still available.
    pub truncated_from_seq: Option<u64>,
}

struct BufferInner {
    lines: VecDeque<OutputLine>,
    next_seq: u64,
}

/// Bounded, sequence-numbered line store. Sequences are per task key and
/// never reset, so readers can detect gaps after eviction.
pub struct OutputBuffer {
    inner: Mutex<BufferInner>,
    capacity: usize,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                lines: VecDeque::new(),
                next_seq: 1,
            }),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, stream: OutputStream, text: String) -> OutputLine {
        let mut inner = self.inner.lock().expect("buffer poisoned");
        let line = OutputLine {
            seq: inner.next_seq,
            timestamp: Utc::now(),
            stream,
            text,
        };
        inner.next_seq += 1;
        inner.lines.push_back(line.clone());
        while inner.lines.len() > self.capacity {
            inner.lines.pop_front();
        }
        line
    }

    fn slice(&self, since_seq: u64) -> OutputSlice {
        let inner = self.inner.lock().expect("buffer poisoned");
        let oldest = inner.lines.front().map(|l| l.seq);
        let truncated_from_seq = match oldest {
            Some(oldest) if since_seq + 1 < oldest => Some(oldest),
            _ => None,
        };
        let lines = inner
            .lines
            .iter()
            .filter(|l| l.seq > since_seq)
            .cloned()
            .collect();
        OutputSlice {
            lines,
            truncated_from_seq,
        }
    }
}

struct ChildEntry {
    pid: u32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    buffer: Arc<OutputBuffer>,
    exit_rx: watch::Receiver<Option<i32>>,
    running: AtomicBool,
}

/// Everything the spawner needs to drive a child.
pub struct SpawnedChild {
    pub pid: u32,
    /// Live line feed, in production order across both streams.
    pub lines: mpsc::UnboundedReceiver<OutputLine>,
    /// Resolves to the exit code (None while running).
    pub exit: watch::Receiver<Option<i32>>,
}

/// Spawn parameters.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Composite step task id, `workflow_id:step_name`.
    pub task_key: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Keep stdin open for answer injection.
    pub stdin_open: bool,
}

/// Registry of live children and their retained ring buffers.
pub struct ProcessManager {
    children: Mutex<HashMap<String, Arc<ChildEntry>>>,
    output_dir: PathBuf,
    ring_capacity: usize,
    kill_grace: Duration,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager").finish_non_exhaustive()
    }
}

impl ProcessManager {
    pub fn new(output_dir: PathBuf, ring_capacity: usize, kill_grace: Duration) -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            output_dir,
            ring_capacity,
            kill_grace,
        }
    }

    /// Launch a child in its own process group and start capturing output.
    ///
    /// Returns as soon as the child is running; completion is observed
    /// through the returned exit channel.
    pub async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild> {
        std::fs::create_dir_all(&self.output_dir)?;

        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| ProcessError::NotFound("empty argv".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin_open {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        debug!(task_key = %spec.task_key, pid, "spawned child");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let buffer = Arc::new(OutputBuffer::new(self.ring_capacity));
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let log_file = self.output_dir.join(format!("{}.log", spec.task_key));
        let log = Arc::new(Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)?,
        ));

        if let Some(stdout) = stdout {
            spawn_reader(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&buffer),
                line_tx.clone(),
                Arc::clone(&log),
            );
        }
        if let Some(stderr) = stderr {
            spawn_reader(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&buffer),
                line_tx,
                Arc::clone(&log),
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let entry = Arc::new(ChildEntry {
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            buffer,
            exit_rx: exit_rx.clone(),
            running: AtomicBool::new(true),
        });

        // Exit waiter: record the code and flip the running flag.
        let waiter_entry = Arc::clone(&entry);
        let task_key = spec.task_key.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(task_key = %task_key, error = %e, "wait failed");
                    -1
                }
            };
            waiter_entry.running.store(false, Ordering::SeqCst);
            let _ = exit_tx.send(Some(code));
        });

        self.children
            .lock()
            .expect("children poisoned")
            .insert(spec.task_key, Arc::clone(&entry));

        Ok(SpawnedChild {
            pid,
            lines: line_rx,
            exit: exit_rx,
        })
    }

    /// Append `text` plus a newline to the child's stdin.
    pub async fn write_stdin(&self, task_key: &str, text: &str) -> Result<()> {
        let entry = self.entry(task_key)?;
        if !entry.running.load(Ordering::SeqCst) {
            return Err(ProcessError::AgentNotRunning(task_key.to_string()));
        }
        let mut stdin = entry.stdin.lock().await;
        let Some(handle) = stdin.as_mut() else {
            return Err(ProcessError::StdinClosed(task_key.to_string()));
        };
        handle.write_all(text.as_bytes()).await?;
        handle.write_all(b"\n").await?;
        handle.flush().await?;
        Ok(())
    }

    /// Lines with `seq > since_seq`, plus a truncation marker when the
    /// cursor predates the ring's horizon.
    pub fn get_output(&self, task_key: &str, since_seq: u64) -> Result<OutputSlice> {
        let entry = self.entry(task_key)?;
        Ok(entry.buffer.slice(since_seq))
    }

    pub fn is_running(&self, task_key: &str) -> bool {
        self.children
            .lock()
            .expect("children poisoned")
            .get(task_key)
            .is_some_and(|e| e.running.load(Ordering::SeqCst))
    }

    pub fn pid(&self, task_key: &str) -> Option<u32> {
        self.children
            .lock()
            .expect("children poisoned")
            .get(task_key)
            .map(|e| e.pid)
    }

    /// Terminate the child's process group: SIGTERM, wait up to the grace
    /// period, then SIGKILL. The ring buffer stays readable until `release`.
    pub async fn kill(&self, task_key: &str, grace: Option<Duration>) -> Result<()> {
        let entry = self.entry(task_key)?;
        if !entry.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let grace = grace.unwrap_or(self.kill_grace);

        signal_group(entry.pid, libc::SIGTERM);
        let mut exit_rx = entry.exit_rx.clone();
        let exited = tokio::time::timeout(grace, async {
            while exit_rx.borrow().is_none() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!(task_key = %task_key, pid = entry.pid, "grace expired, sending SIGKILL");
            signal_group(entry.pid, libc::SIGKILL);
            let mut exit_rx = entry.exit_rx.clone();
            while exit_rx.borrow().is_none() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Kill every live child; used during shutdown.
    pub async fn kill_all(&self, grace: Option<Duration>) {
        let keys: Vec<String> = self
            .children
            .lock()
            .expect("children poisoned")
            .keys()
            .cloned()
            .collect();
        for key in keys {
            if let Err(e) = self.kill(&key, grace).await {
                warn!(task_key = %key, error = %e, "kill failed during shutdown");
            }
        }
    }

    /// Drop the ring buffer and registry entry for an exited child.
    pub fn release(&self, task_key: &str) {
        self.children
            .lock()
            .expect("children poisoned")
            .remove(task_key);
    }

    fn entry(&self, task_key: &str) -> Result<Arc<ChildEntry>> {
        self.children
            .lock()
            .expect("children poisoned")
            .get(task_key)
            .cloned()
            .ok_or_else(|| ProcessError::NotFound(task_key.to_string()))
    }
}

/// Send a signal to the child's process group.
fn signal_group(pid: u32, signal: i32) {
    // SAFETY: kill(2) with a negative pid signals the process group; it has
    // no memory-safety requirements and failure is reported by return code.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    buffer: Arc<OutputBuffer>,
    line_tx: mpsc::UnboundedSender<OutputLine>,
    log: Arc<Mutex<std::fs::File>>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            let line = buffer.push(stream, text);
            if let Ok(json) = serde_json::to_string(&line) {
                if let Ok(mut file) = log.lock() {
                    let _ = writeln!(file, "{json}");
                }
            }
            // Receiver gone means the spawner stopped caring; keep buffering.
            let _ = line_tx.send(line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ProcessManager {
        ProcessManager::new(
            dir.path().join("output"),
            100,
            Duration::from_millis(500),
        )
    }

    fn sh(task_key: &str, script: &str, cwd: &TempDir, stdin_open: bool) -> SpawnSpec {
        SpawnSpec {
            task_key: task_key.to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: cwd.path().to_path_buf(),
            env: Vec::new(),
            stdin_open,
        }
    }

    async fn wait_exit(mut exit: watch::Receiver<Option<i32>>) -> i32 {
        loop {
            if let Some(code) = *exit.borrow() {
                return code;
            }
            exit.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn captures_output_with_sequence_numbers() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);
        let child = pm
            .spawn(sh("wf:echo", "echo one; echo two; echo three", &dir, false))
            .await
            .unwrap();
        assert_eq!(wait_exit(child.exit).await, 0);

        // Readers may lag the exit by a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let slice = pm.get_output("wf:echo", 0).unwrap();
        assert_eq!(slice.lines.len(), 3);
        assert_eq!(slice.lines[0].text, "one");
        let seqs: Vec<u64> = slice.lines.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(slice.truncated_from_seq.is_none());
    }

    #[tokio::test]
    async fn since_cursor_returns_delta() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);
        let child = pm
            .spawn(sh("wf:delta", "echo a; echo b; echo c", &dir, false))
            .await
            .unwrap();
        assert_eq!(wait_exit(child.exit).await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let slice = pm.get_output("wf:delta", 2).unwrap();
        assert_eq!(slice.lines.len(), 1);
        assert_eq!(slice.lines[0].text, "c");
    }

    #[tokio::test]
    async fn eviction_reports_truncation() {
        let dir = TempDir::new().unwrap();
        let pm = ProcessManager::new(dir.path().join("output"), 2, Duration::from_millis(500));
        let child = pm
            .spawn(sh("wf:trunc", "echo a; echo b; echo c; echo d", &dir, false))
            .await
            .unwrap();
        assert_eq!(wait_exit(child.exit).await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let slice = pm.get_output("wf:trunc", 0).unwrap();
        // Capacity 2: only the last two lines survive, seqs keep counting.
        assert_eq!(slice.lines.len(), 2);
        assert_eq!(slice.lines[0].seq, 3);
        assert_eq!(slice.truncated_from_seq, Some(3));
    }

    #[tokio::test]
    async fn stdin_injection_reaches_child() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);
        let child = pm
            .spawn(sh("wf:ask", "read answer; echo got:$answer", &dir, true))
            .await
            .unwrap();

        pm.write_stdin("wf:ask", "yes").await.unwrap();
        assert_eq!(wait_exit(child.exit).await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let slice = pm.get_output("wf:ask", 0).unwrap();
        assert!(slice.lines.iter().any(|l| l.text == "got:yes"));
    }

    #[tokio::test]
    async fn stdin_errors_are_typed() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);

        // No stdin pipe.
        let child = pm.spawn(sh("wf:nostdin", "sleep 5", &dir, false)).await.unwrap();
        let err = pm.write_stdin("wf:nostdin", "hello").await.unwrap_err();
        assert!(matches!(err, ProcessError::StdinClosed(_)));
        pm.kill("wf:nostdin", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        wait_exit(child.exit).await;

        // Exited child.
        let child = pm.spawn(sh("wf:gone", "true", &dir, true)).await.unwrap();
        wait_exit(child.exit).await;
        let err = pm.write_stdin("wf:gone", "hello").await.unwrap_err();
        assert!(matches!(err, ProcessError::AgentNotRunning(_)));
    }

    #[tokio::test]
    async fn kill_terminates_process_group() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);
        let child = pm
            .spawn(sh("wf:kill", "sleep 60", &dir, false))
            .await
            .unwrap();

        pm.kill("wf:kill", Some(Duration::from_millis(200)))
            .await
            .unwrap();
        let code = wait_exit(child.exit).await;
        assert_ne!(code, 0);
        assert!(!pm.is_running("wf:kill"));
    }

    #[tokio::test]
    async fn buffer_survives_exit_until_release() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);
        let child = pm.spawn(sh("wf:late", "echo tail", &dir, false)).await.unwrap();
        wait_exit(child.exit).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let slice = pm.get_output("wf:late", 0).unwrap();
        assert_eq!(slice.lines.len(), 1);

        pm.release("wf:late");
        assert!(matches!(
            pm.get_output("wf:late", 0),
            Err(ProcessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn output_log_file_is_written() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);
        let child = pm.spawn(sh("wf:log", "echo logged", &dir, false)).await.unwrap();
        wait_exit(child.exit).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let content =
            std::fs::read_to_string(dir.path().join("output").join("wf:log.log")).unwrap();
        assert!(content.contains("\"text\":\"logged\""));
    }

    #[tokio::test]
    async fn live_lines_arrive_in_order() {
        let dir = TempDir::new().unwrap();
        let pm = manager(&dir);
        let mut child = pm
            .spawn(sh("wf:live", "echo first; echo second", &dir, false))
            .await
            .unwrap();

        let first = child.lines.recv().await.unwrap();
        let second = child.lines.recv().await.unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(second.text, "second");
        assert!(first.seq < second.seq);
    }
}
