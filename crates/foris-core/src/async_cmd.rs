//! Async command runtime.
//!
//! Runs external processes whose completion may take seconds to minutes
//! and whose progress must stream to subscribers. Each spawned child gets
//! a fresh [`TaskId`]; every stdout line is tested against the caller's
//! [`ProgressPattern`] list in order and the first match emits a progress
//! event through the runtime's notification sink. When the child exits, a
//! terminal event (`succeeded` iff exit code 0, `failed` otherwise) is
//! emitted strictly after every progress event of that task.
//!
//! Task records outlive the child by a short grace period so late
//! subscribers can still correlate the task id, then disappear.
//!
//! There is no cancellation API; [`AsyncCommandRuntime::shutdown`]
//! terminates all live children and awaits their exit.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::exec;

/// How long a finished task's record stays queryable.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Terminal status for a zero exit code.
pub const STATUS_SUCCEEDED: &str = "succeeded";
/// Terminal status for any other exit.
pub const STATUS_FAILED: &str = "failed";

/// Opaque task identifier: monotonic counter plus random suffix, unique
/// within the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    fn generate(seq: u64) -> Self {
        Self(format!("{seq:08}-{:08x}", rand::random::<u32>()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed id for tests that need a known value.
    #[doc(hidden)]
    #[must_use]
    pub fn for_tests(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stdout pattern with the progress event it triggers.
#[derive(Debug, Clone)]
pub struct ProgressPattern {
    pub regex: Regex,
    pub event_name: String,
}

impl ProgressPattern {
    pub fn new(pattern: &str, event_name: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            event_name: event_name.to_string(),
        })
    }
}

/// Module and action a task's events notify under.
#[derive(Debug, Clone)]
pub struct TaskOrigin {
    pub module: String,
    pub action: String,
}

impl TaskOrigin {
    #[must_use]
    pub fn new(module: &str, action: &str) -> Self {
        Self {
            module: module.to_string(),
            action: action.to_string(),
        }
    }
}

/// Event pushed into the notification sink.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub origin: TaskOrigin,
    /// Pattern event name, or [`STATUS_SUCCEEDED`] / [`STATUS_FAILED`].
    pub status: String,
    /// Exit code; set on terminal events only.
    pub exit_code: Option<i32>,
}

/// The notification transport dropped and must be re-established.
#[derive(Debug, Clone, Copy)]
pub struct NotifySinkLost;

/// Sink the runtime pushes events into; the daemon wires this to the
/// notification hub and the active transport.
pub type NotifySink = Arc<dyn Fn(TaskEvent) -> Result<(), NotifySinkLost> + Send + Sync>;

/// Callback re-establishing the notification transport after a sink
/// failure. Emission after a reset preserves task-id continuity.
pub type ResetNotify = Arc<dyn Fn() + Send + Sync>;

/// One-shot hook run when the child exits, before the terminal event.
pub type ExitHook = Box<dyn FnOnce(&TaskId, i32) + Send + Sync>;

/// Spawn failures.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("cannot spawn a task from an empty argv")]
    EmptyArgv,
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

struct TaskEntry {
    pid: u32,
    argv: Vec<String>,
    exit_code: Option<i32>,
    kill: Arc<Notify>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    counter: AtomicU64,
    sink: NotifySink,
    reset_notify: Option<ResetNotify>,
    grace: Duration,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
}

impl Inner {
    fn emit(&self, event: TaskEvent) {
        if (self.sink)(event.clone()).is_ok() {
            return;
        }
        // Transport dropped: ask the owner to re-establish it, then retry
        // once with the same task id.
        if let Some(reset) = &self.reset_notify {
            reset();
            if (self.sink)(event.clone()).is_ok() {
                return;
            }
        }
        warn!(task_id = %event.task_id, status = %event.status, "task event lost: sink unavailable");
    }
}

/// Owner of all async task records for the process lifetime.
#[derive(Clone)]
pub struct AsyncCommandRuntime {
    inner: Arc<Inner>,
}

impl AsyncCommandRuntime {
    #[must_use]
    pub fn new(sink: NotifySink, reset_notify: Option<ResetNotify>) -> Self {
        Self::with_grace(sink, reset_notify, DEFAULT_GRACE)
    }

    /// Runtime with a custom record grace period (tests shorten it).
    #[must_use]
    pub fn with_grace(
        sink: NotifySink,
        reset_notify: Option<ResetNotify>,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                counter: AtomicU64::new(1),
                sink,
                reset_notify,
                grace,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start `argv` as a supervised child and return its task id.
    ///
    /// `on_exit` runs after the child exits and before the terminal event
    /// is emitted.
    pub fn spawn(
        &self,
        origin: TaskOrigin,
        argv: Vec<String>,
        patterns: Vec<ProgressPattern>,
        on_exit: Option<ExitHook>,
    ) -> Result<TaskId, TaskError> {
        let (program, args) = argv.split_first().ok_or(TaskError::EmptyArgv)?;
        let resolved = exec::resolve_program(Path::new(program));

        let mut command = Command::new(&resolved);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| TaskError::Spawn {
            program: resolved.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);

        let seq = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let task_id = TaskId::generate(seq);
        let kill = Arc::new(Notify::new());
        debug!(task_id = %task_id, pid, ?argv, "async task starting");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Register the record before the monitor starts so a child that
        // exits immediately still finds its entry.
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                task_id.clone(),
                TaskEntry {
                    pid,
                    argv,
                    exit_code: None,
                    kill: Arc::clone(&kill),
                    monitor: None,
                },
            );

        let inner = Arc::clone(&self.inner);
        let monitor_id = task_id.clone();
        let monitor_kill = Arc::clone(&kill);
        let monitor = tokio::spawn(async move {
            // stderr is drained concurrently so the child never blocks on
            // a full pipe; its lines are only logged.
            let stderr_drain = stderr.map(|stream| {
                let id = monitor_id.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(task_id = %id, line = %line, "task stderr");
                    }
                })
            });

            if let Some(stream) = stdout {
                let mut lines = BufReader::new(stream).lines();
                loop {
                    tokio::select! {
                        next = lines.next_line() => match next {
                            Ok(Some(line)) => {
                                // First matching pattern wins.
                                if let Some(pattern) =
                                    patterns.iter().find(|p| p.regex.is_match(&line))
                                {
                                    inner.emit(TaskEvent {
                                        task_id: monitor_id.clone(),
                                        origin: origin.clone(),
                                        status: pattern.event_name.clone(),
                                        exit_code: None,
                                    });
                                }
                            }
                            Ok(None) | Err(_) => break,
                        },
                        () = monitor_kill.notified() => {
                            let _ = child.start_kill();
                        }
                    }
                }
            }
            if let Some(handle) = stderr_drain {
                let _ = handle.await;
            }
            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(error) => {
                    warn!(task_id = %monitor_id, %error, "failed to reap task child");
                    -1
                }
            };
            debug!(task_id = %monitor_id, exit_code, "async task exited");

            if let Some(hook) = on_exit {
                hook(&monitor_id, exit_code);
            }
            {
                let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = tasks.get_mut(&monitor_id) {
                    entry.exit_code = Some(exit_code);
                }
            }
            // The terminal event is strictly last for this task.
            inner.emit(TaskEvent {
                task_id: monitor_id.clone(),
                origin: origin.clone(),
                status: if exit_code == 0 {
                    STATUS_SUCCEEDED.to_string()
                } else {
                    STATUS_FAILED.to_string()
                },
                exit_code: Some(exit_code),
            });

            // Keep the record around for late correlation, then drop it.
            let grace = inner.grace;
            let cleanup_inner = Arc::clone(&inner);
            let cleanup_id = monitor_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                cleanup_inner
                    .tasks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&cleanup_id);
            });
        });

        if let Some(entry) = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&task_id)
        {
            entry.monitor = Some(monitor);
        }
        Ok(task_id)
    }

    /// Whether a task record is still known (live or in its grace
    /// period).
    #[must_use]
    pub fn task_exists(&self, task_id: &TaskId) -> bool {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_id)
    }

    /// Exit code of a finished task still inside its grace period.
    #[must_use]
    pub fn exit_code(&self, task_id: &TaskId) -> Option<i32> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .and_then(|entry| entry.exit_code)
    }

    /// Ids and pids of tasks whose child is still running.
    #[must_use]
    pub fn running_tasks(&self) -> Vec<(TaskId, u32)> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, entry)| entry.exit_code.is_none())
            .map(|(id, entry)| (id.clone(), entry.pid))
            .collect()
    }

    /// Argv a task was started with, while its record lives.
    #[must_use]
    pub fn argv(&self, task_id: &TaskId) -> Option<Vec<String>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map(|entry| entry.argv.clone())
    }

    /// Terminate all live children and wait for their monitors to finish.
    pub async fn shutdown(&self) {
        let monitors: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks
                .values_mut()
                .filter_map(|entry| {
                    entry.kill.notify_one();
                    entry.monitor.take()
                })
                .collect()
        };
        for monitor in monitors {
            let _ = monitor.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collector {
        events: Mutex<Vec<TaskEvent>>,
        notify: Notify,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        fn sink(self: &Arc<Self>) -> NotifySink {
            let this = Arc::clone(self);
            Arc::new(move |event| {
                this.events.lock().unwrap().push(event);
                this.notify.notify_waiters();
                Ok(())
            })
        }

        async fn wait_for_terminal(&self) -> Vec<TaskEvent> {
            loop {
                {
                    let events = self.events.lock().unwrap();
                    if events
                        .iter()
                        .any(|e| e.status == STATUS_SUCCEEDED || e.status == STATUS_FAILED)
                    {
                        return events.clone();
                    }
                }
                let notified = self.notify.notified();
                tokio::time::timeout(Duration::from_secs(10), notified)
                    .await
                    .expect("timed out waiting for terminal event");
            }
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn origin() -> TaskOrigin {
        TaskOrigin::new("remote", "generate_ca")
    }

    fn ca_patterns() -> Vec<ProgressPattern> {
        vec![
            ProgressPattern::new(r"^gen_ca: started", "ca_generating").unwrap(),
            ProgressPattern::new(r"^gen_ca: done", "ca_done").unwrap(),
            ProgressPattern::new(r"^gen_server: started", "server_generating").unwrap(),
            ProgressPattern::new(r"^gen_server: done", "server_done").unwrap(),
        ]
    }

    #[tokio::test]
    async fn progress_events_stream_in_stdout_order_and_terminal_is_last() {
        let collector = Collector::new();
        let runtime = AsyncCommandRuntime::new(collector.sink(), None);
        let task_id = runtime
            .spawn(
                origin(),
                sh("echo 'gen_ca: started'; echo 'gen_ca: done'; \
                    echo 'gen_server: started'; echo 'gen_server: done'"),
                ca_patterns(),
                None,
            )
            .unwrap();
        let events = collector.wait_for_terminal().await;
        let statuses: Vec<&str> = events.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(
            statuses,
            vec![
                "ca_generating",
                "ca_done",
                "server_generating",
                "server_done",
                STATUS_SUCCEEDED
            ]
        );
        assert!(events.iter().all(|e| e.task_id == task_id));
        assert_eq!(events.last().unwrap().exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_emits_failed() {
        let collector = Collector::new();
        let runtime = AsyncCommandRuntime::new(collector.sink(), None);
        runtime.spawn(origin(), sh("exit 4"), Vec::new(), None).unwrap();
        let events = collector.wait_for_terminal().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, STATUS_FAILED);
        assert_eq!(events[0].exit_code, Some(4));
    }

    #[tokio::test]
    async fn first_matching_pattern_wins() {
        let collector = Collector::new();
        let runtime = AsyncCommandRuntime::new(collector.sink(), None);
        let patterns = vec![
            ProgressPattern::new("progress", "first").unwrap(),
            ProgressPattern::new("progress", "second").unwrap(),
        ];
        runtime
            .spawn(origin(), sh("echo progress"), patterns, None)
            .unwrap();
        let events = collector.wait_for_terminal().await;
        let statuses: Vec<&str> = events.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(statuses, vec!["first", STATUS_SUCCEEDED]);
    }

    #[tokio::test]
    async fn task_ids_are_unique_and_exit_hook_runs_before_terminal() {
        let collector = Collector::new();
        let runtime = AsyncCommandRuntime::new(collector.sink(), None);
        let hook_seen = Arc::new(Mutex::new(None::<i32>));
        let hook_store = Arc::clone(&hook_seen);
        let first = runtime
            .spawn(
                origin(),
                sh("true"),
                Vec::new(),
                Some(Box::new(move |_, code| {
                    *hook_store.lock().unwrap() = Some(code);
                })),
            )
            .unwrap();
        let second = runtime.spawn(origin(), sh("true"), Vec::new(), None).unwrap();
        assert_ne!(first, second);
        collector.wait_for_terminal().await;
        // The hook ran before its task's terminal event was emitted.
        assert_eq!(*hook_seen.lock().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn record_survives_grace_period_then_disappears() {
        let collector = Collector::new();
        let runtime = AsyncCommandRuntime::with_grace(
            collector.sink(),
            None,
            Duration::from_millis(100),
        );
        let task_id = runtime.spawn(origin(), sh("true"), Vec::new(), None).unwrap();
        collector.wait_for_terminal().await;
        assert!(runtime.task_exists(&task_id));
        assert_eq!(runtime.exit_code(&task_id), Some(0));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!runtime.task_exists(&task_id));
    }

    #[tokio::test]
    async fn shutdown_terminates_live_children() {
        let collector = Collector::new();
        let runtime = AsyncCommandRuntime::new(collector.sink(), None);
        runtime.spawn(origin(), sh("sleep 60"), Vec::new(), None).unwrap();
        let started = std::time::Instant::now();
        runtime.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        let events = collector.events.lock().unwrap();
        assert_eq!(events.last().unwrap().status, STATUS_FAILED);
    }

    #[tokio::test]
    async fn sink_failure_triggers_reset_and_retry() {
        let fail_first = Arc::new(Mutex::new(true));
        let delivered: Arc<Mutex<Vec<TaskEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let resets = Arc::new(Mutex::new(0usize));

        let sink_fail = Arc::clone(&fail_first);
        let sink_delivered = Arc::clone(&delivered);
        let sink: NotifySink = Arc::new(move |event| {
            let mut fail = sink_fail.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(NotifySinkLost);
            }
            sink_delivered.lock().unwrap().push(event);
            Ok(())
        });
        let reset_count = Arc::clone(&resets);
        let reset: ResetNotify = Arc::new(move || {
            *reset_count.lock().unwrap() += 1;
        });

        let runtime = AsyncCommandRuntime::new(sink, Some(reset));
        let task_id = runtime.spawn(origin(), sh("true"), Vec::new(), None).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if !delivered.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*resets.lock().unwrap(), 1);
        // Task id continuity across the reset.
        assert_eq!(delivered.lock().unwrap()[0].task_id, task_id);
    }
}
