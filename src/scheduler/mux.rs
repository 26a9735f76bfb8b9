//! Log multiplexer: one shared sink for every concurrently running pod.
//!
//! All pod submissions of a distributed run share a single log callback.
//! Per container the multiplexer buffers lines until the container's
//! terminal event, then flushes them contiguously to the diagnostic stream
//! tagged `[POD <idx>]` and records a test-attributed [`TestLog`] with the
//! container's elapsed time.
//!
//! The container-to-command mapping is written during pod construction,
//! strictly before submission; the callback only reads it. All other state
//! lives behind one mutex whose critical section does nothing but map
//! updates and formatted writes to the pre-opened sink.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use crate::cluster::{LogEvent, LogSink};
use crate::report::{TestLog, TestResult};

use super::DiagnosticSink;

#[derive(Clone)]
struct RegisteredCommand {
    test: String,
    display_command: String,
}

#[derive(Default)]
struct MuxState {
    /// Buffered lines per still-running container.
    buffers: HashMap<String, Vec<String>>,
    /// Stable pod index, assigned in first-seen order.
    pod_index: HashMap<String, usize>,
    next_pod_index: usize,
    /// Wall clock at which each container was observed running.
    started: HashMap<String, chrono::DateTime<Utc>>,
    /// Accumulated per-test records, keyed by test name.
    test_logs: HashMap<String, TestLog>,
}

/// Shared, thread-safe sink attributing container logs to tests.
pub struct LogMultiplexer {
    commands: RwLock<HashMap<String, RegisteredCommand>>,
    state: Mutex<MuxState>,
    sink: DiagnosticSink,
    echo_command: bool,
}

impl LogMultiplexer {
    pub fn new(sink: DiagnosticSink, echo_command: bool) -> Arc<Self> {
        Arc::new(Self {
            commands: RwLock::new(HashMap::new()),
            state: Mutex::new(MuxState::default()),
            sink,
            echo_command,
        })
    }

    /// Associate a container name with the test it executes. Must be called
    /// before the container's pod is submitted.
    pub fn register(&self, container: &str, test: &str, display_command: &str) {
        self.commands.write().unwrap().insert(
            container.to_string(),
            RegisteredCommand {
                test: test.to_string(),
                display_command: display_command.to_string(),
            },
        );
    }

    /// The callback handed to every pod submission of the run.
    pub fn log_sink(self: &Arc<Self>) -> LogSink {
        let mux = Arc::clone(self);
        Arc::new(move |event| mux.observe(event))
    }

    fn observe(&self, event: &LogEvent) {
        if event.finished {
            self.finish_container(event);
        } else {
            self.buffer_chunk(event);
        }
    }

    fn buffer_chunk(&self, event: &LogEvent) {
        let registered = self
            .commands
            .read()
            .unwrap()
            .contains_key(&event.container);

        let mut state = self.state.lock().unwrap();
        if !state.buffers.contains_key(&event.container) && registered {
            // First chunk from this container: pin its start time from the
            // pod status, falling back to first-seen-log wall clock.
            let started = event
                .status
                .running_started_at(&event.container)
                .unwrap_or_else(Utc::now);
            state.started.insert(event.container.clone(), started);
        }
        state
            .buffers
            .entry(event.container.clone())
            .or_default()
            .push(event.chunk.clone());
    }

    fn finish_container(&self, event: &LogEvent) {
        let command = self
            .commands
            .read()
            .unwrap()
            .get(&event.container)
            .cloned();

        let mut state = self.state.lock().unwrap();
        let Some(lines) = state.buffers.remove(&event.container) else {
            return;
        };

        let idx = match state.pod_index.get(&event.pod) {
            Some(idx) => *idx,
            None => {
                let idx = state.next_pod_index;
                state.pod_index.insert(event.pod.clone(), idx);
                state.next_pod_index += 1;
                idx
            }
        };

        if let Some(command) = &command {
            let started = state
                .started
                .remove(&event.container)
                .unwrap_or_else(Utc::now);
            let elapsed_sec = (Utc::now() - started).num_seconds().max(0);

            if self.echo_command {
                let mut sink = self.sink.lock().unwrap();
                let _ = writeln!(
                    sink,
                    "[POD {}] TEST={} {}",
                    idx, command.test, command.display_command
                );
            }

            state.test_logs.insert(
                command.test.clone(),
                TestLog {
                    name: command.test.clone(),
                    result: TestResult::Success,
                    elapsed_sec,
                    message: lines.join("\n"),
                },
            );
        }

        let mut sink = self.sink.lock().unwrap();
        for line in &lines {
            let _ = writeln!(sink, "[POD {}] {}", idx, line);
        }
    }

    /// Overwrite a test's provisional success with failure. A test whose
    /// container produced no terminal event still gets a failure entry so
    /// every failed test appears in the final record.
    pub fn mark_failed(&self, test: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .test_logs
            .entry(test.to_string())
            .or_insert_with(|| TestLog {
                name: test.to_string(),
                result: TestResult::Failure,
                elapsed_sec: 0,
                message: String::new(),
            })
            .result = TestResult::Failure;
    }

    /// Flip the given tests back to success after a passing retest.
    pub fn mark_succeeded(&self, tests: &[String]) {
        let mut state = self.state.lock().unwrap();
        for test in tests {
            if let Some(log) = state.test_logs.get_mut(test) {
                log.result = TestResult::Success;
            }
        }
    }

    /// All accumulated records, sorted by test name for a stable result log.
    pub fn test_logs(&self) -> Vec<TestLog> {
        let state = self.state.lock().unwrap();
        let mut logs: Vec<TestLog> = state.test_logs.values().cloned().collect();
        logs.sort_by(|a, b| a.name.cmp(&b.name));
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PodStatusSnapshot;
    use chrono::Duration;

    fn sink() -> (DiagnosticSink, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedBuffer(Arc::clone(&buffer));
        (Arc::new(Mutex::new(Box::new(writer))), buffer)
    }

    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn chunk(pod: &str, container: &str, line: &str) -> LogEvent {
        LogEvent {
            pod: pod.into(),
            container: container.into(),
            chunk: line.into(),
            finished: false,
            status: PodStatusSnapshot::new(),
        }
    }

    fn finished(pod: &str, container: &str) -> LogEvent {
        LogEvent {
            pod: pod.into(),
            container: container.into(),
            chunk: String::new(),
            finished: true,
            status: PodStatusSnapshot::new(),
        }
    }

    #[test]
    fn attributes_buffered_lines_to_test() {
        let (sink, output) = sink();
        let mux = LogMultiplexer::new(sink, true);
        mux.register("pod-0", "pkg/alpha", "go test $TEST");

        let callback = mux.log_sink();
        callback(&chunk("pod", "pod-0", "line one"));
        callback(&chunk("pod", "pod-0", "line two"));
        callback(&finished("pod", "pod-0"));

        let logs = mux.test_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "pkg/alpha");
        assert_eq!(logs[0].result, TestResult::Success);
        assert_eq!(logs[0].message, "line one\nline two");

        let printed = String::from_utf8(output.lock().unwrap().clone()).unwrap();
        assert!(printed.contains("[POD 0] TEST=pkg/alpha go test $TEST"));
        assert!(printed.contains("[POD 0] line one"));
        assert!(printed.contains("[POD 0] line two"));
    }

    #[test]
    fn pod_indices_are_first_seen_and_stable() {
        let (sink, output) = sink();
        let mux = LogMultiplexer::new(sink, true);
        mux.register("a-0", "t1", "cmd");
        mux.register("b-0", "t2", "cmd");
        mux.register("a-1", "t3", "cmd");

        let callback = mux.log_sink();
        callback(&chunk("pod-a", "a-0", "x"));
        callback(&chunk("pod-b", "b-0", "y"));
        callback(&chunk("pod-a", "a-1", "z"));
        callback(&finished("pod-a", "a-0"));
        callback(&finished("pod-b", "b-0"));
        callback(&finished("pod-a", "a-1"));

        let printed = String::from_utf8(output.lock().unwrap().clone()).unwrap();
        assert!(printed.contains("[POD 0] x"));
        assert!(printed.contains("[POD 1] y"));
        // Second container of pod-a reuses pod-a's index.
        assert!(printed.contains("[POD 0] z"));
    }

    #[test]
    fn unregistered_container_prints_but_records_nothing() {
        let (sink, output) = sink();
        let mux = LogMultiplexer::new(sink, true);

        let callback = mux.log_sink();
        callback(&chunk("pod", "clone-init", "Cloning..."));
        callback(&finished("pod", "clone-init"));

        assert!(mux.test_logs().is_empty());
        let printed = String::from_utf8(output.lock().unwrap().clone()).unwrap();
        assert!(printed.contains("[POD 0] Cloning..."));
    }

    #[test]
    fn elapsed_time_uses_running_state_timestamp() {
        let (sink, _) = sink();
        let mux = LogMultiplexer::new(sink, true);
        mux.register("pod-0", "slow", "cmd");

        let mut status = PodStatusSnapshot::new();
        status.record_running("pod-0", Utc::now() - Duration::seconds(90));

        let callback = mux.log_sink();
        callback(&LogEvent {
            pod: "pod".into(),
            container: "pod-0".into(),
            chunk: "working".into(),
            finished: false,
            status,
        });
        callback(&finished("pod", "pod-0"));

        let logs = mux.test_logs();
        assert!(logs[0].elapsed_sec >= 90, "elapsed {}", logs[0].elapsed_sec);
    }

    #[test]
    fn mark_failed_overwrites_and_backfills() {
        let (sink, _) = sink();
        let mux = LogMultiplexer::new(sink, true);
        mux.register("pod-0", "ran", "cmd");

        let callback = mux.log_sink();
        callback(&chunk("pod", "pod-0", "boom"));
        callback(&finished("pod", "pod-0"));

        mux.mark_failed("ran");
        mux.mark_failed("never-ran");

        let logs = mux.test_logs();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.result == TestResult::Failure));
        let ran = logs.iter().find(|l| l.name == "ran").unwrap();
        assert_eq!(ran.message, "boom");
    }

    #[test]
    fn mark_succeeded_flips_failures() {
        let (sink, _) = sink();
        let mux = LogMultiplexer::new(sink, true);
        mux.mark_failed("flaky");
        mux.mark_succeeded(&["flaky".to_string()]);
        assert_eq!(mux.test_logs()[0].result, TestResult::Success);
    }
}
