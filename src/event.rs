use std::str::FromStr as _;

use serde::Serialize;

use crate::Pid;

/// One item of the tracer's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Syscall(SyscallEvent),
    Lifecycle(LifecycleEvent),
}

impl TraceEvent {
    pub fn pid(&self) -> Pid {
        match self {
            TraceEvent::Syscall(event) => event.pid,
            TraceEvent::Lifecycle(event) => event.pid,
        }
    }

    pub fn timestamp(&self) -> jiff::Timestamp {
        match self {
            TraceEvent::Syscall(event) => event.timestamp,
            TraceEvent::Lifecycle(event) => event.timestamp,
        }
    }
}

/// A single traced syscall. Arguments are kept as the tracer printed them,
/// split at top-level commas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallEvent {
    pub pid: Pid,
    pub timestamp: jiff::Timestamp,
    pub name: String,
    pub args: Vec<String>,
    pub result: String,
    pub returned: Option<i64>,
    pub errno: Option<String>,
    pub duration: Option<std::time::Duration>,
}

impl SyscallEvent {
    pub fn failed(&self) -> bool {
        self.errno.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// The process (or thread) the event is about. For `Started`, this is
    /// the new child, not the process that forked it.
    pub pid: Pid,
    pub timestamp: jiff::Timestamp,
    pub kind: LifecycleKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleKind {
    Started { parent: Option<Pid>, thread: bool },
    Exec { program: Option<String>, argv: Vec<String> },
    PipeOpened,
    Waited,
    Exited { code: i32 },
    Killed { signal: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExitStatus {
    Exited { code: i32 },
    Killed { signal: String },
}

impl ExitStatus {
    /// The status a shell would report for this process.
    pub fn shell_code(&self) -> i32 {
        match self {
            ExitStatus::Exited { code } => *code,
            ExitStatus::Killed { signal } => nix::sys::signal::Signal::from_str(signal)
                .map_or(128, |signal| 128 + signal as i32),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }
}

/// A point-in-time reading of a process's resource counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSample {
    pub pid: Pid,
    pub timestamp: jiff::Timestamp,
    pub cpu_time: std::time::Duration,
    pub resident_memory: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    /// Threads in the process, the main thread included.
    pub threads: usize,
}

impl ResourceSample {
    pub fn io_bytes(&self) -> u64 {
        self.read_bytes.saturating_add(self.written_bytes)
    }
}
