//! Tracks which processes belong to an invocation and how they relate.
//!
//! The tree only sees what the tracer reports, so a child's own events can
//! arrive before its parent's `clone` returns. Such pids are kept as
//! provisional nodes until the matching `Started` event adopts them.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::{
    Pid,
    event::{ExitStatus, LifecycleEvent, LifecycleKind},
};

/// How close a fork has to follow its parent's `pipe` to count as a
/// pipeline stage.
pub const PIPELINE_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Root,
    PipelineStage,
    Subshell,
    Unknown,
}

/// Receives process birth and death as the tree discovers them.
pub trait TreeListener {
    fn on_process_started(&mut self, _pid: Pid) {}
    fn on_process_exited(&mut self, _pid: Pid) {}
}

impl TreeListener for () {}

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub parent: Option<Pid>,
    pub role: Role,
    pub started_at: jiff::Timestamp,
    pub ended_at: Option<jiff::Timestamp>,
    pub exit: Option<ExitStatus>,
    pub program: Option<String>,
    pub argv: Vec<String>,
    adopted: bool,
    pipe_opened_at: Option<jiff::Timestamp>,
}

impl TrackedProcess {
    fn new(started_at: jiff::Timestamp) -> Self {
        Self {
            parent: None,
            role: Role::Unknown,
            started_at,
            ended_at: None,
            exit: None,
            program: None,
            argv: vec![],
            adopted: false,
            pipe_opened_at: None,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ProcessTree {
    root: Option<Pid>,
    processes: BTreeMap<Pid, TrackedProcess>,
    threads: HashMap<Pid, Pid>,
}

impl ProcessTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from an already-captured lifecycle sequence.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a LifecycleEvent>) -> Self {
        let mut tree = Self::new();
        for event in events {
            tree.observe(event, &mut ());
        }
        tree
    }

    pub fn observe(&mut self, event: &LifecycleEvent, listener: &mut impl TreeListener) {
        let timestamp = event.timestamp;
        match &event.kind {
            LifecycleKind::Started { parent, thread } => {
                let parent = parent.map(|parent| self.owner_of(parent));
                if *thread {
                    if let Some(parent) = parent {
                        self.on_thread_started(event.pid, parent, listener);
                    }
                } else {
                    self.on_process_started(event.pid, parent, timestamp, listener);
                }
            }
            LifecycleKind::Exec { program, argv } => {
                let pid = self.owner_of(event.pid);
                let process = self.sighted(pid, timestamp, listener);
                process.program.clone_from(program);
                process.argv.clone_from(argv);
            }
            LifecycleKind::PipeOpened => {
                let pid = self.owner_of(event.pid);
                self.sighted(pid, timestamp, listener).pipe_opened_at = Some(timestamp);
            }
            LifecycleKind::Waited => {
                let pid = self.owner_of(event.pid);
                self.sighted(pid, timestamp, listener).pipe_opened_at = None;
            }
            LifecycleKind::Exited { code } => {
                let exit = ExitStatus::Exited { code: *code };
                self.on_process_exited(event.pid, exit, timestamp, listener);
            }
            LifecycleKind::Killed { signal } => {
                let exit = ExitStatus::Killed {
                    signal: signal.clone(),
                };
                self.on_process_exited(event.pid, exit, timestamp, listener);
            }
        }
    }

    pub fn on_process_started(
        &mut self,
        pid: Pid,
        parent: Option<Pid>,
        timestamp: jiff::Timestamp,
        listener: &mut impl TreeListener,
    ) {
        // A reused thread id now names a process of its own
        self.threads.remove(&pid);

        let role = match parent {
            None if self.root.is_none() || self.root == Some(pid) => {
                self.root = Some(pid);
                Role::Root
            }
            None => Role::Unknown,
            Some(parent) => self.classify_child(parent, timestamp),
        };

        let process = self.sighted(pid, timestamp, listener);
        if process.adopted {
            return;
        }

        process.adopted = true;
        process.parent = parent;
        process.role = role;
        if timestamp < process.started_at {
            process.started_at = timestamp;
        }
        tracing::trace!(pid, ?parent, ?role, "process started");
    }

    pub fn on_process_exited(
        &mut self,
        pid: Pid,
        exit: ExitStatus,
        timestamp: jiff::Timestamp,
        listener: &mut impl TreeListener,
    ) {
        // Thread mappings outlive the thread so its syscalls stay attributed
        if self.threads.contains_key(&pid) {
            return;
        }

        let process = self.sighted(pid, timestamp, listener);
        if process.has_exited() {
            return;
        }

        tracing::trace!(pid, ?exit, "process exited");
        process.ended_at = Some(timestamp);
        process.exit = Some(exit);
        listener.on_process_exited(pid);
    }

    fn on_thread_started(&mut self, tid: Pid, owner: Pid, listener: &mut impl TreeListener) {
        // The thread may already have shown up on its own before the clone
        // returned in its owner
        if let Some(process) = self.processes.get(&tid)
            && !process.adopted
        {
            self.processes.remove(&tid);
            listener.on_process_exited(tid);
        }

        self.threads.insert(tid, owner);
    }

    fn classify_child(&self, parent: Pid, timestamp: jiff::Timestamp) -> Role {
        let Some(parent) = self.processes.get(&parent) else {
            return Role::Unknown;
        };

        let in_pipeline = parent.pipe_opened_at.is_some_and(|opened_at| {
            let elapsed = timestamp.duration_since(opened_at);
            !elapsed.is_negative() && elapsed.unsigned_abs() <= PIPELINE_WINDOW
        });
        if in_pipeline {
            Role::PipelineStage
        } else {
            Role::Subshell
        }
    }

    /// Find a process, creating a provisional node on first sighting.
    fn sighted(
        &mut self,
        pid: Pid,
        timestamp: jiff::Timestamp,
        listener: &mut impl TreeListener,
    ) -> &mut TrackedProcess {
        self.processes.entry(pid).or_insert_with(|| {
            listener.on_process_started(pid);
            TrackedProcess::new(timestamp)
        })
    }

    /// The process a pid belongs to: itself, or the owner if it is a thread.
    pub fn owner_of(&self, pid: Pid) -> Pid {
        self.threads.get(&pid).copied().unwrap_or(pid)
    }

    pub fn root(&self) -> Option<Pid> {
        self.root
    }

    pub fn get(&self, pid: Pid) -> Option<&TrackedProcess> {
        self.processes.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = (Pid, &TrackedProcess)> {
        self.processes.iter().map(|(pid, process)| (*pid, process))
    }

    pub fn root_exited(&self) -> bool {
        self.root
            .and_then(|root| self.processes.get(&root))
            .is_some_and(TrackedProcess::has_exited)
    }

    /// True once the root and every process ever seen have exited.
    pub fn is_fully_resolved(&self) -> bool {
        self.root_exited() && self.processes.values().all(TrackedProcess::has_exited)
    }

    /// Processes that have been seen but have not exited.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.processes
            .iter()
            .filter(|(_, process)| !process.has_exited())
            .map(|(pid, _)| *pid)
            .collect()
    }
}
