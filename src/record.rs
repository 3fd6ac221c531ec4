//! Merges lifecycle events, syscalls, and resource samples into the final
//! diagnostic record of an invocation.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::{
    Pid,
    event::{ExitStatus, LifecycleEvent, ResourceSample, SyscallEvent},
    tree::{ProcessTree, Role},
};

/// Everything about an invocation that does not come from the event streams.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: String,
    pub started_at: jiff::Timestamp,
    pub finished_at: Option<jiff::Timestamp>,
    pub root_pid: Pid,
    pub completeness: Completeness,
    pub skew: SkewCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Completeness {
    Complete,
    Incomplete {
        reason: IncompleteReason,
        unresolved: Vec<Pid>,
    },
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    /// Descendants were still running when the resolution deadline passed.
    TreeResolutionTimeout,
    /// The wrapper itself was signaled.
    Interrupted,
    /// The tracer stopped reporting before every process exited.
    TraceEnded,
}

/// Inputs that were dropped instead of recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkewCounts {
    pub trace_lines: usize,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticRecord {
    pub command: String,
    pub started_at: jiff::Timestamp,
    pub finished_at: Option<jiff::Timestamp>,
    pub root_pid: Pid,
    pub exit_status: Option<ExitStatus>,
    pub completeness: Completeness,
    pub skew: SkewCounts,
    pub summary: RecordSummary,
    pub processes: Vec<ProcessNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub wall_time: Option<std::time::Duration>,
    pub process_count: usize,
    pub total_syscalls: u64,
    pub failed_syscalls: u64,
    pub peak_aggregate_memory: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessNode {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub role: Role,
    pub program: Option<String>,
    pub argv: Vec<String>,
    pub started_at: jiff::Timestamp,
    pub ended_at: Option<jiff::Timestamp>,
    pub exit_status: Option<ExitStatus>,
    pub summary: ProcessSummary,
    pub syscalls: Vec<SyscallEvent>,
    pub samples: Vec<ResourceSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub syscalls: u64,
    pub failed_syscalls: u64,
    pub syscalls_by_name: BTreeMap<String, u64>,
    pub syscall_time: std::time::Duration,
    pub peak_memory: u64,
    pub cpu_time: std::time::Duration,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub peak_threads: usize,
}

impl ProcessSummary {
    fn compute(syscalls: &[SyscallEvent], samples: &[ResourceSample]) -> Self {
        let mut summary = Self::default();
        for syscall in syscalls {
            summary.syscalls += 1;
            if syscall.failed() {
                summary.failed_syscalls += 1;
            }
            *summary
                .syscalls_by_name
                .entry(syscall.name.clone())
                .or_default() += 1;
            summary.syscall_time += syscall.duration.unwrap_or_default();
        }

        // Counters are cumulative, so the largest reading is the total
        for sample in samples {
            summary.peak_memory = summary.peak_memory.max(sample.resident_memory);
            summary.cpu_time = summary.cpu_time.max(sample.cpu_time);
            summary.read_bytes = summary.read_bytes.max(sample.read_bytes);
            summary.written_bytes = summary.written_bytes.max(sample.written_bytes);
            summary.peak_threads = summary.peak_threads.max(sample.threads);
        }

        summary
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RecordError {
    #[error("process {pid} references parent {parent}, which is not in the record")]
    #[diagnostic(code(tracewrap::record::missing_parent))]
    MissingParent { pid: Pid, parent: Pid },

    #[error("process {pid} is not the root but has no parent")]
    #[diagnostic(code(tracewrap::record::orphan))]
    Orphan { pid: Pid },

    #[error("{kind} of process {pid} are not in timestamp order")]
    #[diagnostic(code(tracewrap::record::unordered))]
    Unordered { pid: Pid, kind: &'static str },

    #[error("an event of process {pid} is filed under process {owner}")]
    #[diagnostic(code(tracewrap::record::misfiled))]
    Misfiled { pid: Pid, owner: Pid },
}

impl DiagnosticRecord {
    pub fn process(&self, pid: Pid) -> Option<&ProcessNode> {
        self.processes.iter().find(|process| process.pid == pid)
    }

    pub fn root(&self) -> Option<&ProcessNode> {
        self.process(self.root_pid)
    }

    /// The status a shell would report for the traced command.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.as_ref().map(ExitStatus::shell_code)
    }

    /// Check the structural guarantees of a record: parents are present,
    /// samples belong to their node, and sequences are ordered.
    pub fn validate(&self) -> Result<(), RecordError> {
        let pids: BTreeSet<Pid> = self.processes.iter().map(|process| process.pid).collect();

        for process in &self.processes {
            match process.parent {
                Some(parent) if !pids.contains(&parent) => {
                    return Err(RecordError::MissingParent {
                        pid: process.pid,
                        parent,
                    });
                }
                None if process.pid != self.root_pid => {
                    return Err(RecordError::Orphan { pid: process.pid });
                }
                _ => {}
            }

            if let Some(sample) = process.samples.iter().find(|s| s.pid != process.pid) {
                return Err(RecordError::Misfiled {
                    pid: sample.pid,
                    owner: process.pid,
                });
            }

            let syscalls_ordered = process
                .syscalls
                .windows(2)
                .all(|pair| pair[0].timestamp <= pair[1].timestamp);
            if !syscalls_ordered {
                return Err(RecordError::Unordered {
                    pid: process.pid,
                    kind: "syscalls",
                });
            }

            let samples_ordered = process
                .samples
                .windows(2)
                .all(|pair| pair[0].timestamp <= pair[1].timestamp);
            if !samples_ordered {
                return Err(RecordError::Unordered {
                    pid: process.pid,
                    kind: "samples",
                });
            }
        }

        Ok(())
    }
}

/// Build the record for an invocation. The result depends only on the
/// inputs, so assembling the same capture twice yields equal records.
pub fn assemble(
    invocation: &Invocation,
    lifecycle: &[LifecycleEvent],
    syscalls: &[SyscallEvent],
    samples: &[ResourceSample],
) -> DiagnosticRecord {
    let tree = ProcessTree::replay(lifecycle);
    let root_pid = tree.root().unwrap_or(invocation.root_pid);

    let mut syscalls_by_pid: BTreeMap<Pid, Vec<SyscallEvent>> = BTreeMap::new();
    for syscall in syscalls {
        syscalls_by_pid
            .entry(tree.owner_of(syscall.pid))
            .or_default()
            .push(syscall.clone());
    }

    // A thread sampled before it was known as one reads its owner's
    // counters, which the owner's own samples already cover
    let mut samples_by_pid: BTreeMap<Pid, Vec<ResourceSample>> = BTreeMap::new();
    for sample in samples.iter().filter(|sample| tree.owner_of(sample.pid) == sample.pid) {
        samples_by_pid
            .entry(sample.pid)
            .or_default()
            .push(sample.clone());
    }

    let pids: BTreeSet<Pid> = tree
        .processes()
        .map(|(pid, _)| pid)
        .chain(syscalls_by_pid.keys().copied())
        .chain(samples_by_pid.keys().copied())
        .chain(std::iter::once(root_pid))
        .collect();

    let mut processes: Vec<ProcessNode> = pids
        .iter()
        .map(|&pid| {
            let mut syscalls = syscalls_by_pid.remove(&pid).unwrap_or_default();
            let mut samples = samples_by_pid.remove(&pid).unwrap_or_default();
            syscalls.sort_by_key(|syscall| syscall.timestamp);
            samples.sort_by_key(|sample| sample.timestamp);

            let first_seen = syscalls
                .first()
                .map(|syscall| syscall.timestamp)
                .into_iter()
                .chain(samples.first().map(|sample| sample.timestamp))
                .min()
                .unwrap_or(invocation.started_at);

            let mut node = match tree.get(pid) {
                Some(tracked) => ProcessNode {
                    pid,
                    parent: tracked.parent,
                    role: tracked.role,
                    program: tracked.program.clone(),
                    argv: tracked.argv.clone(),
                    started_at: tracked.started_at,
                    ended_at: tracked.ended_at,
                    exit_status: tracked.exit.clone(),
                    summary: ProcessSummary::default(),
                    syscalls: vec![],
                    samples: vec![],
                },
                None => {
                    tracing::debug!(pid, "synthesizing process only seen in events");
                    ProcessNode {
                        pid,
                        parent: None,
                        role: Role::Unknown,
                        program: None,
                        argv: vec![],
                        started_at: first_seen,
                        ended_at: None,
                        exit_status: None,
                        summary: ProcessSummary::default(),
                        syscalls: vec![],
                        samples: vec![],
                    }
                }
            };

            if pid == root_pid {
                node.parent = None;
                node.role = Role::Root;
            } else if node.parent.is_none_or(|parent| !pids.contains(&parent)) {
                // The real parent was never observed
                node.parent = Some(root_pid);
            }

            node.summary = ProcessSummary::compute(&syscalls, &samples);
            node.syscalls = syscalls;
            node.samples = samples;
            node
        })
        .collect();
    processes.sort_by_key(|process| (process.started_at, process.pid));

    let summary = RecordSummary {
        wall_time: invocation.finished_at.map(|finished_at| {
            finished_at
                .duration_since(invocation.started_at)
                .unsigned_abs()
        }),
        process_count: processes.len(),
        total_syscalls: processes.iter().map(|p| p.summary.syscalls).sum(),
        failed_syscalls: processes.iter().map(|p| p.summary.failed_syscalls).sum(),
        peak_aggregate_memory: peak_aggregate_memory(&processes),
        read_bytes: processes.iter().map(|p| p.summary.read_bytes).sum(),
        written_bytes: processes.iter().map(|p| p.summary.written_bytes).sum(),
    };

    let exit_status = processes
        .iter()
        .find(|process| process.pid == root_pid)
        .and_then(|root| root.exit_status.clone());

    DiagnosticRecord {
        command: invocation.command.clone(),
        started_at: invocation.started_at,
        finished_at: invocation.finished_at,
        root_pid,
        exit_status,
        completeness: invocation.completeness.clone(),
        skew: invocation.skew,
        summary,
        processes,
    }
}

/// The largest combined resident memory of all live processes at any sample.
fn peak_aggregate_memory(processes: &[ProcessNode]) -> u64 {
    let mut samples: Vec<&ResourceSample> = processes
        .iter()
        .flat_map(|process| &process.samples)
        .collect();
    samples.sort_by_key(|sample| (sample.timestamp, sample.pid));

    let ended_at: BTreeMap<Pid, jiff::Timestamp> = processes
        .iter()
        .filter_map(|process| Some((process.pid, process.ended_at?)))
        .collect();

    let mut current: BTreeMap<Pid, u64> = BTreeMap::new();
    let mut peak = 0;
    for sample in samples {
        current.retain(|pid, _| {
            ended_at
                .get(pid)
                .is_none_or(|ended_at| *ended_at >= sample.timestamp)
        });
        current.insert(sample.pid, sample.resident_memory);
        peak = peak.max(current.values().sum());
    }

    peak
}
