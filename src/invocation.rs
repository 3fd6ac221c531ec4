//! Runs one command under the tracer and the resource sampler and turns what
//! they observed into a [`DiagnosticRecord`].

use std::{
    os::unix::process::ExitStatusExt as _,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, RecvTimeoutError};

use crate::{
    event::TraceEvent,
    record::{self, Completeness, DiagnosticRecord, IncompleteReason, Invocation, SkewCounts},
    sampler::{Sampler, SysinfoProbe},
    strace::launch::{self, LaunchError, TraceSession, TracerConfig},
    tree::ProcessTree,
};

/// How long the coordinator waits for an event before re-checking
/// deadlines and the interruption flag.
const TICK: Duration = Duration::from_millis(50);

/// Time strace gets to detach and exit after being asked to stop.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Time the output may stay open after strace was killed before we stop
/// reading it.
const ABANDON_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct InvocationOptions {
    pub tracer: TracerConfig,
    pub sample_interval: Duration,
    /// How long descendants may keep running after the root has exited.
    pub resolve_timeout: Duration,
}

impl Default for InvocationOptions {
    fn default() -> Self {
        Self {
            tracer: TracerConfig::default(),
            sample_interval: Duration::from_millis(100),
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum InvocationError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Launch(#[from] LaunchError),

    #[error("failed to start {name} thread")]
    #[diagnostic(code(tracewrap::invocation::thread))]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct InvocationOutcome {
    pub record: DiagnosticRecord,
    pub tracer_status: Option<std::process::ExitStatus>,
}

impl InvocationOutcome {
    /// The exit code the wrapper should report: the traced command's own
    /// status, or strace's if the command's exit was never observed.
    pub fn exit_code(&self) -> i32 {
        self.record
            .exit_code()
            .or_else(|| {
                let status = self.tracer_status?;
                status
                    .code()
                    .or_else(|| status.signal().map(|signal| 128 + signal))
            })
            .unwrap_or(1)
    }
}

/// Which way the coordinator is winding the invocation down.
#[derive(Default)]
struct Shutdown {
    reason: Option<IncompleteReason>,
    requested_at: Option<Instant>,
    killed: bool,
}

pub fn run(
    command_line: &str,
    options: &InvocationOptions,
    interrupted: &AtomicBool,
) -> Result<InvocationOutcome, InvocationError> {
    let started_at = jiff::Timestamp::now();
    tracing::debug!(command_line, "running command");

    let TraceSession {
        root_pid,
        stream,
        mut tracer,
    } = launch::start(command_line, &options.tracer)?;
    let trace_skew = stream.skew_counter();

    let mut sampler = match Sampler::spawn(SysinfoProbe::new(), options.sample_interval) {
        Ok(sampler) => sampler,
        Err(source) => {
            tracer.kill();
            let _ = tracer.wait();
            return Err(InvocationError::Thread {
                name: "resource sampler",
                source,
            });
        }
    };

    let (events_tx, events_rx) = channel::unbounded();
    let reader = std::thread::Builder::new()
        .name("strace-reader".into())
        .spawn(move || {
            for event in stream {
                if events_tx.send(event).is_err() {
                    break;
                }
            }
        });
    let reader = match reader {
        Ok(reader) => reader,
        Err(source) => {
            tracer.kill();
            let _ = tracer.wait();
            sampler.finish();
            return Err(InvocationError::Thread {
                name: "strace reader",
                source,
            });
        }
    };

    let mut tree = ProcessTree::new();
    let mut lifecycle = vec![];
    let mut syscalls = vec![];
    let mut shutdown = Shutdown::default();
    let mut resolve_deadline = None;
    let mut abandoned = false;

    loop {
        match events_rx.recv_timeout(TICK) {
            Ok(TraceEvent::Lifecycle(event)) => {
                tree.observe(&event, &mut sampler);
                lifecycle.push(event);
            }
            Ok(TraceEvent::Syscall(event)) => syscalls.push(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();

        if shutdown.reason.is_none() && interrupted.load(Ordering::SeqCst) {
            tracing::warn!("interrupted, stopping traced processes");
            let mut live = tree.live_pids();
            if tree.get(root_pid).is_none() {
                live.push(root_pid);
            }
            for pid in live {
                let result = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
                if let Err(error) = result {
                    tracing::debug!(pid, %error, "failed to kill traced process");
                }
                sampler.untrack(pid);
            }
            tracer.terminate();
            shutdown.reason = Some(IncompleteReason::Interrupted);
            shutdown.requested_at = Some(now);
        }

        if resolve_deadline.is_none() && tree.root_exited() {
            resolve_deadline = Some(now + options.resolve_timeout);
        }

        if shutdown.reason.is_none()
            && resolve_deadline.is_some_and(|deadline| now >= deadline)
            && !tree.is_fully_resolved()
        {
            tracing::warn!(
                unresolved = ?tree.live_pids(),
                "descendants still running after the command exited, stopping tracer",
            );
            tracer.terminate();
            shutdown.reason = Some(IncompleteReason::TreeResolutionTimeout);
            shutdown.requested_at = Some(now);
        }

        if let Some(requested_at) = shutdown.requested_at {
            let waited = now.duration_since(requested_at);
            if !shutdown.killed && waited >= TERMINATE_GRACE {
                tracing::debug!("tracer did not stop, killing it");
                tracer.kill();
                shutdown.killed = true;
            }
            if waited >= TERMINATE_GRACE + ABANDON_GRACE {
                tracing::warn!("tracer output is still open, abandoning it");
                abandoned = true;
                break;
            }
        }
    }

    let finished_at = jiff::Timestamp::now();

    if abandoned {
        drop(events_rx);
    } else if reader.join().is_err() {
        tracing::warn!("strace reader panicked");
    }

    let tracer_status = match tracer.wait() {
        Ok(status) => Some(status),
        Err(error) => {
            tracing::warn!(%error, "failed to reap tracer");
            None
        }
    };
    tracing::debug!(tracer_pid = tracer.id(), ?tracer_status, "tracer exited");

    let sampler_report = sampler.finish();

    let completeness = match shutdown.reason {
        Some(reason) => Completeness::Incomplete {
            reason,
            unresolved: tree.live_pids(),
        },
        None if tree.is_fully_resolved() => Completeness::Complete,
        None => Completeness::Incomplete {
            reason: IncompleteReason::TraceEnded,
            unresolved: tree.live_pids(),
        },
    };

    let invocation = Invocation {
        command: command_line.to_string(),
        started_at,
        finished_at: Some(finished_at),
        root_pid,
        completeness,
        skew: SkewCounts {
            trace_lines: trace_skew.load(Ordering::Relaxed),
            samples: sampler_report.skipped,
        },
    };
    let record = record::assemble(&invocation, &lifecycle, &syscalls, &sampler_report.samples);
    if let Err(error) = record.validate() {
        tracing::warn!(%error, "assembled record is inconsistent");
    }

    Ok(InvocationOutcome {
        record,
        tracer_status,
    })
}
