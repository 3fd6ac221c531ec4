use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, RecvTimeoutError};

use crate::{Pid, event::ResourceSample, tree::TreeListener};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounters {
    pub cpu_time: Duration,
    pub resident_memory: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub threads: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("process {0} no longer exists")]
    NoSuchProcess(Pid),

    #[error("resource counters for process {pid} are unavailable: {reason}")]
    Unavailable { pid: Pid, reason: String },
}

/// A per-process source of resource counters.
pub trait ResourceProbe: Send + 'static {
    fn probe(&mut self, pid: Pid) -> Result<ResourceCounters, ProbeError>;
}

pub struct SysinfoProbe {
    system: sysinfo::System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn probe(&mut self, pid: Pid) -> Result<ResourceCounters, ProbeError> {
        let Ok(raw_pid) = u32::try_from(pid) else {
            return Err(ProbeError::NoSuchProcess(pid));
        };
        let system_pid = sysinfo::Pid::from_u32(raw_pid);

        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[system_pid]),
            true,
            sysinfo::ProcessRefreshKind::nothing()
                .with_memory()
                .with_disk_usage(),
        );

        let Some(process) = self.system.process(system_pid) else {
            return Err(ProbeError::NoSuchProcess(pid));
        };

        // An unreaped process has already released its resources
        if matches!(
            process.status(),
            sysinfo::ProcessStatus::Zombie | sysinfo::ProcessStatus::Dead
        ) {
            return Err(ProbeError::NoSuchProcess(pid));
        }

        let cpu_time = cpu_time(pid)?;
        let disk_usage = process.disk_usage();

        // The task list leaves out the main thread
        let threads = process.tasks().map_or(1, |tasks| tasks.len() + 1);

        Ok(ResourceCounters {
            cpu_time,
            resident_memory: process.memory(),
            read_bytes: disk_usage.total_read_bytes,
            written_bytes: disk_usage.total_written_bytes,
            threads,
        })
    }
}

/// User plus system time from `/proc/<pid>/stat`.
fn cpu_time(pid: Pid) -> Result<Duration, ProbeError> {
    let stat = procfs::process::Process::new(pid)
        .and_then(|process| process.stat())
        .map_err(|error| match error {
            procfs::ProcError::NotFound(_) => ProbeError::NoSuchProcess(pid),
            error => ProbeError::Unavailable {
                pid,
                reason: error.to_string(),
            },
        })?;

    let ticks = stat.utime.saturating_add(stat.stime);
    let ticks_per_second = procfs::ticks_per_second().max(1);
    Ok(Duration::from_secs(ticks / ticks_per_second)
        + Duration::from_nanos((ticks % ticks_per_second) * 1_000_000_000 / ticks_per_second))
}

#[derive(Debug, Default)]
pub struct SamplerReport {
    pub samples: Vec<ResourceSample>,
    /// Samples dropped because the counters could not be read.
    pub skipped: usize,
}

enum Command {
    Track(Pid),
    Untrack(Pid),
}

/// Polls resource counters for every tracked process from one background
/// thread. Commands are delivered in order, so a `track` always takes effect
/// before a later `untrack` of the same pid.
pub struct Sampler {
    commands: channel::Sender<Command>,
    thread: std::thread::JoinHandle<SamplerReport>,
}

impl Sampler {
    pub fn spawn(probe: impl ResourceProbe, interval: Duration) -> std::io::Result<Self> {
        let interval = interval.max(Duration::from_millis(1));
        let (commands, receiver) = channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("resource-sampler".into())
            .spawn(move || sample_loop(probe, &receiver, interval))?;

        Ok(Self { commands, thread })
    }

    pub fn track(&self, pid: Pid) {
        // The thread only goes away once `finish` drops the sender
        let _ = self.commands.send(Command::Track(pid));
    }

    pub fn untrack(&self, pid: Pid) {
        let _ = self.commands.send(Command::Untrack(pid));
    }

    /// Stop sampling everything and collect what was gathered.
    pub fn finish(self) -> SamplerReport {
        drop(self.commands);
        match self.thread.join() {
            Ok(report) => report,
            Err(_) => {
                tracing::warn!("resource sampler panicked, no samples collected");
                SamplerReport::default()
            }
        }
    }
}

impl TreeListener for Sampler {
    fn on_process_started(&mut self, pid: Pid) {
        self.track(pid);
    }

    fn on_process_exited(&mut self, pid: Pid) {
        self.untrack(pid);
    }
}

fn sample_loop(
    mut probe: impl ResourceProbe,
    commands: &channel::Receiver<Command>,
    interval: Duration,
) -> SamplerReport {
    let mut tracked = BTreeSet::new();
    let mut report = SamplerReport::default();
    let mut next_tick = Instant::now() + interval;

    loop {
        // Checked before every command so a busy queue can't hold off the tick
        let now = Instant::now();
        if now >= next_tick {
            let timestamp = jiff::Timestamp::now();
            tracked.retain(|pid| sample(&mut probe, *pid, timestamp, &mut report));

            next_tick += interval;
            if next_tick < now {
                next_tick = now + interval;
            }
            continue;
        }

        match commands.recv_deadline(next_tick) {
            Ok(Command::Track(pid)) => {
                if tracked.insert(pid) && !sample(&mut probe, pid, jiff::Timestamp::now(), &mut report)
                {
                    tracked.remove(&pid);
                }
            }
            Ok(Command::Untrack(pid)) => {
                tracked.remove(&pid);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    report
}

/// Take one sample. Returns false once the process is gone.
fn sample(
    probe: &mut impl ResourceProbe,
    pid: Pid,
    timestamp: jiff::Timestamp,
    report: &mut SamplerReport,
) -> bool {
    match probe.probe(pid) {
        Ok(counters) => {
            report.samples.push(ResourceSample {
                pid,
                timestamp,
                cpu_time: counters.cpu_time,
                resident_memory: counters.resident_memory,
                read_bytes: counters.read_bytes,
                written_bytes: counters.written_bytes,
                threads: counters.threads,
            });
            true
        }
        Err(ProbeError::NoSuchProcess(_)) => {
            tracing::debug!(pid, "process is gone, no longer sampling");
            false
        }
        Err(error) => {
            tracing::debug!(pid, %error, "dropping resource sample");
            report.skipped += 1;
            true
        }
    }
}
