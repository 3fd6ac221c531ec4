use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    process::Child,
    time::Duration,
};

use crossbeam::channel::{self, RecvTimeoutError};

use crate::{Pid, event::TraceEvent};

use super::stream::TraceStream;

/// How often to check on strace while waiting for it to open its output.
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub strace: PathBuf,
    pub shell: PathBuf,
    pub string_limit: u32,
    /// Copy strace's raw output to this path.
    pub output_strace: Option<PathBuf>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            strace: "strace".into(),
            shell: "/bin/sh".into(),
            string_limit: 4096,
            output_strace: None,
        }
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum LaunchError {
    #[error("failed to create FIFO with path {}", path.display())]
    #[diagnostic(code(tracewrap::launch::fifo))]
    CreateFifo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create strace output copy at path {}", path.display())]
    #[diagnostic(code(tracewrap::launch::output_strace))]
    CreateCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start tracer {}", program.display())]
    #[diagnostic(
        code(tracewrap::launch::spawn),
        help("make sure strace is installed, or point --strace at it")
    )]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open tracer output")]
    #[diagnostic(code(tracewrap::launch::output))]
    OpenOutput {
        #[source]
        source: std::io::Error,
    },

    #[error("tracer exited ({status}) before tracing started")]
    #[diagnostic(
        code(tracewrap::launch::no_trace),
        help("strace needs permission to ptrace its child; check kernel.yama.ptrace_scope or the container's seccomp profile")
    )]
    NoTrace { status: std::process::ExitStatus },
}

/// A running tracer: the root pid of the traced command, the stream of
/// events, and the strace process itself.
pub struct TraceSession {
    pub root_pid: Pid,
    pub stream: TraceStream<BufReader<File>>,
    pub tracer: TracerProcess,
}

/// Owns the strace child process and is responsible for reaping it.
pub struct TracerProcess {
    child: Child,
}

impl TracerProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Ask strace to stop. It detaches from its tracees before exiting.
    pub fn terminate(&self) {
        let Ok(pid) = Pid::try_from(self.child.id()) else {
            return;
        };
        let result = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
        if let Err(error) = result {
            tracing::debug!(%error, pid, "failed to signal tracer");
        }
    }

    pub fn kill(&mut self) {
        if let Err(error) = self.child.kill() {
            tracing::debug!(%error, "failed to kill tracer");
        }
    }

    pub fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait()
    }
}

/// Launch `command_line` through the shell under strace, following forks,
/// and wait for the first event to learn the root pid.
pub fn start(command_line: &str, config: &TracerConfig) -> Result<TraceSession, LaunchError> {
    let output_copy = config
        .output_strace
        .as_ref()
        .map(|path| {
            File::create(path).map_err(|source| LaunchError::CreateCopy {
                path: path.clone(),
                source,
            })
        })
        .transpose()?;

    let fifo = TempPipe::create()?;

    let mut command = std::process::Command::new(&config.strace);
    command
        .arg("-f")
        .arg(format!("--string-limit={}", config.string_limit))
        .arg("--absolute-timestamps=unix,us")
        .arg("--syscall-times")
        .arg("--decode-fds=all")
        .arg("--always-show-pid")
        .arg("--output")
        .arg(&fifo.path)
        .arg("--")
        .arg(&config.shell)
        .arg("-c")
        .arg(command_line);

    tracing::debug!(?command, "starting tracer");
    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: config.strace.clone(),
        source,
    })?;

    let output = match open_output(&fifo.path, &mut child) {
        Ok(output) => output,
        Err(error) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(error);
        }
    };

    // Both ends are open, the path is no longer needed
    drop(fifo);

    let mut stream = TraceStream::new(BufReader::new(output), "<strace>");
    if let Some(output_copy) = output_copy {
        stream = stream.with_tee(std::io::BufWriter::new(output_copy));
    }

    let Some(root_pid) = stream.peek().map(TraceEvent::pid) else {
        let status = child
            .wait()
            .map_err(|source| LaunchError::OpenOutput { source })?;
        return Err(LaunchError::NoTrace { status });
    };
    tracing::debug!(root_pid, tracer_pid = child.id(), "tracing started");

    Ok(TraceSession {
        root_pid,
        stream,
        tracer: TracerProcess { child },
    })
}

/// Open the read side of the FIFO. Opening blocks until strace opens the
/// write side, so it happens on a helper thread while we watch for strace
/// exiting early.
fn open_output(path: &Path, child: &mut Child) -> Result<File, LaunchError> {
    let (opened_tx, opened_rx) = channel::bounded(1);
    let opener_path = path.to_owned();
    std::thread::Builder::new()
        .name("strace-output".into())
        .spawn(move || {
            let _ = opened_tx.send(File::open(&opener_path));
        })
        .map_err(|source| LaunchError::OpenOutput { source })?;

    let mut released = false;
    loop {
        match opened_rx.recv_timeout(LAUNCH_POLL_INTERVAL) {
            Ok(output) => return output.map_err(|source| LaunchError::OpenOutput { source }),
            Err(RecvTimeoutError::Timeout) => {
                let exited = child
                    .try_wait()
                    .map_err(|source| LaunchError::OpenOutput { source })?
                    .is_some();
                if exited && !released {
                    // strace never opened its output, so stand in as the
                    // writer to release the blocked reader
                    released = true;
                    let _ = std::fs::OpenOptions::new().write(true).open(path);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(LaunchError::OpenOutput {
                    source: std::io::Error::other("output opener thread exited"),
                });
            }
        }
    }
}

struct TempPipe {
    path: PathBuf,
}

impl TempPipe {
    fn create() -> Result<Self, LaunchError> {
        let id = uuid::Uuid::new_v4();
        let path = std::env::temp_dir().join(format!("tracewrap-{id}.pipe"));

        interprocess::os::unix::fifo_file::create_fifo(&path, 0o600)
            .map_err(|source| LaunchError::CreateFifo {
                path: path.clone(),
                source,
            })?;

        Ok(TempPipe { path })
    }
}

impl Drop for TempPipe {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
