use std::collections::VecDeque;

use bstr::ByteSlice as _;

use crate::event::{LifecycleEvent, LifecycleKind, SyscallEvent, TraceEvent};

use super::parser::{parse_string_array, parse_string_literal};

/// Turns parsed strace lines into syscall and lifecycle events.
#[derive(Default)]
pub struct Analyzer {
    seen_root: bool,
    events: VecDeque<TraceEvent>,
}

impl Analyzer {
    pub fn push_line(&mut self, line: super::Line) {
        let timestamp = line.timestamp;
        let pid = line.pid;

        // strace's first line always belongs to the process it launched
        if !self.seen_root {
            self.seen_root = true;
            self.push_lifecycle(
                pid,
                timestamp,
                LifecycleKind::Started {
                    parent: None,
                    thread: false,
                },
            );
        }

        match line.event {
            super::Event::Syscall(syscall) => {
                self.push_derived_lifecycle(pid, timestamp, &syscall);
                self.events.push_back(TraceEvent::Syscall(SyscallEvent {
                    pid,
                    timestamp,
                    name: syscall.name.to_string(),
                    args: syscall.args.iter().map(|arg| arg.to_string()).collect(),
                    result: syscall.result.to_string(),
                    returned: syscall.returned(),
                    errno: syscall.errno().map(String::from),
                    duration: syscall.duration,
                }));
            }
            super::Event::Exited { code } => {
                self.push_lifecycle(pid, timestamp, LifecycleKind::Exited { code });
            }
            super::Event::KilledBy { signal } => {
                let signal = signal.split(' ').next().unwrap_or(signal);
                self.push_lifecycle(
                    pid,
                    timestamp,
                    LifecycleKind::Killed {
                        signal: signal.to_string(),
                    },
                );
            }
            super::Event::Signal { .. } | super::Event::Notice { .. } => {}
        }
    }

    pub fn pop_event(&mut self) -> Option<TraceEvent> {
        self.events.pop_front()
    }

    pub fn peek_event(&self) -> Option<&TraceEvent> {
        self.events.front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn push_derived_lifecycle(
        &mut self,
        pid: crate::Pid,
        timestamp: jiff::Timestamp,
        syscall: &super::RawSyscall,
    ) {
        match syscall.name {
            "fork" | "vfork" | "clone" | "clone3" => {
                let Some(child_pid) = syscall
                    .returned()
                    .filter(|child_pid| *child_pid > 0)
                    .and_then(|child_pid| crate::Pid::try_from(child_pid).ok())
                else {
                    return;
                };
                let thread = syscall.args.iter().any(|arg| arg.contains("CLONE_THREAD"));

                self.push_lifecycle(
                    child_pid,
                    timestamp,
                    LifecycleKind::Started {
                        parent: Some(pid),
                        thread,
                    },
                );
            }
            "execve" | "execveat" if syscall.succeeded() => {
                let (program, argv) = if syscall.name == "execveat" {
                    let dir = syscall.args.first().and_then(|arg| annotated_path(arg));
                    let path = syscall.args.get(1).and_then(|arg| decode_string(arg));
                    let program = match (dir, path) {
                        (Some(dir), Some(path)) if !path.starts_with('/') && !path.is_empty() => {
                            Some(format!("{dir}/{path}"))
                        }
                        (_, Some(path)) if !path.is_empty() => Some(path),
                        (dir, _) => dir,
                    };
                    (program, syscall.args.get(2))
                } else {
                    (
                        syscall.args.first().and_then(|arg| decode_string(arg)),
                        syscall.args.get(1),
                    )
                };
                let argv = argv
                    .and_then(|argv| parse_string_array(argv))
                    .map(|argv| {
                        argv.iter()
                            .map(|arg| arg.to_str_lossy().into_owned())
                            .collect()
                    })
                    .unwrap_or_default();

                self.push_lifecycle(pid, timestamp, LifecycleKind::Exec { program, argv });
            }
            "pipe" | "pipe2" if syscall.succeeded() => {
                self.push_lifecycle(pid, timestamp, LifecycleKind::PipeOpened);
            }
            "wait4" | "waitpid" | "waitid" => {
                self.push_lifecycle(pid, timestamp, LifecycleKind::Waited);
            }
            _ => {}
        }
    }

    fn push_lifecycle(&mut self, pid: crate::Pid, timestamp: jiff::Timestamp, kind: LifecycleKind) {
        self.events.push_back(TraceEvent::Lifecycle(LifecycleEvent {
            pid,
            timestamp,
            kind,
        }));
    }
}

fn decode_string(arg: &str) -> Option<String> {
    let literal = parse_string_literal(arg)?;
    Some(literal.to_str_lossy().into_owned())
}

/// The path strace appends to a decoded fd, as in `3</usr/bin>`.
fn annotated_path(arg: &str) -> Option<String> {
    let (_, path) = arg.split_once('<')?;
    path.strip_suffix('>').map(String::from)
}
