//! End-to-end runs under a real strace. Each test is skipped when strace is
//! missing or isn't allowed to trace (e.g. in a locked-down container).

use std::{sync::atomic::AtomicBool, time::Duration};

use tracewrap::{
    invocation::{self, InvocationError, InvocationOptions, InvocationOutcome},
    record::{Completeness, IncompleteReason},
    tree::Role,
};

fn run_with(
    command_line: &str,
    options: &InvocationOptions,
    interrupted: bool,
) -> Option<InvocationOutcome> {
    let interrupted = AtomicBool::new(interrupted);
    match invocation::run(command_line, options, &interrupted) {
        Ok(outcome) => Some(outcome),
        Err(InvocationError::Launch(error)) => {
            eprintln!("skipping, tracer unavailable: {:?}", miette::Report::new(error));
            None
        }
        Err(error) => panic!("{:?}", miette::Report::new(error)),
    }
}

fn run(command_line: &str) -> Option<InvocationOutcome> {
    run_with(command_line, &InvocationOptions::default(), false)
}

#[test]
fn test_invocation_echo() {
    let Some(outcome) = run("echo hello") else {
        return;
    };
    let record = &outcome.record;
    record.validate().unwrap();

    assert_eq!(record.command, "echo hello");
    assert!(record.completeness.is_complete());
    assert_eq!(outcome.exit_code(), 0);

    // The shell runs the builtin itself
    assert_eq!(record.processes.len(), 1);
    let root = record.root().unwrap();
    assert_eq!(root.role, Role::Root);
    assert_eq!(root.parent, None);
    assert_eq!(root.argv.last().map(String::as_str), Some("echo hello"));
    assert!(root.ended_at.is_some());
    assert!(root.syscalls.iter().any(|syscall| syscall.name == "write"));
    assert!(record.summary.total_syscalls > 0);
    assert!(record.summary.wall_time.is_some());
}

#[test]
fn test_invocation_exit_status() {
    let Some(outcome) = run("false") else {
        return;
    };
    outcome.record.validate().unwrap();
    assert_eq!(outcome.exit_code(), 1);

    let Some(outcome) = run("exit 3") else {
        return;
    };
    assert_eq!(outcome.record.exit_code(), Some(3));
    assert_eq!(outcome.exit_code(), 3);
}

#[test]
fn test_invocation_pipeline() {
    let Some(outcome) = run("ls / | wc -l") else {
        return;
    };
    let record = &outcome.record;
    record.validate().unwrap();

    assert!(record.completeness.is_complete());
    assert_eq!(outcome.exit_code(), 0);
    assert!(record.processes.len() >= 3);

    let stages: Vec<_> = record
        .processes
        .iter()
        .filter(|process| process.role == Role::PipelineStage)
        .collect();
    assert!(stages.len() >= 2, "{stages:#?}");
    for stage in stages {
        assert!(stage.parent.is_some());
        assert!(stage.exit_status.is_some());
    }
}

#[test]
fn test_invocation_output_strace() {
    let path = std::env::temp_dir().join(format!(
        "tracewrap-test-{}.strace",
        std::process::id()
    ));
    let mut options = InvocationOptions::default();
    options.tracer.output_strace = Some(path.clone());

    let Some(outcome) = run_with("echo copied", &options, false) else {
        let _ = std::fs::remove_file(&path);
        return;
    };
    let copy = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(copy.contains("execve("));
    assert!(copy.contains("+++ exited with 0 +++"));
    assert_eq!(outcome.record.skew.trace_lines, 0);
}

#[test]
fn test_invocation_interrupted() {
    let Some(outcome) = run_with("sleep 10", &InvocationOptions::default(), true) else {
        return;
    };

    let Completeness::Incomplete { reason, .. } = &outcome.record.completeness else {
        panic!("expected incomplete record, got {:?}", outcome.record.completeness);
    };
    assert_eq!(*reason, IncompleteReason::Interrupted);
    assert!(outcome.record.root().is_some());
    let wall_time = outcome.record.summary.wall_time.unwrap();
    assert!(wall_time < Duration::from_secs(10), "{wall_time:?}");
}

#[test]
fn test_invocation_resolution_timeout() {
    let options = InvocationOptions {
        resolve_timeout: Duration::from_millis(200),
        ..InvocationOptions::default()
    };
    let Some(outcome) = run_with("sleep 2 & echo started", &options, false) else {
        return;
    };
    let record = &outcome.record;
    record.validate().unwrap();

    let Completeness::Incomplete { reason, unresolved } = &record.completeness else {
        panic!("expected incomplete record, got {:?}", record.completeness);
    };
    assert_eq!(*reason, IncompleteReason::TreeResolutionTimeout);
    assert!(!unresolved.is_empty());

    // The command itself finished normally
    assert_eq!(outcome.exit_code(), 0);
}
