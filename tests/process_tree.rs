use tracewrap::{
    Pid,
    event::{ExitStatus, LifecycleEvent, LifecycleKind},
    tree::{ProcessTree, Role, TreeListener},
};

fn ts(milliseconds: i64) -> jiff::Timestamp {
    jiff::Timestamp::constant(1700000000, 0) + jiff::SignedDuration::from_millis(milliseconds)
}

fn event(pid: Pid, milliseconds: i64, kind: LifecycleKind) -> LifecycleEvent {
    LifecycleEvent {
        pid,
        timestamp: ts(milliseconds),
        kind,
    }
}

fn started(pid: Pid, parent: Option<Pid>, milliseconds: i64) -> LifecycleEvent {
    event(
        pid,
        milliseconds,
        LifecycleKind::Started {
            parent,
            thread: false,
        },
    )
}

fn thread_started(tid: Pid, owner: Pid, milliseconds: i64) -> LifecycleEvent {
    event(
        tid,
        milliseconds,
        LifecycleKind::Started {
            parent: Some(owner),
            thread: true,
        },
    )
}

fn exited(pid: Pid, milliseconds: i64, code: i32) -> LifecycleEvent {
    event(pid, milliseconds, LifecycleKind::Exited { code })
}

#[derive(Default)]
struct RecordingListener {
    calls: Vec<(&'static str, Pid)>,
}

impl TreeListener for RecordingListener {
    fn on_process_started(&mut self, pid: Pid) {
        self.calls.push(("started", pid));
    }

    fn on_process_exited(&mut self, pid: Pid) {
        self.calls.push(("exited", pid));
    }
}

#[test]
fn test_pipeline_roles() {
    let tree = ProcessTree::replay(&[
        started(100, None, 0),
        event(100, 1, LifecycleKind::PipeOpened),
        started(101, Some(100), 2),
        started(102, Some(100), 3),
        event(100, 4, LifecycleKind::Waited),
        started(103, Some(100), 10),
    ]);

    assert_eq!(tree.root(), Some(100));
    assert_eq!(tree.get(100).unwrap().role, Role::Root);
    assert_eq!(tree.get(100).unwrap().parent, None);
    assert_eq!(tree.get(101).unwrap().role, Role::PipelineStage);
    assert_eq!(tree.get(102).unwrap().role, Role::PipelineStage);
    assert_eq!(tree.get(101).unwrap().parent, Some(100));

    // Forked after the shell waited on the pipeline
    assert_eq!(tree.get(103).unwrap().role, Role::Subshell);
}

#[test]
fn test_pipeline_window() {
    let tree = ProcessTree::replay(&[
        started(100, None, 0),
        event(100, 0, LifecycleKind::PipeOpened),
        started(101, Some(100), 500),
        started(102, Some(100), 501),
    ]);

    assert_eq!(tree.get(101).unwrap().role, Role::PipelineStage);
    assert_eq!(tree.get(102).unwrap().role, Role::Subshell);
}

#[test]
fn test_child_without_pipe_is_subshell() {
    let tree = ProcessTree::replay(&[
        started(100, None, 0),
        started(101, Some(100), 1),
        event(101, 2, LifecycleKind::PipeOpened),
        started(102, Some(101), 3),
    ]);

    assert_eq!(tree.get(101).unwrap().role, Role::Subshell);
    assert_eq!(tree.get(102).unwrap().role, Role::PipelineStage);
    assert_eq!(tree.get(102).unwrap().parent, Some(101));
}

#[test]
fn test_unknown_processes() {
    let tree = ProcessTree::replay(&[
        started(100, None, 0),
        started(300, None, 1),
        started(301, Some(999), 2),
    ]);

    assert_eq!(tree.root(), Some(100));
    assert_eq!(tree.get(300).unwrap().role, Role::Unknown);
    assert_eq!(tree.get(301).unwrap().role, Role::Unknown);
    assert_eq!(tree.get(301).unwrap().parent, Some(999));
}

#[test]
fn test_out_of_order_adoption() {
    let tree = ProcessTree::replay(&[
        started(100, None, 0),
        event(100, 1, LifecycleKind::PipeOpened),
        // The child runs before the parent's clone returns
        event(
            101,
            3,
            LifecycleKind::Exec {
                program: Some("/usr/bin/ls".into()),
                argv: vec!["ls".into()],
            },
        ),
        exited(101, 4, 0),
        started(101, Some(100), 2),
    ]);

    let child = tree.get(101).unwrap();
    assert_eq!(child.parent, Some(100));
    assert_eq!(child.role, Role::PipelineStage);
    assert_eq!(child.started_at, ts(2));
    assert_eq!(child.program.as_deref(), Some("/usr/bin/ls"));
    assert_eq!(child.exit, Some(ExitStatus::Exited { code: 0 }));
    assert_eq!(child.ended_at, Some(ts(4)));
}

#[test]
fn test_threads_belong_to_owner() {
    let mut listener = RecordingListener::default();
    let mut tree = ProcessTree::new();
    for event in [
        started(200, None, 0),
        thread_started(201, 200, 1),
        event(
            201,
            2,
            LifecycleKind::Exec {
                program: Some("/usr/bin/next".into()),
                argv: vec!["next".into()],
            },
        ),
    ] {
        tree.observe(&event, &mut listener);
    }
    tree.observe(&exited(201, 3, 0), &mut listener);

    assert_eq!(tree.owner_of(201), 200);
    assert_eq!(tree.owner_of(200), 200);
    assert!(tree.get(201).is_none());
    assert_eq!(tree.processes().count(), 1);
    assert_eq!(tree.get(200).unwrap().program.as_deref(), Some("/usr/bin/next"));

    // A thread exiting leaves its process running
    assert!(!tree.root_exited());
    assert_eq!(listener.calls, [("started", 200)]);
}

#[test]
fn test_thread_seen_before_clone() {
    let mut listener = RecordingListener::default();
    let mut tree = ProcessTree::new();
    for event in [
        started(200, None, 0),
        event(201, 1, LifecycleKind::PipeOpened),
        thread_started(201, 200, 2),
    ] {
        tree.observe(&event, &mut listener);
    }

    assert!(tree.get(201).is_none());
    assert_eq!(tree.live_pids(), [200]);
    assert_eq!(
        listener.calls,
        [("started", 200), ("started", 201), ("exited", 201)]
    );
}

#[test]
fn test_resolution() {
    let mut listener = RecordingListener::default();
    let mut tree = ProcessTree::new();
    assert!(!tree.root_exited());
    assert!(!tree.is_fully_resolved());

    for event in [
        started(100, None, 0),
        started(101, Some(100), 1),
        exited(100, 2, 0),
    ] {
        tree.observe(&event, &mut listener);
    }
    assert!(tree.root_exited());
    assert!(!tree.is_fully_resolved());
    assert_eq!(tree.live_pids(), [101]);

    tree.observe(
        &event(
            101,
            3,
            LifecycleKind::Killed {
                signal: "SIGKILL".into(),
            },
        ),
        &mut listener,
    );
    assert!(tree.is_fully_resolved());
    assert!(tree.live_pids().is_empty());

    let child = tree.get(101).unwrap();
    assert_eq!(
        child.exit,
        Some(ExitStatus::Killed {
            signal: "SIGKILL".into()
        })
    );
    assert_eq!(child.exit.as_ref().unwrap().shell_code(), 137);

    // Duplicate exits are ignored
    tree.observe(&exited(101, 4, 0), &mut listener);
    assert_eq!(tree.get(101).unwrap().ended_at, Some(ts(3)));

    assert_eq!(
        listener.calls,
        [
            ("started", 100),
            ("started", 101),
            ("exited", 100),
            ("exited", 101)
        ]
    );
}

#[test]
fn test_start_precedes_exit_notification() {
    let mut listener = RecordingListener::default();
    let mut tree = ProcessTree::new();

    // An exit for a pid that was never started still notifies its start first
    tree.observe(&started(100, None, 0), &mut listener);
    tree.observe(&exited(105, 1, 1), &mut listener);

    assert_eq!(
        listener.calls,
        [("started", 100), ("started", 105), ("exited", 105)]
    );
    assert_eq!(tree.get(105).unwrap().role, Role::Unknown);
    assert_eq!(tree.get(105).unwrap().parent, None);
}
