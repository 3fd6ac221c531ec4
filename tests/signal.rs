use std::{sync::atomic::Ordering, time::Duration};

#[test]
fn test_termination_signal_sets_flag() {
    let interrupted = tracewrap::signal::install().unwrap();
    assert!(!interrupted.load(Ordering::SeqCst));

    // Without the handler this would end the test process
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

    // The handler runs on its own thread
    let mut waited = Duration::ZERO;
    while !interrupted.load(Ordering::SeqCst) && waited < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert!(interrupted.load(Ordering::SeqCst));

    // Only one handler can be installed per process
    assert!(tracewrap::signal::install().is_err());
}
