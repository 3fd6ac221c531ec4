use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Route SIGINT, SIGTERM, and SIGHUP into a flag instead of terminating, so
/// the traced processes can be cleaned up and a partial record assembled.
/// Handlers are reset on exec, so the traced command keeps the default
/// dispositions.
pub fn install() -> Result<&'static AtomicBool, ctrlc::Error> {
    ctrlc::set_handler(|| {
        tracing::debug!("received termination signal");
        INTERRUPTED.store(true, Ordering::SeqCst);
    })?;

    Ok(&INTERRUPTED)
}
