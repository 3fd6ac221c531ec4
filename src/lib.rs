pub mod event;
pub mod invocation;
pub mod record;
pub mod sampler;
pub mod signal;
pub mod strace;
pub mod tree;

pub type Pid = libc::pid_t;
