//! OS thread spawning helper, named and labeled the way the node's runtime
//! names its worker and protocol threads.

use std::thread;

pub use thread::*;

/// Spawns an OS thread, naming it after the peer's remote address and the
/// activity it runs, so a thread dump reads like `1.2.3.4:8444 <dispatcher>`.
pub fn spawn<D, F, T>(remote: &str, label: D, f: F) -> thread::JoinHandle<T>
where
    D: std::fmt::Display,
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name(remote, label))
        .spawn(f)
        .expect("thread::spawn: thread label must not contain NULL bytes")
}

pub fn name<D: std::fmt::Display>(remote: &str, label: D) -> String {
    if cfg!(debug_assertions) {
        format!("{remote} <{label}>")
    } else {
        format!("{label}")
    }
}
