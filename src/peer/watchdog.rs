//! The idle watchdog: a cancellable single-shot timer, run on its own
//! thread, whose fire path disconnects the peer. The dispatcher resets the
//! deadline after every successful read+dispatch cycle; if no reset arrives
//! before the deadline elapses, the peer is idle and gets disconnected.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as chan;

use super::Peer;

enum Command {
    Reset(Duration),
    Shutdown,
}

pub(super) struct Watchdog {
    tx: chan::Sender<Command>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Watchdog {
    /// Spawns the watchdog thread with an initial deadline of `NEGOTIATE_TIMEOUT`.
    pub(super) fn spawn(peer: Arc<Peer>, initial_deadline: Duration) -> Self {
        let (tx, rx) = chan::unbounded();
        let remote = peer.remote_address.clone();

        let handle = crate::thread::spawn(&remote, "peer-watchdog", move || {
            run(peer, rx, initial_deadline)
        });

        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Resets the deadline to `duration` from now.
    pub(super) fn reset(&self, duration: Duration) {
        let _ = self.tx.send(Command::Reset(duration));
    }

    /// Stops the watchdog and waits for its thread to exit. Idempotent in
    /// the sense that dropping a shut-down watchdog does nothing further.
    pub(super) fn shutdown(mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(peer: Arc<Peer>, rx: chan::Receiver<Command>, initial_deadline: Duration) {
    let mut deadline = initial_deadline;

    loop {
        chan::select! {
            recv(rx) -> command => match command {
                Ok(Command::Reset(next)) => deadline = next,
                Ok(Command::Shutdown) | Err(_) => return,
            },
            default(deadline) => {
                log::warn!(target: "peer", "{peer}: idle watchdog fired after {deadline:?}");
                peer.disconnect();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    use crate::address_manager::InMemoryAddressManager;
    use crate::config::Config;
    use crate::object_manager::InMemoryObjectManager;
    use crate::object_store::InMemoryObjectStore;
    use crate::transport::ChannelTransport;
    use crossbeam_channel as chan;

    fn test_peer() -> StdArc<Peer> {
        let (a, _b) = ChannelTransport::pair(
            ([127, 0, 0, 1], 1).into(),
            ([127, 0, 0, 1], 2).into(),
        );
        let (done_tx, _done_rx) = chan::unbounded();
        Peer::inbound(
            StdArc::new(a),
            StdArc::new(InMemoryAddressManager::new()),
            StdArc::new(InMemoryObjectManager::new()),
            StdArc::new(InMemoryObjectStore::new()),
            Config::default(),
            1,
            done_tx,
        )
    }

    #[test]
    fn fires_disconnect_after_deadline() {
        let peer = test_peer();
        let watchdog = Watchdog::spawn(StdArc::clone(&peer), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(80));
        assert!(peer.is_disconnected());
        watchdog.shutdown();
    }

    #[test]
    fn reset_postpones_the_deadline() {
        let peer = test_peer();
        let watchdog = Watchdog::spawn(StdArc::clone(&peer), Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(10));
        watchdog.reset(Duration::from_millis(200));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!peer.is_disconnected());
        watchdog.shutdown();
    }
}
