//! A minimal stand-in for the enclosing server: just enough to host the
//! peer engine in tests and the integration harness. A production server
//! would add a peer registry, accept loop, and dial scheduler on top of
//! this; those are out of scope here (see the module overview).

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as chan;

use crate::peer::Peer;

/// The surface the peer engine needs from its enclosing server.
pub struct Server {
    nonce: u64,
    done_tx: chan::Sender<Arc<Peer>>,
    done_rx: chan::Receiver<Arc<Peer>>,
    connection_retry_interval: Duration,
}

impl Server {
    pub fn new(nonce: u64, connection_retry_interval: Duration) -> Self {
        let (done_tx, done_rx) = chan::unbounded();
        Self {
            nonce,
            done_tx,
            done_rx,
            connection_retry_interval,
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn connection_retry_interval(&self) -> Duration {
        self.connection_retry_interval
    }

    /// A sender a peer's dispatcher can use to report that it's done.
    pub fn done_peers(&self) -> chan::Sender<Arc<Peer>> {
        self.done_tx.clone()
    }

    /// The receiving side, polled by whatever owns the peer registry.
    pub fn done_peers_rx(&self) -> &chan::Receiver<Arc<Peer>> {
        &self.done_rx
    }

    /// The delay before the next outbound dial attempt for a peer that has
    /// failed `retry_count` times already: linear backoff, half a retry
    /// interval per attempt, uncapped.
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        self.connection_retry_interval * retry_count / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_default_retry_interval() {
        let server = Server::new(1, Duration::from_secs(60));
        assert_eq!(server.connection_retry_interval(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_grows_linearly_with_retry_count() {
        let server = Server::new(1, Duration::from_secs(60));
        assert_eq!(server.retry_backoff(0), Duration::from_secs(0));
        assert_eq!(server.retry_backoff(2), Duration::from_secs(60));
        assert_eq!(server.retry_backoff(4), Duration::from_secs(120));
    }
}
