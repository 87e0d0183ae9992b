//! Tunable parameters for the peer engine. `Config::default()` reproduces
//! the reference numbers; callers that need different values go through the
//! `with_*` builders rather than constructing the struct directly, so that
//! adding a field later doesn't break existing call sites.

use std::time::Duration;

/// Maximum number of inventory vectors accepted in a single `Inv` or
/// `GetData` message before the sender is disconnected.
pub const MAX_INV_PER_MSG: usize = 50_000;

/// Maximum number of address entries carried in a single `Addr` message.
pub const MAX_ADDR_PER_MSG: usize = 1_000;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Depth of the outbound-message and inventory-hint channels.
    pub output_buffer_size: usize,
    /// Cap on vectors carried by a single trickled `Inv`.
    pub max_inv_trickle_size: usize,
    /// Capacity of the per-peer MRU known-inventory cache.
    pub max_known_inventory: usize,
    /// How long a peer may stay connected without completing the handshake.
    pub negotiate_timeout: Duration,
    /// How long a handshake-complete peer may stay idle before disconnect.
    pub idle_timeout: Duration,
    /// Reserved: no ping messages are emitted by this engine today.
    pub ping_timeout: Duration,
    /// Interval between inventory trickle flushes.
    pub trickle_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_buffer_size: 50,
            max_inv_trickle_size: 1_000,
            max_known_inventory: 1_000,
            negotiate_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            ping_timeout: Duration::from_secs(2 * 60),
            trickle_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn with_output_buffer_size(self, output_buffer_size: usize) -> Self {
        Self {
            output_buffer_size,
            ..self
        }
    }

    pub fn with_max_inv_trickle_size(self, max_inv_trickle_size: usize) -> Self {
        Self {
            max_inv_trickle_size,
            ..self
        }
    }

    pub fn with_max_known_inventory(self, max_known_inventory: usize) -> Self {
        Self {
            max_known_inventory,
            ..self
        }
    }

    pub fn with_negotiate_timeout(self, negotiate_timeout: Duration) -> Self {
        Self {
            negotiate_timeout,
            ..self
        }
    }

    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..self
        }
    }

    pub fn with_trickle_interval(self, trickle_interval: Duration) -> Self {
        Self {
            trickle_interval,
            ..self
        }
    }
}
