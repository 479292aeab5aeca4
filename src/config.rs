//! Per-link tuning knobs.

use std::time::Duration;

/// Configuration applied to each physical link.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Maximum number of entries the transmit queue may hold.
    ///
    /// A producer that finds the queue full first reclaims expired entries,
    /// then waits for the consumer to make room.
    pub tx_queue_capacity: usize,
    /// Ceiling on how long a single wait for queue room may last before the
    /// producer re-evaluates the queue.
    pub max_enqueue_wait: Duration,
    /// Interfaces whose inbound messages tolerate invalid serial numbers.
    ///
    /// Control-plane housekeeping interfaces legitimately produce messages
    /// that appear out of sequence; an invalid serial on any other interface
    /// is a fatal protocol error that drops the connection.
    pub serial_tolerant_interfaces: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            tx_queue_capacity: 10,
            max_enqueue_wait: Duration::from_secs(20),
            serial_tolerant_interfaces: vec![
                "org.busmux.Bus".to_string(),
                "org.busmux.Daemon".to_string(),
            ],
        }
    }
}
