//! Per-connection configuration.

use std::time::Duration;

/// Per-connection settings controlling backpressure and stream buffers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound messages per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when the outbound channel is full.
    pub send_timeout: Duration,
    /// Buffer size of a client stream when the operation sets no
    /// `ChannelCapacity` of its own.
    pub ingest_channel_capacity: usize,
    /// Maximum time a `*_data_with_ack` element waits for the client's ack.
    pub ack_timeout: Duration,
    /// Rate-limited inbound messages waiting for admission. A message
    /// arriving at a full queue is rejected as rate limited.
    pub admission_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            ingest_channel_capacity: 64,
            ack_timeout: Duration::from_secs(30),
            admission_queue_capacity: 128,
        }
    }
}
