//! Configuration for connections and the pool.

/// Socket-level options applied by every connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Disable Nagle so small frames leave immediately.
    pub nodelay: bool,
    /// Reject response frames announcing more than this many bytes.
    ///
    /// `None` accepts any length the 32-bit prefix can express.
    pub max_response_len: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            nodelay: true,
            max_response_len: None,
        }
    }
}

/// Configuration for [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of single-request connections in the pool.
    pub connections: usize,
    /// Maximum requests queued or in flight before backpressure applies.
    pub highwatermark: usize,
    /// Options shared by every pooled connection.
    pub options: ConnectionOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            connections: 256,
            highwatermark: 65_536,
            options: ConnectionOptions::default(),
        }
    }
}
