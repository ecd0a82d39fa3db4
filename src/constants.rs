//! Protocol constants and tuning parameters.
//!
//! Timeouts and size caps follow the conventions of the mainline peer
//! wire protocol; pipelining depth and pool geometry are tuning knobs.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-PW0001-";

// ============================================================================
// Ports
// ============================================================================

/// First listen port to try
pub const LISTEN_PORT_FIRST: u16 = 6881;

/// Last listen port to try (inclusive)
pub const LISTEN_PORT_LAST: u16 = 6980;

// ============================================================================
// Block and message sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length (128KB). Requests larger than this are suspicious
/// and drop the connection.
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Maximum message frame payload (1MB). A longer length prefix is a
/// protocol violation.
pub const MAX_FRAME_PAYLOAD: usize = 1048576;

// ============================================================================
// Request pipelining
// ============================================================================

/// Maximum outstanding block requests per peer
pub const PIPELINE_DEPTH: usize = 10;

// ============================================================================
// Timeouts
// ============================================================================

/// Timeout for an outstanding block request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive message interval (outbound idle)
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Disconnect a peer that has sent nothing for this long
pub const IDLE_DISCONNECT: Duration = Duration::from_secs(180);

// ============================================================================
// Buffer pool
// ============================================================================

/// Pool bucket sizes are rounded up to this alignment
pub const POOL_ALIGN: usize = 8;

/// Requests above this size bypass the pool
pub const POOL_MAX_BUFFER: usize = 256 * 1024;

/// Maximum free buffers retained per bucket
pub const POOL_SLAB_CAP: usize = 64;

// ============================================================================
// I/O
// ============================================================================

/// Read buffer size for peer sockets
pub const READ_BUFFER_SIZE: usize = 64 * 1024;
