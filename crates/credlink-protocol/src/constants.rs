//! Channel protocol constants.
//!
//! Minimums follow the LE credit-based flow control mode; defaults follow the
//! IPSP node configuration (IPv6 requires a 1280-byte MTU).

/// Minimum MTU accepted on an LE credit-based channel.
pub const LE_MTU_MIN: u16 = 23;

/// Minimum MPS accepted on an LE credit-based channel.
pub const LE_MPS_MIN: u16 = 23;

/// Maximum MPS accepted on an LE credit-based channel.
pub const LE_MPS_MAX: u16 = 65533;

/// Size of the SDU length field carried in the first segment of every SDU.
pub const SDU_LENGTH_FIELD: usize = 2;

/// Default number of simultaneous peer connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Default maximum transmission unit.
pub const DEFAULT_MTU: u16 = 1280;

/// Default maximum payload segment size.
pub const DEFAULT_MPS: u16 = 247;

/// Default maximum relayed payload length in bytes.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1280;

/// Default initial receive credit grant.
pub const DEFAULT_INITIAL_CREDITS: u16 = 1000;

/// Default credit ceiling for both directions.
pub const DEFAULT_MAX_CREDITS: u16 = 1000;

/// Default receive-credit low-water mark.
pub const DEFAULT_LOW_WATER_MARK: u16 = DEFAULT_INITIAL_CREDITS / 2;
