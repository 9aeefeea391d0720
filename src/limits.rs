/// Maximum length of a donor name in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Maximum number of registered donors in one store.
pub const MAX_DONORS: usize = 1_000_000;

/// Maximum number of committed appointments in one store.
pub const MAX_APPOINTMENTS: usize = 1_000_000;

/// Maximum rows a single transaction may stage before commit.
pub const MAX_ROWS_PER_TRANSACTION: usize = 64;

/// Upper bound on the reservation retry budget accepted from configuration.
pub const MAX_RESERVE_ATTEMPTS: u32 = 16;

/// Upper bound on a single backoff sleep, in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;
