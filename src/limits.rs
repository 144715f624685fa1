//! Hard caps applied before any write. Exceeding one is a validation failure.

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_VEHICLES_PER_TENANT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_INTERVALS_PER_LISTING: usize = 10_000;
pub const MAX_CONTRACTS_PER_LISTING: usize = 10_000;

/// Max interval inputs accepted by one upsert.
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Accepted calendar window for any stored date.
pub const MIN_VALID_YEAR: i32 = 1900;
pub const MAX_VALID_YEAR: i32 = 9999;

/// Longest range a single interval or contract may cover.
pub const MAX_RANGE_DAYS: i64 = 3_660;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 500;
