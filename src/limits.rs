//! Hard caps. Every limit maps to an `EngineError::LimitExceeded` at the
//! mutation that would cross it.

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_SHOPS_PER_TENANT: usize = 1024;
pub const MAX_SERVICES_PER_SHOP: usize = 256;
pub const MAX_STAFF_PER_SHOP: usize = 256;
pub const MAX_BOOKINGS_PER_SHOP: usize = 100_000;
pub const MAX_TIME_OFF_PER_STAFF: usize = 256;
pub const MAX_CLOSURES_PER_SHOP: usize = 1024;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_CUSTOMER_LEN: usize = 100;
pub const MAX_REASON_LEN: usize = 200;

/// Widest inclusive date range a stats query may cover.
pub const MAX_STATS_RANGE_DAYS: i64 = 366;
