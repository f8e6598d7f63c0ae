//! Hard bounds on inputs. Everything here is a validation limit, not a
//! tuning knob — exceeding one is a caller error.

use crate::model::Ms;

/// Earliest timestamp we accept anywhere (1970-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest timestamp we accept anywhere (2100-01-01).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest rental window: 90 days.
pub const MAX_WINDOW_DURATION_MS: Ms = 90 * 24 * 3_600_000;

pub const MAX_NOTE_LEN: usize = 500;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 120;
pub const MAX_URL_LEN: usize = 500;

/// Cap on concurrent schedule entries per car.
pub const MAX_SCHEDULE_ENTRIES: usize = 4096;

/// Cap on payment records per booking.
pub const MAX_PAYMENTS_PER_BOOKING: usize = 64;

/// A checkout link is good for 15 minutes.
pub const PAYMENT_EXPIRY_MS: Ms = 15 * 60_000;
