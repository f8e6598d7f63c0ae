//! Pricing calculator. Pure functions over the rate fields carried on the
//! booking — same inputs, same totals, no state.

use crate::model::{Amount, Ms, Window};

pub const MS_PER_HOUR: Ms = 3_600_000;
pub const MS_PER_DAY: Ms = 86_400_000;

fn ceil_div(n: i64, d: i64) -> i64 {
    (n + d - 1) / d
}

/// Ceil-to-day billing: at or past the 24-hour boundary the whole rental
/// bills as `ceil(days) × daily_rate`, below it as `ceil(hours) × hourly_rate`.
pub fn rental_total(window: &Window, hourly_rate: Amount, daily_rate: Amount) -> Amount {
    let dur = window.duration_ms();
    if dur >= MS_PER_DAY {
        ceil_div(dur, MS_PER_DAY) * daily_rate
    } else {
        ceil_div(dur, MS_PER_HOUR) * hourly_rate
    }
}

/// Deposit is 30% of the rental total, rounded half-up.
pub fn deposit_for(total: Amount) -> Amount {
    (total * 30 + 50) / 100
}

/// Late fee for returning after the booked window: ceil(hours late) at the
/// hourly rate. Zero for on-time or early returns.
pub fn late_fee(window_end: Ms, returned_at: Ms, hourly_rate: Amount) -> Amount {
    if returned_at <= window_end {
        return 0;
    }
    ceil_div(returned_at - window_end, MS_PER_HOUR) * hourly_rate
}

/// Amount due at checkout.
pub fn settlement_total(total: Amount, late_fee: Amount, damage_fee: Amount) -> Amount {
    total + late_fee + damage_fee
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-01-10T10:00:00Z
    const T0: Ms = 1_736_503_200_000;

    #[test]
    fn four_hours_bills_hourly() {
        // pickup 10:00, return 14:00, hourly 50000 → 200000; daily irrelevant
        let w = Window::new(T0, T0 + 4 * MS_PER_HOUR);
        assert_eq!(rental_total(&w, 50_000, 500_000), 200_000);
        assert_eq!(rental_total(&w, 50_000, 1), 200_000);
    }

    #[test]
    fn forty_eight_hours_bills_two_days() {
        let w = Window::new(T0, T0 + 2 * MS_PER_DAY);
        assert_eq!(rental_total(&w, 50_000, 500_000), 1_000_000);
    }

    #[test]
    fn switches_to_daily_exactly_at_24h() {
        let just_under = Window::new(T0, T0 + MS_PER_DAY - 1);
        let exactly = Window::new(T0, T0 + MS_PER_DAY);
        // 23h59m59.999s rounds up to 24 billable hours
        assert_eq!(rental_total(&just_under, 50_000, 500_000), 24 * 50_000);
        assert_eq!(rental_total(&exactly, 50_000, 500_000), 500_000);
    }

    #[test]
    fn partial_hours_round_up() {
        let w = Window::new(T0, T0 + 90 * 60_000); // 1h30m
        assert_eq!(rental_total(&w, 50_000, 500_000), 100_000);
    }

    #[test]
    fn partial_days_round_up() {
        let w = Window::new(T0, T0 + 25 * MS_PER_HOUR);
        assert_eq!(rental_total(&w, 50_000, 500_000), 1_000_000);
    }

    #[test]
    fn deterministic() {
        let w = Window::new(T0, T0 + 7 * MS_PER_HOUR);
        let a = rental_total(&w, 42_000, 600_000);
        let b = rental_total(&w, 42_000, 600_000);
        assert_eq!(a, b);
    }

    #[test]
    fn deposit_rounds_half_up() {
        assert_eq!(deposit_for(200_000), 60_000);
        assert_eq!(deposit_for(100), 30);
        assert_eq!(deposit_for(105), 32); // 31.5 rounds up
        assert_eq!(deposit_for(0), 0);
    }

    #[test]
    fn late_fee_rounds_up_per_hour() {
        let end = T0 + 4 * MS_PER_HOUR;
        assert_eq!(late_fee(end, end, 50_000), 0);
        assert_eq!(late_fee(end, end - 1000, 50_000), 0); // early
        assert_eq!(late_fee(end, end + 1, 50_000), 50_000);
        assert_eq!(late_fee(end, end + MS_PER_HOUR, 50_000), 50_000);
        assert_eq!(late_fee(end, end + MS_PER_HOUR + 1, 50_000), 100_000);
    }

    #[test]
    fn settlement_adds_fees() {
        assert_eq!(settlement_total(200_000, 25_000, 0), 225_000);
        assert_eq!(settlement_total(200_000, 0, 0), 200_000);
    }
}
