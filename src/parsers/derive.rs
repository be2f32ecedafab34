// =============================================================================
// Option-parameter derivation — ATM strikes, expirations, sizing
// =============================================================================
//
// Charting sources send equity-only signals; every dialect derives the
// option parameters here. Strike increments: 2.5 below $25, 5 below $200,
// 10 at or above $200. Expiration is the next monthly third Friday or the
// next weekly Friday depending on the dialect's horizon. Quantity scales
// linearly from source confidence and clamps to [1, 10].
// =============================================================================

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Sizing clamp bounds shared by every dialect.
pub const MIN_QUANTITY: u32 = 1;
pub const MAX_QUANTITY: u32 = 10;

/// Standard strike increment for an underlying price.
pub fn strike_increment(price: Decimal) -> Decimal {
    if price < dec!(25) {
        dec!(2.5)
    } else if price < dec!(200) {
        dec!(5)
    } else {
        dec!(10)
    }
}

/// Nearest standard-increment strike to the underlying price.
pub fn atm_strike(price: Decimal) -> Decimal {
    let increment = strike_increment(price);
    let steps = (price / increment).round();
    (steps * increment).normalize()
}

/// Third Friday of the given month.
fn third_friday(year: i32, month: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let offset = (Weekday::Fri.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    first + Duration::days(offset + 14)
}

/// Next monthly expiration: this month's third Friday when still ahead of
/// `today`, otherwise next month's.
pub fn next_monthly_expiration(today: NaiveDate) -> NaiveDate {
    let this_month = third_friday(today.year(), today.month());
    if this_month > today {
        return this_month;
    }
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    third_friday(year, month)
}

/// Next weekly Friday strictly after `today`.
pub fn next_weekly_friday(today: NaiveDate) -> NaiveDate {
    let offset = (Weekday::Fri.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    if offset == 0 {
        today + Duration::days(7)
    } else {
        today + Duration::days(offset)
    }
}

/// Linear base + confidence/divisor sizing, clamped to [1, 10]. Each
/// dialect supplies its own base and divisor.
pub fn scale_quantity(base: f64, divisor: f64, confidence: f64) -> u32 {
    let raw = base + confidence / divisor;
    (raw.round() as i64).clamp(MIN_QUANTITY as i64, MAX_QUANTITY as i64) as u32
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strike_increments_by_price_band() {
        assert_eq!(atm_strike(dec!(18.70)), dec!(17.5));
        assert_eq!(atm_strike(dec!(21.40)), dec!(22.5));
        assert_eq!(atm_strike(dec!(101.40)), dec!(100));
        assert_eq!(atm_strike(dec!(197.80)), dec!(200));
        assert_eq!(atm_strike(dec!(502.15)), dec!(500));
        assert_eq!(atm_strike(dec!(507.00)), dec!(510));
    }

    #[test]
    fn third_friday_known_months() {
        assert_eq!(
            third_friday(2026, 8),
            NaiveDate::from_ymd_opt(2026, 8, 21).unwrap()
        );
        assert_eq!(
            third_friday(2026, 9),
            NaiveDate::from_ymd_opt(2026, 9, 18).unwrap()
        );
        assert_eq!(
            third_friday(2026, 1),
            NaiveDate::from_ymd_opt(2026, 1, 16).unwrap()
        );
    }

    #[test]
    fn monthly_expiration_rolls_forward() {
        // Before this month's third Friday.
        let early = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        assert_eq!(
            next_monthly_expiration(early),
            NaiveDate::from_ymd_opt(2026, 8, 21).unwrap()
        );
        // On the third Friday itself -> next month.
        let on_expiry = NaiveDate::from_ymd_opt(2026, 8, 21).unwrap();
        assert_eq!(
            next_monthly_expiration(on_expiry),
            NaiveDate::from_ymd_opt(2026, 9, 18).unwrap()
        );
        // December rolls into January.
        let december = NaiveDate::from_ymd_opt(2026, 12, 20).unwrap();
        assert_eq!(
            next_monthly_expiration(december),
            NaiveDate::from_ymd_opt(2027, 1, 15).unwrap()
        );
    }

    #[test]
    fn weekly_friday_is_strictly_ahead() {
        // Saturday 2026-08-01 -> Friday 2026-08-07.
        let saturday = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert_eq!(
            next_weekly_friday(saturday),
            NaiveDate::from_ymd_opt(2026, 8, 7).unwrap()
        );
        // A Friday rolls a full week.
        let friday = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();
        assert_eq!(
            next_weekly_friday(friday),
            NaiveDate::from_ymd_opt(2026, 8, 14).unwrap()
        );
    }

    #[test]
    fn quantity_scales_and_clamps() {
        assert_eq!(scale_quantity(1.0, 25.0, 0.0), 1);
        assert_eq!(scale_quantity(1.0, 25.0, 85.0), 4);
        assert_eq!(scale_quantity(1.0, 25.0, 100.0), 5);
        assert_eq!(scale_quantity(8.0, 10.0, 100.0), 10);
        assert_eq!(scale_quantity(0.0, 100.0, 10.0), 1);
    }
}
