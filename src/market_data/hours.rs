// =============================================================================
// Market hours — weekday Eastern-time regular session
// =============================================================================
//
// Regular session: Monday–Friday 09:30–16:00 America/New_York, inclusive of
// the open, exclusive of the close. No holiday calendar.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

/// Session status snapshot returned by `get_market_hours`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHours {
    pub is_open: bool,
    /// Session open for the evaluated Eastern-time day, in UTC.
    pub session_open: Option<DateTime<Utc>>,
    /// Session close for the evaluated Eastern-time day, in UTC.
    pub session_close: Option<DateTime<Utc>>,
    pub timezone: String,
    pub as_of: DateTime<Utc>,
}

fn is_weekday(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Sat | Weekday::Sun)
}

/// Compute session status at `now`.
pub fn market_hours_at(now: DateTime<Utc>) -> MarketHours {
    let eastern = now.with_timezone(&New_York);
    let date = eastern.date_naive();

    if !is_weekday(eastern.weekday()) {
        return MarketHours {
            is_open: false,
            session_open: None,
            session_close: None,
            timezone: "America/New_York".to_string(),
            as_of: now,
        };
    }

    let open_naive = date.and_time(NaiveTime::from_hms_opt(9, 30, 0).expect("valid time"));
    let close_naive = date.and_time(NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"));

    // DST transitions never straddle 09:30/16:00 local, so `single` holds.
    let session_open = New_York
        .from_local_datetime(&open_naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc));
    let session_close = New_York
        .from_local_datetime(&close_naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc));

    let is_open = match (session_open, session_close) {
        (Some(open), Some(close)) => now >= open && now < close,
        _ => false,
    };

    MarketHours {
        is_open,
        session_open,
        session_close,
        timezone: "America/New_York".to_string(),
        as_of: now,
    }
}

/// Whether the regular session is open at `now`.
pub fn is_market_open_at(now: DateTime<Utc>) -> bool {
    market_hours_at(now).is_open
}

// =============================================================================
// Tests
// =============================================================================
