//! New-York trading-hours gates.
//!
//! No holiday calendar, just weekday + clock. The options window trails the
//! 09:30 open by sixteen minutes to sit out the opening-auction spreads and
//! stops one minute short of the close.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use chrono_tz::America::New_York;

/// Options market orders are accepted Mon-Fri 09:46:00-15:59:00 ET.
pub fn options_rth_open(now: DateTime<Utc>) -> bool {
    within_et_window(now, (9, 46), (15, 59))
}

/// Regular session, Mon-Fri 09:30:00-16:00:00 ET.
pub fn regular_market_open(now: DateTime<Utc>) -> bool {
    within_et_window(now, (9, 30), (16, 0))
}

fn within_et_window(now: DateTime<Utc>, start: (u32, u32), end: (u32, u32)) -> bool {
    let local = now.with_timezone(&New_York);

    // Saturday/Sunday.
    if local.weekday().number_from_monday() >= 6 {
        return false;
    }

    let t = local.time();
    let open = NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or(NaiveTime::MIN);
    let close = NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or(NaiveTime::MIN);
    t >= open && t <= close
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Build a UTC instant from an ET wall-clock reading.
    fn et(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_options_window_bounds() {
        // 2026-01-05 is a Monday.
        assert!(!options_rth_open(et(2026, 1, 5, 9, 30, 30)));
        assert!(!options_rth_open(et(2026, 1, 5, 9, 45, 59)));
        assert!(options_rth_open(et(2026, 1, 5, 9, 46, 0)));
        assert!(options_rth_open(et(2026, 1, 5, 12, 0, 0)));
        assert!(options_rth_open(et(2026, 1, 5, 15, 59, 0)));
        assert!(!options_rth_open(et(2026, 1, 5, 15, 59, 30)));
        assert!(!options_rth_open(et(2026, 1, 5, 16, 0, 0)));
    }

    #[test]
    fn test_weekend_closed() {
        // 2026-01-03/04 are Saturday and Sunday.
        assert!(!options_rth_open(et(2026, 1, 3, 12, 0, 0)));
        assert!(!options_rth_open(et(2026, 1, 4, 12, 0, 0)));
        assert!(!regular_market_open(et(2026, 1, 3, 12, 0, 0)));
    }

    #[test]
    fn test_regular_session_bounds() {
        assert!(!regular_market_open(et(2026, 1, 5, 9, 29, 59)));
        assert!(regular_market_open(et(2026, 1, 5, 9, 30, 0)));
        assert!(regular_market_open(et(2026, 1, 5, 16, 0, 0)));
        assert!(!regular_market_open(et(2026, 1, 5, 16, 0, 30)));
    }

    #[test]
    fn test_gate_is_dst_aware() {
        // 13:00 UTC is 09:00 ET in January (UTC-5) but 09:00 EDT in July
        // (UTC-4); midday UTC instants land differently across DST.
        let winter_noon_utc = Utc.with_ymd_and_hms(2026, 1, 5, 14, 50, 0).unwrap();
        assert!(options_rth_open(winter_noon_utc), "09:50 EST");

        let summer_same_utc = Utc.with_ymd_and_hms(2026, 7, 6, 13, 50, 0).unwrap();
        assert!(options_rth_open(summer_same_utc), "09:50 EDT");
        let summer_too_early = Utc.with_ymd_and_hms(2026, 7, 6, 13, 40, 0).unwrap();
        assert!(!options_rth_open(summer_too_early), "09:40 EDT");
    }
}
