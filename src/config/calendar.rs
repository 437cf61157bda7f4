// =============================================================================
// Trading Calendar — holiday schedule, session windows, delivery days
// =============================================================================
//
// Source: `holiday/holidaySchedule_{ROC_YEAR}.csv` (ROC year = western −
// 1911), Big5-encoded, columns `date (YYYY/MM/DD), remark`. The file is read
// as byte records: every field the core consumes is ASCII, so no transcoding
// is required. `remark == "o"` marks a trading day; listed dates with any
// other remark are closed; unlisted weekdays trade.
//
// Session model:
//   - day session   08:45–13:45
//   - night session 14:50–05:00 (next calendar day)
//   - Sunday is never open
//   - Saturday is a two-segment day: the 00:00–05:00 tail of Friday's night
//     session is open iff Friday was a trading day; the remainder is closed
//
// A missing calendar year is `CalendarMissing`; callers treat the queried day
// as closed rather than crashing.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

/// Offset between western and Republic-of-China calendar years.
const ROC_YEAR_OFFSET: i32 = 1911;

/// Day-session bounds.
const DAY_OPEN: (u32, u32) = (8, 45);
const DAY_CLOSE: (u32, u32) = (13, 45);
/// Night-session open and next-day close.
const NIGHT_OPEN: (u32, u32) = (14, 50);
const NIGHT_CLOSE: (u32, u32) = (5, 0);

fn hm(pair: (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(pair.0, pair.1, 0).expect("static time literal")
}

/// The third Wednesday of `month` — the TX delivery day. Used by both the
/// rollover engine and the report builders.
pub fn third_wednesday(year: i32, month: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid first of month");
    let to_wednesday = (Weekday::Wed.num_days_from_monday() + 7
        - first.weekday().num_days_from_monday())
        % 7;
    first + chrono::Duration::days(to_wednesday as i64 + 14)
}

// =============================================================================
// TradingCalendar
// =============================================================================

/// Holiday-schedule-backed trading calendar.
#[derive(Debug, Default)]
pub struct TradingCalendar {
    /// year → (date → is-trading flag), for dates the CSV lists explicitly.
    listed: HashMap<i32, HashMap<NaiveDate, bool>>,
}

impl TradingCalendar {
    /// Load every `holidaySchedule_*.csv` under `dir`. A missing directory
    /// yields an empty calendar (every query is then `CalendarMissing`).
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut calendar = Self::default();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "holiday directory unreadable — calendar empty");
                return calendar;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(roc_year) = name
                .strip_prefix("holidaySchedule_")
                .and_then(|s| s.strip_suffix(".csv"))
                .and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };

            let year = roc_year + ROC_YEAR_OFFSET;
            match Self::load_year_file(&entry.path()) {
                Ok(days) => {
                    info!(year, listed = days.len(), file = %name, "holiday schedule loaded");
                    calendar.listed.insert(year, days);
                }
                Err(e) => warn!(file = %name, error = %e, "failed to parse holiday schedule"),
            }
        }

        calendar
    }

    /// Parse one schedule file into listed dates. Byte records tolerate the
    /// Big5 remark column; rows whose first field is not a date (headers,
    /// annotations) are skipped.
    fn load_year_file(path: &Path) -> anyhow::Result<HashMap<NaiveDate, bool>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        let mut days = HashMap::new();
        for record in reader.byte_records() {
            let record = record?;
            let Some(date_field) = record.get(0) else {
                continue;
            };
            let Ok(date_str) = std::str::from_utf8(date_field) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_str.trim(), "%Y/%m/%d") else {
                continue;
            };

            let trading = record
                .get(1)
                .map(|remark| remark.trim_ascii() == b"o".as_slice())
                .unwrap_or(false);
            days.insert(date, trading);
        }
        Ok(days)
    }

    /// Build directly from listed dates (tests, fixtures).
    pub fn from_listed(entries: impl IntoIterator<Item = (NaiveDate, bool)>) -> Self {
        let mut listed: HashMap<i32, HashMap<NaiveDate, bool>> = HashMap::new();
        for (date, trading) in entries {
            listed.entry(date.year()).or_default().insert(date, trading);
        }
        Self { listed }
    }

    /// Mark a year as covered without listing any dates (tests).
    pub fn with_year(mut self, year: i32) -> Self {
        self.listed.entry(year).or_default();
        self
    }

    fn year_days(&self, year: i32) -> CoreResult<&HashMap<NaiveDate, bool>> {
        self.listed
            .get(&year)
            .ok_or(CoreError::CalendarMissing(year))
    }

    /// Whether `date` has a full trading session. Sundays never trade;
    /// Saturdays carry only the Friday-night tail and are not trading days
    /// in their own right.
    pub fn is_trading_day(&self, date: NaiveDate) -> CoreResult<bool> {
        let days = self.year_days(date.year())?;
        Ok(match date.weekday() {
            Weekday::Sun | Weekday::Sat => false,
            _ => days.get(&date).copied().unwrap_or(true),
        })
    }

    /// Saturday 00:00–05:00 is the tail of Friday's night session.
    pub fn saturday_follows_trading_friday(&self, saturday: NaiveDate) -> CoreResult<bool> {
        if saturday.weekday() != Weekday::Sat {
            return Ok(false);
        }
        self.is_trading_day(saturday - chrono::Duration::days(1))
    }

    /// Whether the market is open at the given local wall-clock instant.
    /// A missing calendar year means "assume closed".
    pub fn is_market_open_at(&self, now: NaiveDateTime) -> bool {
        match self.market_open_inner(now) {
            Ok(open) => open,
            Err(CoreError::CalendarMissing(year)) => {
                warn!(year, "calendar missing — treating market as closed");
                false
            }
            Err(_) => false,
        }
    }

    /// Convenience wrapper over the process-local clock.
    pub fn is_market_open_now(&self) -> bool {
        self.is_market_open_at(Local::now().naive_local())
    }

    fn market_open_inner(&self, now: NaiveDateTime) -> CoreResult<bool> {
        let date = now.date();
        let time = now.time();

        if date.weekday() == Weekday::Sun {
            return Ok(false);
        }

        // 00:00–05:00 belongs to the previous day's night session.
        if time <= hm(NIGHT_CLOSE) {
            return self.is_trading_day(date - chrono::Duration::days(1));
        }

        if date.weekday() == Weekday::Sat {
            return Ok(false);
        }

        if !self.is_trading_day(date)? {
            return Ok(false);
        }

        let in_day_session = time >= hm(DAY_OPEN) && time <= hm(DAY_CLOSE);
        let in_night_session = time >= hm(NIGHT_OPEN);
        Ok(in_day_session || in_night_session)
    }

    /// Delivery days are the third Wednesday of each month.
    pub fn is_delivery_day(&self, date: NaiveDate) -> bool {
        date == third_wednesday(date.year(), date.month())
    }

    /// The last trading day of `date`'s month (month-end report trigger).
    pub fn is_last_trading_day_of_month(&self, date: NaiveDate) -> CoreResult<bool> {
        if !self.is_trading_day(date)? {
            return Ok(false);
        }
        let mut cursor = date + chrono::Duration::days(1);
        while cursor.month() == date.month() {
            if self.is_trading_day(cursor)? {
                return Ok(false);
            }
            cursor += chrono::Duration::days(1);
        }
        Ok(true)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn dt(y: i32, m: u32, day: u32, h: u32, min: u32) -> NaiveDateTime {
        d(y, m, day).and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn third_wednesday_known_months() {
        assert_eq!(third_wednesday(2025, 7), d(2025, 7, 16));
        assert_eq!(third_wednesday(2025, 8), d(2025, 8, 20));
        assert_eq!(third_wednesday(2024, 1), d(2024, 1, 17));
        // Month starting on a Wednesday.
        assert_eq!(third_wednesday(2025, 1), d(2025, 1, 15));
    }

    #[test]
    fn missing_year_is_calendar_missing() {
        let cal = TradingCalendar::default();
        assert!(matches!(
            cal.is_trading_day(d(2025, 7, 1)),
            Err(CoreError::CalendarMissing(2025))
        ));
        // Market-open callers degrade to "closed".
        assert!(!cal.is_market_open_at(dt(2025, 7, 1, 9, 0)));
    }

    #[test]
    fn listed_holiday_closes_a_weekday() {
        let cal = TradingCalendar::from_listed([(d(2025, 1, 1), false)]);
        assert!(!cal.is_trading_day(d(2025, 1, 1)).unwrap()); // New Year
        assert!(cal.is_trading_day(d(2025, 1, 2)).unwrap()); // unlisted Thursday
        assert!(!cal.is_trading_day(d(2025, 1, 5)).unwrap()); // Sunday
    }

    #[test]
    fn day_and_night_session_bounds() {
        let cal = TradingCalendar::default().with_year(2025);
        // Tuesday 2025-07-01.
        assert!(!cal.is_market_open_at(dt(2025, 7, 1, 8, 44)));
        assert!(cal.is_market_open_at(dt(2025, 7, 1, 8, 45)));
        assert!(cal.is_market_open_at(dt(2025, 7, 1, 13, 45)));
        assert!(!cal.is_market_open_at(dt(2025, 7, 1, 14, 0)));
        assert!(cal.is_market_open_at(dt(2025, 7, 1, 14, 50)));
        assert!(cal.is_market_open_at(dt(2025, 7, 1, 23, 59)));
        // Night session tail on Wednesday morning.
        assert!(cal.is_market_open_at(dt(2025, 7, 2, 4, 59)));
        assert!(cal.is_market_open_at(dt(2025, 7, 2, 5, 0)));
        assert!(!cal.is_market_open_at(dt(2025, 7, 2, 5, 1)));
    }

    #[test]
    fn saturday_rule() {
        // 2025-07-04 is a Friday, 2025-07-05 a Saturday.
        let trading_friday = TradingCalendar::default().with_year(2025);
        assert!(trading_friday.is_market_open_at(dt(2025, 7, 5, 3, 0)));
        assert!(!trading_friday.is_market_open_at(dt(2025, 7, 5, 9, 0)));
        assert!(!trading_friday.is_market_open_at(dt(2025, 7, 5, 15, 0)));

        // Same Saturday, but Friday is a listed holiday: closed all day.
        let holiday_friday = TradingCalendar::from_listed([(d(2025, 7, 4), false)]);
        for (h, m) in [(3u32, 0u32), (9, 0), (15, 0), (23, 59)] {
            assert!(!holiday_friday.is_market_open_at(dt(2025, 7, 5, h, m)));
        }

        // Sunday is closed regardless.
        assert!(!trading_friday.is_market_open_at(dt(2025, 7, 6, 3, 0)));
        assert!(!trading_friday.is_market_open_at(dt(2025, 7, 6, 10, 0)));
    }

    #[test]
    fn delivery_day_predicate() {
        let cal = TradingCalendar::default().with_year(2025);
        assert!(cal.is_delivery_day(d(2025, 7, 16)));
        assert!(!cal.is_delivery_day(d(2025, 7, 15)));
    }

    #[test]
    fn last_trading_day_of_month() {
        // July 2025 ends on Thursday the 31st.
        let cal = TradingCalendar::default().with_year(2025);
        assert!(cal.is_last_trading_day_of_month(d(2025, 7, 31)).unwrap());
        assert!(!cal.is_last_trading_day_of_month(d(2025, 7, 30)).unwrap());

        // With the 31st a listed holiday, the 30th becomes month-end.
        let cal = TradingCalendar::from_listed([(d(2025, 7, 31), false)]);
        assert!(cal.is_last_trading_day_of_month(d(2025, 7, 30)).unwrap());
    }

    #[test]
    fn csv_schedule_loading() {
        let dir = std::env::temp_dir().join(format!("tvbridge-holiday-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        // ROC year 114 = 2025. Remark column may carry non-ASCII bytes on
        // closed days; trading make-up days are marked "o".
        let mut f = std::fs::File::create(dir.join("holidaySchedule_114.csv")).unwrap();
        f.write_all(b"date,remark\n2025/01/01,holiday\n2025/01/02,o\n").unwrap();
        drop(f);

        let cal = TradingCalendar::load(&dir);
        assert!(!cal.is_trading_day(d(2025, 1, 1)).unwrap());
        assert!(cal.is_trading_day(d(2025, 1, 2)).unwrap());
        assert!(matches!(
            cal.is_trading_day(d(2026, 1, 2)),
            Err(CoreError::CalendarMissing(2026))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
