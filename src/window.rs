//! Batch window arithmetic: when history cleanup may run, and when it may run next

use crate::error::{CleanupError, Result, TimeOfDayParseError};
use chrono::{
    DateTime, Duration, FixedOffset, Local, LocalResult, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

/// A wall-clock time of day, optionally pinned to a UTC offset.
///
/// Parsed from `HH:mmZ` (RFC 822 offset such as `22:00+0100`) or, failing that,
/// from `HH:mm`, in which case it is read in the zone it is later evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    time: NaiveTime,
    offset: Option<FixedOffset>,
}

impl TimeOfDay {
    pub fn new(time: NaiveTime) -> Self {
        Self { time, offset: None }
    }

    pub fn with_offset(time: NaiveTime, offset: FixedOffset) -> Self {
        Self {
            time,
            offset: Some(offset),
        }
    }

    /// Parse a configured time of day, trying the offset format first.
    pub fn parse(input: &str) -> std::result::Result<Self, TimeOfDayParseError> {
        parse_with_offset(input)
            .or_else(|| parse_hours_minutes(input).map(Self::new))
            .ok_or_else(|| TimeOfDayParseError {
                input: input.to_string(),
            })
    }

    pub fn hour(&self) -> u32 {
        self.time.hour()
    }

    pub fn minute(&self) -> u32 {
        self.time.minute()
    }

    pub fn second(&self) -> u32 {
        self.time.second()
    }

    pub fn millisecond(&self) -> u32 {
        self.time.nanosecond() / 1_000_000
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        self.offset
    }

    /// The same instant of the day expressed as wall-clock time in `zone`.
    pub fn time_in(&self, zone: &FixedOffset) -> NaiveTime {
        match self.offset {
            Some(own) => {
                let shift = i64::from(zone.local_minus_utc() - own.local_minus_utc());
                self.time + Duration::seconds(shift)
            }
            None => self.time,
        }
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeOfDayParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.time.format("%H:%M"))?;
        if let Some(offset) = self.offset {
            let secs = offset.local_minus_utc();
            let sign = if secs < 0 { '-' } else { '+' };
            let secs = secs.abs();
            write!(f, "{}{:02}{:02}", sign, secs / 3600, (secs % 3600) / 60)?;
        }
        Ok(())
    }
}

/// `HH:mm`, exactly two digits each
fn parse_hours_minutes(input: &str) -> Option<NaiveTime> {
    let bytes = input.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    if !bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit) {
        return None;
    }
    NaiveTime::parse_from_str(input, "%H:%M").ok()
}

/// `HH:mm` followed by `+HHMM` or `-HHMM`
fn parse_with_offset(input: &str) -> Option<TimeOfDay> {
    let time = parse_hours_minutes(input.get(..5)?)?;
    let offset = parse_utc_offset(input.get(5..)?)?;
    Some(TimeOfDay::with_offset(time, offset))
}

/// RFC 822 zone offset, `+HHMM` or `-HHMM`
pub(crate) fn parse_utc_offset(input: &str) -> Option<FixedOffset> {
    let zone = input.as_bytes();
    if zone.len() != 5 || !zone[1..].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let sign = match zone[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digit = |i: usize| i32::from(zone[i] - b'0');
    let hours = digit(1) * 10 + digit(2);
    let minutes = digit(3) * 10 + digit(4);
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Whether `now` falls in the daily window `[start, end)`.
///
/// When `end` is not after `start` the window wraps past midnight, so
/// `start == end` classifies every instant as inside. Bounds without an
/// offset are compared against the wall clock of `now`'s zone.
pub fn is_within_batch_window<Z: TimeZone>(
    now: &DateTime<Z>,
    start: &TimeOfDay,
    end: &TimeOfDay,
) -> bool {
    let zone = now.offset().fix();
    let start = start.time_in(&zone);
    let end = end.time_in(&zone);
    let time = now.time();

    if end > start {
        start <= time && time < end
    } else {
        time >= start || time < end
    }
}

/// The first instant strictly after `now` whose time of day is `start`.
///
/// A start pinned to an offset names the same instant every day. A local
/// start follows `now`'s zone, so across a DST change the next run may be 23
/// or 25 hours after the previous one.
pub fn next_run_within_batch_window<Z: TimeZone>(
    now: &DateTime<Z>,
    start: &TimeOfDay,
) -> DateTime<Z> {
    let tz = now.timezone();

    if let Some(own) = start.offset() {
        let unpinned = TimeOfDay::new(start.time);
        let pinned = next_run_within_batch_window(&now.with_timezone(&own), &unpinned);
        return pinned.with_timezone(&tz);
    }

    let today = now.date_naive();
    let candidate = resolve_local(&tz, today.and_time(start.time));
    if candidate > *now {
        candidate
    } else {
        resolve_local(&tz, (today + Duration::days(1)).and_time(start.time))
    }
}

/// Map a wall-clock time in `tz` onto an instant.
///
/// A repeated time resolves to its first occurrence. A time skipped by a
/// forward shift is read with the offset in force before the shift.
fn resolve_local<Z: TimeZone>(tz: &Z, local: NaiveDateTime) -> DateTime<Z> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(instant) => instant,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let before = tz.offset_from_utc_datetime(&(local - Duration::days(1))).fix();
            let utc = local - Duration::seconds(i64::from(before.local_minus_utc()));
            tz.from_utc_datetime(&utc)
        }
    }
}

/// The zone "now" is read in when evaluating the batch window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineZone {
    /// The host zone, with its offset looked up for every instant
    Local,
    /// A named IANA zone such as `Europe/Berlin`
    Named(Tz),
    /// A fixed UTC offset; every day is exactly 24 hours long
    Fixed(FixedOffset),
}

impl EngineZone {
    /// The UTC offset in force at `instant`
    pub fn offset_at(&self, instant: &DateTime<Utc>) -> FixedOffset {
        match self {
            EngineZone::Local => instant.with_timezone(&Local).offset().fix(),
            EngineZone::Named(tz) => instant.with_timezone(tz).offset().fix(),
            EngineZone::Fixed(offset) => *offset,
        }
    }
}

impl From<FixedOffset> for EngineZone {
    fn from(offset: FixedOffset) -> Self {
        EngineZone::Fixed(offset)
    }
}

impl From<Tz> for EngineZone {
    fn from(tz: Tz) -> Self {
        EngineZone::Named(tz)
    }
}

impl fmt::Display for EngineZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineZone::Local => f.write_str("local"),
            EngineZone::Named(tz) => write!(f, "{}", tz.name()),
            EngineZone::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

/// The configured daily batch window, evaluated in the engine's zone.
#[derive(Debug, Clone)]
pub struct BatchWindow {
    start: Option<TimeOfDay>,
    end: Option<TimeOfDay>,
    zone: EngineZone,
}

impl BatchWindow {
    pub fn new(
        start: Option<TimeOfDay>,
        end: Option<TimeOfDay>,
        zone: impl Into<EngineZone>,
    ) -> Self {
        Self {
            start,
            end,
            zone: zone.into(),
        }
    }

    /// A window in the zone of the host running the engine.
    pub fn local(start: Option<TimeOfDay>, end: Option<TimeOfDay>) -> Self {
        Self::new(start, end, EngineZone::Local)
    }

    pub fn start(&self) -> Option<&TimeOfDay> {
        self.start.as_ref()
    }

    pub fn end(&self) -> Option<&TimeOfDay> {
        self.end.as_ref()
    }

    pub fn zone(&self) -> EngineZone {
        self.zone
    }

    pub fn is_configured(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// True for a configured window whose start and end coincide at `now`, which never closes.
    pub fn is_always_open(&self, now: DateTime<Utc>) -> bool {
        let zone = self.zone.offset_at(&now);
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => start.time_in(&zone) == end.time_in(&zone),
            _ => false,
        }
    }

    pub fn is_within(&self, now: DateTime<Utc>) -> Result<bool> {
        let (start, end) = self.bounds()?;
        Ok(match self.zone {
            EngineZone::Local => is_within_batch_window(&now.with_timezone(&Local), start, end),
            EngineZone::Named(tz) => is_within_batch_window(&now.with_timezone(&tz), start, end),
            EngineZone::Fixed(offset) => {
                is_within_batch_window(&now.with_timezone(&offset), start, end)
            }
        })
    }

    pub fn next_run_at_or_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let (start, _) = self.bounds()?;
        let next = match self.zone {
            EngineZone::Local => {
                next_run_within_batch_window(&now.with_timezone(&Local), start).with_timezone(&Utc)
            }
            EngineZone::Named(tz) => {
                next_run_within_batch_window(&now.with_timezone(&tz), start).with_timezone(&Utc)
            }
            EngineZone::Fixed(offset) => {
                next_run_within_batch_window(&now.with_timezone(&offset), start).with_timezone(&Utc)
            }
        };
        Ok(next)
    }

    fn bounds(&self) -> Result<(&TimeOfDay, &TimeOfDay)> {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(CleanupError::window_not_configured()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;

    fn tod(s: &str) -> TimeOfDay {
        TimeOfDay::parse(s).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        utc().with_ymd_and_hms(2024, 5, 17, h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_with_offset() {
        let t = tod("22:00+0100");
        assert_eq!(t.hour(), 22);
        assert_eq!(t.minute(), 0);
        assert_eq!(t.offset(), FixedOffset::east_opt(3600));

        let t = tod("06:30-0530");
        assert_eq!(t.offset(), FixedOffset::west_opt(5 * 3600 + 30 * 60));
    }

    #[test]
    fn test_parse_falls_back_to_local() {
        let t = tod("22:00");
        assert_eq!((t.hour(), t.minute(), t.second(), t.millisecond()), (22, 0, 0, 0));
        assert!(t.offset().is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["22:0", "2200", "24:00", "22:60", "22:00+01", "22:00 +0100", "", "ab:cd"] {
            let err = TimeOfDay::parse(input).unwrap_err();
            assert_eq!(err.input, input);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(tod("07:05").to_string(), "07:05");
        assert_eq!(tod("22:00+0100").to_string(), "22:00+0100");
        assert_eq!(tod("22:00-0330").to_string(), "22:00-0330");
    }

    #[test]
    fn test_time_in_other_zone() {
        let t = tod("22:00+0100");
        assert_eq!(t.time_in(&utc()), NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        assert_eq!(t.time_in(&tokyo), NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        // local times are taken as-is
        assert_eq!(tod("22:00").time_in(&tokyo), NaiveTime::from_hms_opt(22, 0, 0).unwrap());
    }

    #[test]
    fn test_same_day_window() {
        let (start, end) = (tod("02:00"), tod("05:00"));
        assert!(is_within_batch_window(&at(2, 0), &start, &end));
        assert!(is_within_batch_window(&at(4, 59), &start, &end));
        assert!(!is_within_batch_window(&at(1, 59), &start, &end));
        assert!(!is_within_batch_window(&at(5, 0), &start, &end));
        assert!(!is_within_batch_window(&at(23, 0), &start, &end));
    }

    #[test]
    fn test_overnight_window() {
        let (start, end) = (tod("22:00"), tod("06:00"));
        assert!(is_within_batch_window(&at(23, 30), &start, &end));
        assert!(is_within_batch_window(&at(22, 0), &start, &end));
        assert!(is_within_batch_window(&at(0, 0), &start, &end));
        assert!(is_within_batch_window(&at(5, 59), &start, &end));
        assert!(!is_within_batch_window(&at(6, 0), &start, &end));
        assert!(!is_within_batch_window(&at(12, 0), &start, &end));
    }

    #[test]
    fn test_degenerate_window_is_always_open() {
        let (start, end) = (tod("08:00"), tod("08:00"));
        for h in 0..24 {
            assert!(is_within_batch_window(&at(h, 0), &start, &end));
            assert!(is_within_batch_window(&at(h, 59), &start, &end));
        }
        let window = BatchWindow::new(Some(start), Some(end), utc());
        assert!(window.is_always_open(Utc::now()));
        let window = BatchWindow::new(Some(tod("08:00")), Some(tod("09:00")), utc());
        assert!(!window.is_always_open(Utc::now()));
    }

    #[test]
    fn test_exhaustive_classification_by_minute() {
        let windows = [("01:15", "03:45"), ("22:00", "06:00"), ("00:00", "23:59"), ("12:00", "12:01")];
        for (s, e) in windows {
            let (start, end) = (tod(s), tod(e));
            let (sm, em) = (start.hour() * 60 + start.minute(), end.hour() * 60 + end.minute());
            for minute in 0..24 * 60 {
                let expected = if em > sm {
                    sm <= minute && minute < em
                } else {
                    minute >= sm || minute < em
                };
                let now = at(minute / 60, minute % 60);
                assert_eq!(is_within_batch_window(&now, &start, &end), expected, "{s}-{e} at {minute}");
            }
        }
    }

    #[test]
    fn test_next_run_later_today() {
        let next = next_run_within_batch_window(&at(12, 0), &tod("22:00"));
        assert_eq!(next, at(22, 0));
    }

    #[test]
    fn test_next_run_rolls_to_tomorrow() {
        let next = next_run_within_batch_window(&at(23, 30), &tod("22:00"));
        assert_eq!(next, utc().with_ymd_and_hms(2024, 5, 18, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_equal_to_now_rolls_over() {
        let next = next_run_within_batch_window(&at(22, 0), &tod("22:00"));
        assert_eq!(next, utc().with_ymd_and_hms(2024, 5, 18, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_drops_sub_second_precision() {
        let now = at(21, 59) + Duration::milliseconds(59_999);
        assert_eq!(next_run_within_batch_window(&now, &tod("22:00")), at(22, 0));
    }

    #[test]
    fn test_next_run_crosses_year_boundary() {
        let now = utc().with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap();
        let next = next_run_within_batch_window(&now, &tod("01:00"));
        assert_eq!(next, utc().with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());

        let now = utc().with_ymd_and_hms(2024, 2, 29, 10, 0, 0).unwrap();
        let next = next_run_within_batch_window(&now, &tod("09:00"));
        assert_eq!(next, utc().with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_is_strictly_later_and_daily() {
        let start = tod("03:17");
        for minute in (0..24 * 60).step_by(7) {
            let now = at(minute / 60, minute % 60);
            let next = next_run_within_batch_window(&now, &start);
            assert!(next > now);
            assert!(next - now <= Duration::days(1));
            assert_eq!(next_run_within_batch_window(&next, &start), next + Duration::days(1));
        }
    }

    #[test]
    fn test_window_converts_offsets() {
        // 22:00 in +0100 is 21:00 UTC
        let window = BatchWindow::new(Some(tod("22:00+0100")), Some(tod("06:00+0100")), utc());
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 21, 30, 0).unwrap();
        assert!(window.is_within(now).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 5, 30, 0).unwrap();
        assert!(!window.is_within(now).unwrap());

        let next = window
            .next_run_at_or_after(Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 17, 21, 0, 0).unwrap());
    }

    #[test]
    fn test_window_in_engine_zone() {
        let berlin = FixedOffset::east_opt(2 * 3600).unwrap();
        let window = BatchWindow::new(Some(tod("22:00")), Some(tod("06:00")), berlin);
        // 20:30 UTC is 22:30 in the engine zone
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 20, 30, 0).unwrap();
        assert!(window.is_within(now).unwrap());
        let next = window
            .next_run_at_or_after(Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 17, 20, 0, 0).unwrap());
    }

    #[test]
    fn test_unconfigured_window_is_an_error() {
        let now = Utc::now();
        for window in [
            BatchWindow::new(None, None, utc()),
            BatchWindow::new(Some(tod("22:00")), None, utc()),
            BatchWindow::new(None, Some(tod("06:00")), utc()),
        ] {
            assert!(!window.is_configured());
            assert!(matches!(window.is_within(now), Err(CleanupError::ConfigurationError(_))));
            assert!(matches!(
                window.next_run_at_or_after(now),
                Err(CleanupError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        let window = BatchWindow::new(Some(tod("22:00")), Some(tod("23:00")), Berlin);

        // 21:30 UTC in December is 22:30 CET
        let winter = Utc.with_ymd_and_hms(2026, 12, 1, 21, 30, 0).unwrap();
        assert!(window.is_within(winter).unwrap());
        // 20:30 UTC in July is 22:30 CEST
        let summer = Utc.with_ymd_and_hms(2026, 7, 1, 20, 30, 0).unwrap();
        assert!(window.is_within(summer).unwrap());
        assert!(!window.is_within(winter - Duration::hours(1)).unwrap());

        let next = window
            .next_run_at_or_after(Utc.with_ymd_and_hms(2026, 12, 1, 12, 0, 0).unwrap())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 12, 1, 21, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_across_fall_back_is_25_hours() {
        let window = BatchWindow::new(Some(tod("22:00")), Some(tod("23:00")), Berlin);
        // 22:00 CEST on the Saturday before the clocks go back
        let saturday = Utc.with_ymd_and_hms(2026, 10, 24, 20, 0, 0).unwrap();
        let sunday = window.next_run_at_or_after(saturday).unwrap();
        assert_eq!(sunday, Utc.with_ymd_and_hms(2026, 10, 25, 21, 0, 0).unwrap());
        assert_eq!(sunday - saturday, Duration::hours(25));
        assert_eq!(sunday.with_timezone(&Berlin).time(), NaiveTime::from_hms_opt(22, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_across_spring_forward_is_23_hours() {
        let window = BatchWindow::new(Some(tod("22:00")), Some(tod("23:00")), Berlin);
        let saturday = Utc.with_ymd_and_hms(2026, 3, 28, 21, 0, 0).unwrap();
        let sunday = window.next_run_at_or_after(saturday).unwrap();
        assert_eq!(sunday - saturday, Duration::hours(23));
    }

    #[test]
    fn test_start_inside_skipped_hour_uses_previous_offset() {
        // 02:30 does not exist in Berlin on 2026-03-29; read as +01:00 it is 01:30 UTC
        let next = next_run_within_batch_window(
            &Utc.with_ymd_and_hms(2026, 3, 28, 12, 0, 0).unwrap().with_timezone(&Berlin),
            &tod("02:30"),
        );
        assert_eq!(next.with_timezone(&Utc), Utc.with_ymd_and_hms(2026, 3, 29, 1, 30, 0).unwrap());
    }

    #[test]
    fn test_repeated_hour_resolves_to_first_occurrence() {
        // 02:30 happens twice in Berlin on 2026-10-25, first at 00:30 UTC
        let next = next_run_within_batch_window(
            &Utc.with_ymd_and_hms(2026, 10, 24, 12, 0, 0).unwrap().with_timezone(&Berlin),
            &tod("02:30"),
        );
        assert_eq!(next.with_timezone(&Utc), Utc.with_ymd_and_hms(2026, 10, 25, 0, 30, 0).unwrap());
    }

    #[test]
    fn test_engine_zone_offset_lookup() {
        let summer = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let winter = Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap();
        let berlin = EngineZone::from(Berlin);
        assert_eq!(berlin.offset_at(&summer), FixedOffset::east_opt(2 * 3600).unwrap());
        assert_eq!(berlin.offset_at(&winter), FixedOffset::east_opt(3600).unwrap());
        assert_eq!(EngineZone::from(utc()).offset_at(&summer), utc());
        assert_eq!(berlin.to_string(), "Europe/Berlin");
    }
}
