use std::fmt;

use chrono::{DateTime, Datelike, Local, TimeZone};

/// A wall-clock time of day, stored as seconds from midnight. `UNDEFINED`
/// marks an absent `from`/`until` bound in `every` schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(i32);

impl TimeOfDay {
    pub const UNDEFINED: TimeOfDay = TimeOfDay(-1);
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_hms(hour: u32, minute: u32, second: u32) -> Self {
        TimeOfDay((hour * 3600 + minute * 60 + second) as i32)
    }

    pub fn is_defined(&self) -> bool {
        self.0 >= 0
    }

    pub fn hms(&self) -> (u32, u32, u32) {
        let total = self.0.max(0) as u32;
        (total / 3600, (total % 3600) / 60, total % 60)
    }

    /// Anchor this time of day on a calendar date, in local time.
    /// Undefined resolves to midnight; times that fall inside a DST gap
    /// resolve to the earliest valid instant.
    pub fn on_date(&self, date: DateTime<Local>) -> DateTime<Local> {
        let (hour, minute, second) = if self.is_defined() {
            self.hms()
        } else {
            (0, 0, 0)
        };
        Local
            .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, second)
            .earliest()
            .unwrap_or(date)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_defined() {
            return f.write_str("-");
        }
        let (h, m, s) = self.hms();
        if s == 0 {
            write!(f, "{h:02}:{m:02}")
        } else {
            write!(f, "{h:02}:{m:02}:{s:02}")
        }
    }
}

const DAY_SHIFT: u32 = 0;
const MONTH_SHIFT: u32 = 31;
const WEEKDAY_SHIFT: u32 = 43;

const DAY_BITS: u64 = ((1 << 31) - 1) << DAY_SHIFT;
const MONTH_BITS: u64 = ((1 << 12) - 1) << MONTH_SHIFT;
const WEEKDAY_BITS: u64 = ((1 << 7) - 1) << WEEKDAY_SHIFT;

/// Bitset over (weekday × month × day-of-month).
///
/// A date matches when its weekday bit, month bit, and day bit are all
/// set. `EVERY_DAY` has every bit set; schedule clauses narrow one group
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateMask(u64);

/// Weekdays indexed Sunday=0 through Saturday=6.
pub const WEEKDAY_NAMES: [&str; 7] = ["sunday", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday"];

pub const MONTH_NAMES: [&str; 12] = [
    "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december",
];

impl DateMask {
    pub const EVERY_DAY: DateMask = DateMask(DAY_BITS | MONTH_BITS | WEEKDAY_BITS);

    /// `weekday`: Sunday=0 … Saturday=6.
    pub fn weekday(weekday: u32) -> DateMask {
        DateMask(1 << weekday << WEEKDAY_SHIFT)
    }

    /// `month`: January=1 … December=12.
    pub fn month(month: u32) -> DateMask {
        DateMask(1 << (month - 1) << MONTH_SHIFT)
    }

    /// `day`: 1 … 31.
    pub fn day(day: u32) -> DateMask {
        DateMask(1 << (day - 1) << DAY_SHIFT)
    }

    pub fn union(self, other: DateMask) -> DateMask {
        DateMask(self.0 | other.0)
    }

    pub fn with_weekdays(self, weekdays: DateMask) -> DateMask {
        DateMask((self.0 & !WEEKDAY_BITS) | (weekdays.0 & WEEKDAY_BITS))
    }

    pub fn with_months(self, months: DateMask) -> DateMask {
        DateMask((self.0 & !MONTH_BITS) | (months.0 & MONTH_BITS))
    }

    pub fn with_days(self, days: DateMask) -> DateMask {
        DateMask((self.0 & !DAY_BITS) | (days.0 & DAY_BITS))
    }

    pub fn has_weekday_bits(self) -> bool {
        self.0 & WEEKDAY_BITS != 0
    }

    pub fn has_month_bits(self) -> bool {
        self.0 & MONTH_BITS != 0
    }

    pub fn has_day_bits(self) -> bool {
        self.0 & DAY_BITS != 0
    }

    fn contains(self, required: u64) -> bool {
        self.0 & required == required
    }

    pub fn matches_weekday(self, weekday: u32) -> bool {
        self.contains(1 << weekday << WEEKDAY_SHIFT)
    }

    pub fn matches_month(self, month: u32) -> bool {
        self.contains(1 << (month - 1) << MONTH_SHIFT)
    }

    pub fn matches_day(self, day: u32) -> bool {
        self.contains(1 << (day - 1) << DAY_SHIFT)
    }

    /// Bitwise match: the date's weekday, month, and day-of-month bits
    /// must all be present.
    pub fn matches_date(self, date: DateTime<Local>) -> bool {
        let required = 1u64 << date.weekday().num_days_from_sunday() << WEEKDAY_SHIFT
            | 1u64 << (date.month() - 1) << MONTH_SHIFT
            | 1u64 << (date.day() - 1) << DAY_SHIFT;
        self.contains(required)
    }

    /// Short rendering for config listings: empty when every weekday
    /// matches, "on mon, fri" style otherwise.
    pub fn summary(&self) -> String {
        if self.contains(WEEKDAY_BITS) {
            return String::new();
        }
        let mut out = String::new();
        let mut prefix = "on ";
        for (i, name) in WEEKDAY_NAMES.iter().enumerate() {
            if self.matches_weekday(i as u32) {
                out.push_str(prefix);
                out.push_str(name);
                prefix = ", ";
            }
        }
        out
    }
}

impl fmt::Display for DateMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let weekdays: Vec<&str> = WEEKDAY_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.matches_weekday(*i as u32))
            .map(|(_, name)| &name[..3])
            .collect();
        let months: Vec<&str> = MONTH_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.matches_month(*i as u32 + 1))
            .map(|(_, name)| &name[..3])
            .collect();
        let days: Vec<String> = (1..=31)
            .filter(|&d| self.matches_day(d))
            .map(|d| d.to_string())
            .collect();
        write!(
            f,
            "[{}][{}][{}]",
            weekdays.join(","),
            months.join(","),
            days.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn time_of_day_hms_roundtrip() {
        let t = TimeOfDay::from_hms(14, 30, 15);
        assert_eq!(t.hms(), (14, 30, 15));
        assert_eq!(t.to_string(), "14:30:15");
        assert_eq!(TimeOfDay::from_hms(2, 0, 0).to_string(), "02:00");
        assert_eq!(TimeOfDay::UNDEFINED.to_string(), "-");
    }

    #[test]
    fn on_date_anchors_local_midnight() {
        let d = date(2026, 3, 9);
        let anchored = TimeOfDay::from_hms(2, 0, 0).on_date(d);
        assert_eq!(anchored.day(), 9);
        assert_eq!(anchored.minute(), 0);
    }

    #[test]
    fn every_day_matches_everything() {
        assert!(DateMask::EVERY_DAY.matches_date(date(2026, 1, 1)));
        assert!(DateMask::EVERY_DAY.matches_date(date(2026, 12, 31)));
    }

    #[test]
    fn weekday_restriction() {
        // 2026-08-03 is a Monday.
        let monday_only = DateMask::EVERY_DAY.with_weekdays(DateMask::weekday(1));
        assert!(monday_only.matches_date(date(2026, 8, 3)));
        assert!(!monday_only.matches_date(date(2026, 8, 4)));
        assert!(!monday_only.matches_date(date(2026, 8, 2)));
    }

    #[test]
    fn month_and_day_restrictions_compose() {
        let first_of_june = DateMask::EVERY_DAY
            .with_months(DateMask::month(6))
            .with_days(DateMask::day(1));
        assert!(first_of_june.matches_date(date(2026, 6, 1)));
        assert!(!first_of_june.matches_date(date(2026, 6, 2)));
        assert!(!first_of_june.matches_date(date(2026, 7, 1)));
    }

    #[test]
    fn weekday_union() {
        let mon_wed_fri = DateMask::weekday(1)
            .union(DateMask::weekday(3))
            .union(DateMask::weekday(5));
        let mask = DateMask::EVERY_DAY.with_weekdays(mon_wed_fri);
        assert!(mask.matches_date(date(2026, 8, 3))); // monday
        assert!(!mask.matches_date(date(2026, 8, 4))); // tuesday
        assert!(mask.matches_date(date(2026, 8, 5))); // wednesday
        assert!(mask.matches_date(date(2026, 8, 7))); // friday
    }

    #[test]
    fn summary_renders_weekday_subset() {
        let mask = DateMask::EVERY_DAY.with_weekdays(DateMask::weekday(1).union(DateMask::weekday(5)));
        assert_eq!(mask.summary(), "on monday, friday");
        assert_eq!(DateMask::EVERY_DAY.summary(), "");
    }
}
