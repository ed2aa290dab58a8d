use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::datetime::{DateMask, TimeOfDay};

/// A job schedule: either a list of wall-clock firing times, or a periodic
/// window, both gated by a date mask.
#[derive(Debug, Clone)]
pub enum Schedule {
    At(ScheduleAt),
    Every(ScheduleEvery),
}

/// `at T1, T2, … on D` — fires at the listed times on matching dates.
#[derive(Debug, Clone)]
pub struct ScheduleAt {
    pub times: Vec<TimeOfDay>,
    pub mask: DateMask,
}

/// `every P from T1 until T2 on D` — fires at `T1, T1+P, … < T2` on
/// matching dates. An undefined `from` starts at midnight; an undefined
/// `until` runs to the end of the day.
#[derive(Debug, Clone)]
pub struct ScheduleEvery {
    pub period: Duration,
    pub from: TimeOfDay,
    pub until: TimeOfDay,
    pub mask: DateMask,
}

impl Schedule {
    pub fn with_mask(self, mask: DateMask) -> Schedule {
        match self {
            Schedule::At(mut s) => {
                s.mask = mask;
                Schedule::At(s)
            }
            Schedule::Every(mut s) => {
                s.mask = mask;
                Schedule::Every(s)
            }
        }
    }

    /// Expand this schedule into the concrete firing times it produces on
    /// the given calendar date. Empty when the date mask does not match.
    pub fn plan_for_date(&self, date: DateTime<Local>) -> Vec<DateTime<Local>> {
        match self {
            Schedule::At(s) => {
                if !s.mask.matches_date(date) {
                    return Vec::new();
                }
                s.times.iter().map(|t| t.on_date(date)).collect()
            }
            Schedule::Every(s) => {
                if !s.mask.matches_date(date) {
                    return Vec::new();
                }
                let end = if s.until.is_defined() {
                    s.until.on_date(date)
                } else {
                    TimeOfDay::MIDNIGHT.on_date(date) + chrono::Duration::days(1)
                };
                let period = match chrono::Duration::from_std(s.period) {
                    Ok(period) if period > chrono::Duration::zero() => period,
                    _ => return Vec::new(),
                };

                let mut firings = Vec::new();
                let mut t = s.from.on_date(date);
                while t < end {
                    firings.push(t);
                    t += period;
                }
                firings
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::At(s) => {
                write!(f, "at ")?;
                for (i, t) in s.times.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                let summary = s.mask.summary();
                if !summary.is_empty() {
                    write!(f, " {summary}")?;
                }
                Ok(())
            }
            Schedule::Every(s) => {
                write!(f, "every {}s", s.period.as_secs())?;
                if s.from.is_defined() {
                    write!(f, " from {}", s.from)?;
                }
                if s.until.is_defined() {
                    write!(f, " until {}", s.until)?;
                }
                let summary = s.mask.summary();
                if !summary.is_empty() {
                    write!(f, " {summary}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn monday() -> DateTime<Local> {
        // 2026-08-03 is a Monday.
        Local.with_ymd_and_hms(2026, 8, 3, 0, 0, 0).unwrap()
    }

    fn tuesday() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 4, 0, 0, 0).unwrap()
    }

    #[test]
    fn every_30m_nine_to_noon_on_monday() {
        let schedule = Schedule::Every(ScheduleEvery {
            period: Duration::from_secs(30 * 60),
            from: TimeOfDay::from_hms(9, 0, 0),
            until: TimeOfDay::from_hms(12, 0, 0),
            mask: DateMask::EVERY_DAY.with_weekdays(DateMask::weekday(1)),
        });

        let plan = schedule.plan_for_date(monday());
        let rendered: Vec<(u32, u32)> = plan.iter().map(|t| (t.hour(), t.minute())).collect();
        assert_eq!(
            rendered,
            vec![(9, 0), (9, 30), (10, 0), (10, 30), (11, 0), (11, 30)]
        );

        assert!(schedule.plan_for_date(tuesday()).is_empty());
    }

    #[test]
    fn at_lists_every_time_on_matching_dates() {
        let schedule = Schedule::At(ScheduleAt {
            times: vec![TimeOfDay::from_hms(2, 0, 0), TimeOfDay::from_hms(14, 30, 0)],
            mask: DateMask::EVERY_DAY,
        });
        let plan = schedule.plan_for_date(monday());
        assert_eq!(plan.len(), 2);
        assert_eq!((plan[0].hour(), plan[0].minute()), (2, 0));
        assert_eq!((plan[1].hour(), plan[1].minute()), (14, 30));
    }

    #[test]
    fn every_without_bounds_covers_whole_day() {
        let schedule = Schedule::Every(ScheduleEvery {
            period: Duration::from_secs(6 * 3600),
            from: TimeOfDay::UNDEFINED,
            until: TimeOfDay::UNDEFINED,
            mask: DateMask::EVERY_DAY,
        });
        let plan = schedule.plan_for_date(monday());
        let hours: Vec<u32> = plan.iter().map(|t| t.hour()).collect();
        assert_eq!(hours, vec![0, 6, 12, 18]);
    }

    #[test]
    fn zero_period_produces_nothing() {
        let schedule = Schedule::Every(ScheduleEvery {
            period: Duration::ZERO,
            from: TimeOfDay::MIDNIGHT,
            until: TimeOfDay::UNDEFINED,
            mask: DateMask::EVERY_DAY,
        });
        assert!(schedule.plan_for_date(monday()).is_empty());
    }

    #[test]
    fn until_is_exclusive() {
        let schedule = Schedule::Every(ScheduleEvery {
            period: Duration::from_secs(3600),
            from: TimeOfDay::from_hms(10, 0, 0),
            until: TimeOfDay::from_hms(12, 0, 0),
            mask: DateMask::EVERY_DAY,
        });
        let hours: Vec<u32> = schedule
            .plan_for_date(monday())
            .iter()
            .map(|t| t.hour())
            .collect();
        assert_eq!(hours, vec![10, 11]);
    }
}
