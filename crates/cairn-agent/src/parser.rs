use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cairn_types::error::{CairnError, Result};

use crate::config::Configuration;
use crate::datetime::{DateMask, TimeOfDay};
use crate::job::Job;
use crate::lexer::{tokenize, Lexeme, Token};
use crate::schedule::{Schedule, ScheduleAt, ScheduleEvery};
use crate::task::Task;

/// Parse a scheduler configuration.
///
/// Grammar, one job per `job` keyword:
///
/// ```text
/// job "name" <task> <schedule>…
/// task     := backup <repo> from <string> [with retention <duration>]
///           | check <repo> | restore <repo> to <string>
///           | maintenance <repo> | sync <repo> to <repo>
///           | rm <repo> with retention <duration>
/// repo     := @reference | "string"
/// schedule := at <time>,… [on <mask>,…]
///           | every <duration> [from <time>] [until <time>] [on <mask>,…]
/// mask     := weekday | month | day-of-month
/// ```
pub fn parse_config(input: &str) -> Result<Configuration> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse()
}

struct Parser {
    tokens: Vec<Lexeme>,
    pos: usize,
}

impl Parser {
    fn error_at(&self, message: impl Into<String>) -> CairnError {
        let line = self
            .tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|l| l.line)
            .unwrap_or(0);
        CairnError::Config(format!("line {line}: {}", message.into()))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|l| &l.token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|l| l.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<()> {
        match self.next() {
            Some(token) if token == *expected => Ok(()),
            Some(token) => Err(self.error_at(format!("expected {what}, found {token:?}"))),
            None => Err(self.error_at(format!("expected {what}, found end of input"))),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            Some(token) => Err(self.error_at(format!("expected {what}, found {token:?}"))),
            None => Err(self.error_at(format!("expected {what}, found end of input"))),
        }
    }

    fn expect_duration(&mut self, what: &str) -> Result<Duration> {
        match self.next() {
            Some(Token::Duration(d)) => Ok(d),
            Some(token) => Err(self.error_at(format!("expected {what}, found {token:?}"))),
            None => Err(self.error_at(format!("expected {what}, found end of input"))),
        }
    }

    fn expect_time(&mut self, what: &str) -> Result<TimeOfDay> {
        match self.next() {
            Some(Token::Time(t)) => Ok(t),
            Some(token) => Err(self.error_at(format!("expected {what}, found {token:?}"))),
            None => Err(self.error_at(format!("expected {what}, found end of input"))),
        }
    }

    /// A repository identifier: `@reference` or a quoted string.
    fn expect_repo(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Reference(r)) => Ok(r),
            Some(Token::Str(s)) => Ok(s),
            Some(token) => Err(self.error_at(format!("expected repository, found {token:?}"))),
            None => Err(self.error_at("expected repository, found end of input")),
        }
    }

    fn parse(&mut self) -> Result<Configuration> {
        let mut jobs: BTreeMap<String, Arc<Job>> = BTreeMap::new();
        while self.peek().is_some() {
            self.expect(&Token::Job, "'job'")?;
            let name = self.expect_string("job name")?;
            if jobs.contains_key(&name) {
                return Err(self.error_at(format!("duplicate job \"{name}\"")));
            }
            let task = self.parse_task()?;
            let mut schedules = Vec::new();
            while matches!(self.peek(), Some(Token::At) | Some(Token::Every)) {
                schedules.push(self.parse_schedule()?);
            }
            jobs.insert(name.clone(), Arc::new(Job::new(name, task, schedules)));
        }
        Ok(Configuration { jobs })
    }

    fn parse_task(&mut self) -> Result<Task> {
        match self.next() {
            Some(Token::Backup) => {
                let repository = self.expect_repo()?;
                self.expect(&Token::From, "'from'")?;
                let path = self.expect_string("backup source path")?;
                let retention = self.parse_retention_clause()?;
                Ok(Task::Backup {
                    repository,
                    path,
                    retention,
                })
            }
            Some(Token::Check) => {
                let repository = self.expect_repo()?;
                // `latest` is accepted for compatibility; checks always
                // cover every visible snapshot.
                if matches!(self.peek(), Some(Token::Latest)) {
                    self.next();
                }
                Ok(Task::Check { repository })
            }
            Some(Token::Restore) => {
                let repository = self.expect_repo()?;
                self.expect(&Token::To, "'to'")?;
                let target = self.expect_string("restore target path")?;
                Ok(Task::Restore { repository, target })
            }
            Some(Token::Maintenance) => Ok(Task::Maintenance {
                repository: self.expect_repo()?,
            }),
            Some(Token::Sync) => {
                let source = self.expect_repo()?;
                self.expect(&Token::To, "'to'")?;
                let destination = self.expect_repo()?;
                Ok(Task::Sync {
                    source,
                    destination,
                })
            }
            Some(Token::Rm) => {
                let repository = self.expect_repo()?;
                self.expect(&Token::With, "'with'")?;
                self.expect(&Token::Retention, "'retention'")?;
                let retention = self.expect_duration("retention duration")?;
                Ok(Task::Rm {
                    repository,
                    retention,
                })
            }
            Some(token) => Err(self.error_at(format!("expected a task, found {token:?}"))),
            None => Err(self.error_at("expected a task, found end of input")),
        }
    }

    fn parse_retention_clause(&mut self) -> Result<Option<Duration>> {
        if !matches!(self.peek(), Some(Token::With)) {
            return Ok(None);
        }
        self.next();
        self.expect(&Token::Retention, "'retention'")?;
        Ok(Some(self.expect_duration("retention duration")?))
    }

    fn parse_schedule(&mut self) -> Result<Schedule> {
        let schedule = match self.next() {
            Some(Token::At) => {
                let mut times = vec![self.expect_time("clock time")?];
                while matches!(self.peek(), Some(Token::Comma)) {
                    self.next();
                    times.push(self.expect_time("clock time")?);
                }
                Schedule::At(ScheduleAt {
                    times,
                    mask: DateMask::EVERY_DAY,
                })
            }
            Some(Token::Every) => {
                let period = self.expect_duration("period")?;
                let mut from = TimeOfDay::UNDEFINED;
                let mut until = TimeOfDay::UNDEFINED;
                if matches!(self.peek(), Some(Token::From)) {
                    self.next();
                    from = self.expect_time("'from' time")?;
                }
                if matches!(self.peek(), Some(Token::Until)) {
                    self.next();
                    until = self.expect_time("'until' time")?;
                }
                Schedule::Every(ScheduleEvery {
                    period,
                    from,
                    until,
                    mask: DateMask::EVERY_DAY,
                })
            }
            Some(token) => return Err(self.error_at(format!("expected a schedule, found {token:?}"))),
            None => return Err(self.error_at("expected a schedule, found end of input")),
        };

        if matches!(self.peek(), Some(Token::On)) {
            self.next();
            let mask = self.parse_date_mask()?;
            Ok(schedule.with_mask(mask))
        } else {
            Ok(schedule)
        }
    }

    /// `on` clause items narrow their own group; untouched groups keep
    /// matching every date.
    fn parse_date_mask(&mut self) -> Result<DateMask> {
        let mut weekdays: Option<DateMask> = None;
        let mut months: Option<DateMask> = None;
        let mut days: Option<DateMask> = None;

        loop {
            match self.next() {
                Some(Token::Weekday(day)) => {
                    let bit = DateMask::weekday(day);
                    weekdays = Some(weekdays.map_or(bit, |m| m.union(bit)));
                }
                Some(Token::Month(month)) => {
                    let bit = DateMask::month(month);
                    months = Some(months.map_or(bit, |m| m.union(bit)));
                }
                Some(Token::Integer(day)) => {
                    if !(1..=31).contains(&day) {
                        return Err(self.error_at(format!("day of month out of range: {day}")));
                    }
                    let bit = DateMask::day(day as u32);
                    days = Some(days.map_or(bit, |m| m.union(bit)));
                }
                Some(token) => {
                    return Err(self.error_at(format!(
                        "expected weekday, month, or day of month, found {token:?}"
                    )))
                }
                None => return Err(self.error_at("expected date mask, found end of input")),
            }
            if matches!(self.peek(), Some(Token::Comma)) {
                self.next();
            } else {
                break;
            }
        }

        let mut mask = DateMask::EVERY_DAY;
        if let Some(weekdays) = weekdays {
            mask = mask.with_weekdays(weekdays);
        }
        if let Some(months) = months {
            mask = mask.with_months(months);
        }
        if let Some(days) = days {
            mask = mask.with_days(days);
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone, Timelike};

    #[test]
    fn parses_nightly_backup() {
        let config = parse_config(
            r#"job "nightly" backup "@repo" from "/data" at 02:00 on mon,wed,fri"#,
        )
        .unwrap();
        assert_eq!(config.jobs.len(), 1);
        let job = &config.jobs["nightly"];
        match &job.task {
            Task::Backup {
                repository,
                path,
                retention,
            } => {
                assert_eq!(repository, "@repo");
                assert_eq!(path, "/data");
                assert!(retention.is_none());
            }
            other => panic!("wrong task: {other:?}"),
        }

        // 2026-08-03 is a Monday, 2026-08-04 a Tuesday.
        let monday = Local.with_ymd_and_hms(2026, 8, 3, 0, 0, 0).unwrap();
        let tuesday = Local.with_ymd_and_hms(2026, 8, 4, 0, 0, 0).unwrap();
        let plan = job.schedules[0].plan_for_date(monday);
        assert_eq!(plan.len(), 1);
        assert_eq!((plan[0].hour(), plan[0].minute()), (2, 0));
        assert!(job.schedules[0].plan_for_date(tuesday).is_empty());
    }

    #[test]
    fn parses_every_with_window() {
        let config = parse_config(
            r#"job "often" check @repo every 30m from 09:00 until 12:00 on mon"#,
        )
        .unwrap();
        let job = &config.jobs["often"];
        match &job.schedules[0] {
            Schedule::Every(every) => {
                assert_eq!(every.period, Duration::from_secs(1800));
                assert_eq!(every.from, TimeOfDay::from_hms(9, 0, 0));
                assert_eq!(every.until, TimeOfDay::from_hms(12, 0, 0));
            }
            other => panic!("wrong schedule: {other:?}"),
        }
    }

    #[test]
    fn parses_multiple_jobs_and_schedules() {
        let config = parse_config(
            r#"
            # two jobs, the second with two schedules
            job "a" maintenance @repo at 03:00
            job "b" rm @repo with retention 30d
                at 01:00, 13:00 on sat,sun
                every 6h on 1
            "#,
        )
        .unwrap();
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs["b"].schedules.len(), 2);
        match &config.jobs["b"].task {
            Task::Rm { retention, .. } => {
                assert_eq!(*retention, Duration::from_secs(30 * 86400))
            }
            other => panic!("wrong task: {other:?}"),
        }
    }

    #[test]
    fn parses_sync_and_restore() {
        let config = parse_config(
            r#"
            job "mirror" sync @primary to @offsite every 1h
            job "drill" restore @primary to "/tmp/drill" at 04:00
            "#,
        )
        .unwrap();
        assert!(matches!(config.jobs["mirror"].task, Task::Sync { .. }));
        assert!(matches!(config.jobs["drill"].task, Task::Restore { .. }));
    }

    #[test]
    fn parses_backup_retention() {
        let config =
            parse_config(r#"job "kept" backup @r from "/d" with retention 7d at 01:00"#).unwrap();
        match &config.jobs["kept"].task {
            Task::Backup { retention, .. } => {
                assert_eq!(*retention, Some(Duration::from_secs(7 * 86400)))
            }
            other => panic!("wrong task: {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_job_names() {
        let err = parse_config(
            r#"
            job "x" check @r at 01:00
            job "x" check @r at 02:00
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate job"));
    }

    #[test]
    fn rejects_out_of_range_day() {
        let err = parse_config(r#"job "x" check @r at 01:00 on 32"#).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn rejects_malformed_task() {
        assert!(parse_config(r#"job "x" backup @r at 01:00"#).is_err());
        assert!(parse_config(r#"job "x""#).is_err());
        assert!(parse_config(r#"check @r"#).is_err());
    }
}
