use std::time::Duration;

use cairn_types::error::{CairnError, Result};

use crate::datetime::{TimeOfDay, MONTH_NAMES, WEEKDAY_NAMES};

/// Tokens of the scheduler configuration language.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Job,
    Backup,
    Check,
    Restore,
    Maintenance,
    Sync,
    Rm,
    At,
    Every,
    From,
    Until,
    On,
    With,
    Retention,
    To,
    Latest,
    /// Sunday=0 … Saturday=6.
    Weekday(u32),
    /// January=1 … December=12.
    Month(u32),
    Integer(i64),
    Duration(Duration),
    /// Byte count from a size literal (`4mb`, `1gb`).
    Size(u64),
    Time(TimeOfDay),
    Str(String),
    /// `@name` repository reference, including the `@`.
    Reference(String),
    Comma,
}

#[derive(Debug, Clone)]
pub struct Lexeme {
    pub token: Token,
    pub line: usize,
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "job" => Token::Job,
        "backup" => Token::Backup,
        "check" => Token::Check,
        "restore" => Token::Restore,
        "maintenance" => Token::Maintenance,
        "sync" => Token::Sync,
        "rm" => Token::Rm,
        "at" => Token::At,
        "every" => Token::Every,
        "from" => Token::From,
        "until" => Token::Until,
        "on" => Token::On,
        "with" => Token::With,
        "retention" => Token::Retention,
        "to" => Token::To,
        "latest" => Token::Latest,
        _ => return None,
    })
}

fn weekday(word: &str) -> Option<u32> {
    WEEKDAY_NAMES
        .iter()
        .position(|name| *name == word || name[..3] == *word)
        .map(|i| i as u32)
}

fn month(word: &str) -> Option<u32> {
    MONTH_NAMES
        .iter()
        .position(|name| *name == word || name[..3] == *word)
        .map(|i| i as u32 + 1)
}

fn size_factor(suffix: &str) -> Option<u64> {
    Some(match suffix {
        "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        "tb" => 1u64 << 40,
        _ => return None,
    })
}

fn duration_factor(suffix: &str) -> Option<u64> {
    Some(match suffix {
        "s" | "sec" => 1,
        "m" | "min" => 60,
        "h" | "hr" => 3600,
        "d" => 86400,
        _ => return None,
    })
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
}

/// Tokenize a scheduler configuration. Comments run from `#` to end of
/// line; strings are double-quoted with `\n`, `\t`, `\\`, `\"` escapes.
pub fn tokenize(input: &str) -> Result<Vec<Lexeme>> {
    let mut lexer = Lexer {
        input: input.as_bytes(),
        pos: 0,
        line: 1,
    };
    let mut out = Vec::new();
    while let Some(lexeme) = lexer.next_token()? {
        out.push(lexeme);
    }
    Ok(out)
}

impl<'a> Lexer<'a> {
    fn error(&self, message: impl Into<String>) -> CairnError {
        CairnError::Config(format!("line {}: {}", self.line, message.into()))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn next_token(&mut self) -> Result<Option<Lexeme>> {
        loop {
            let Some(b) = self.peek() else {
                return Ok(None);
            };
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'#' => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }

        let line = self.line;
        let b = self.peek().expect("peeked above");
        let token = match b {
            b',' | b';' => {
                self.bump();
                Token::Comma
            }
            b'@' => self.scan_reference()?,
            b'"' => self.scan_string()?,
            b if b.is_ascii_alphabetic() => self.scan_word()?,
            b if b.is_ascii_digit() => self.scan_numeric()?,
            other => return Err(self.error(format!("unexpected character '{}'", other as char))),
        };
        Ok(Some(Lexeme { token, line }))
    }

    fn scan_reference(&mut self) -> Result<Token> {
        let mut s = String::from("@");
        self.bump(); // '@'
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                s.push(b as char);
                self.bump();
            } else {
                break;
            }
        }
        if s.len() == 1 {
            return Err(self.error("empty reference after '@'"));
        }
        Ok(Token::Reference(s))
    }

    fn scan_string(&mut self) -> Result<Token> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            let Some(b) = self.bump() else {
                return Err(self.error("unterminated string"));
            };
            match b {
                b'"' => break,
                b'\\' => {
                    let Some(escaped) = self.bump() else {
                        return Err(self.error("unterminated escape in string"));
                    };
                    if escaped == b'\n' {
                        return Err(self.error("newline in string escape"));
                    }
                    s.push(match escaped {
                        b'n' => '\n',
                        b't' => '\t',
                        other => other as char,
                    });
                }
                b'\n' => return Err(self.error("unterminated string")),
                other => s.push(other as char),
            }
        }
        Ok(Token::Str(s))
    }

    fn scan_word(&mut self) -> Result<Token> {
        let mut word = String::new();
        while let Some(b) = self.peek() {
            if b.is_ascii_alphabetic() {
                word.push(b.to_ascii_lowercase() as char);
                self.bump();
            } else {
                break;
            }
        }
        if let Some(token) = keyword(&word) {
            return Ok(token);
        }
        if let Some(day) = weekday(&word) {
            return Ok(Token::Weekday(day));
        }
        if let Some(month) = month(&word) {
            return Ok(Token::Month(month));
        }
        Ok(Token::Str(word))
    }

    fn scan_numeric(&mut self) -> Result<Token> {
        let mut digits = String::new();
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() {
                digits.push(b as char);
                self.bump();
            } else {
                break;
            }
        }

        let mut suffix = String::new();
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b':' {
                suffix.push(b.to_ascii_lowercase() as char);
                self.bump();
            } else {
                break;
            }
        }

        if suffix.is_empty() {
            let value: i64 = digits
                .parse()
                .map_err(|_| self.error(format!("invalid integer \"{digits}\"")))?;
            return Ok(Token::Integer(value));
        }

        // time: 4am, 4:30pm, 04:00, 16:30
        if suffix == "am" || suffix == "pm" || suffix.starts_with(':') {
            return self.parse_time(&digits, &suffix);
        }

        if let Some(factor) = size_factor(&suffix) {
            let value: u64 = digits
                .parse()
                .map_err(|_| self.error(format!("invalid size \"{digits}{suffix}\"")))?;
            return Ok(Token::Size(value * factor));
        }

        if let Some(factor) = duration_factor(&suffix) {
            let value: u64 = digits
                .parse()
                .map_err(|_| self.error(format!("invalid duration \"{digits}{suffix}\"")))?;
            return Ok(Token::Duration(Duration::from_secs(value * factor)));
        }

        Err(self.error(format!("invalid numeric token \"{digits}{suffix}\"")))
    }

    fn parse_time(&self, hours: &str, suffix: &str) -> Result<Token> {
        let mut rest = suffix;
        let (is_am, is_pm) = if let Some(stripped) = rest.strip_suffix("am") {
            rest = stripped;
            (true, false)
        } else if let Some(stripped) = rest.strip_suffix("pm") {
            rest = stripped;
            (false, true)
        } else {
            (false, false)
        };

        let fail = || self.error(format!("invalid time \"{hours}{suffix}\""));

        let mut minute = 0u32;
        if let Some(mm) = rest.strip_prefix(':') {
            if mm.len() != 2 {
                return Err(fail());
            }
            minute = mm.parse().map_err(|_| fail())?;
            if minute >= 60 {
                return Err(fail());
            }
        } else if !rest.is_empty() {
            return Err(fail());
        }

        let mut hour: u32 = hours.parse().map_err(|_| fail())?;
        if is_am {
            if !(1..=12).contains(&hour) {
                return Err(fail());
            }
            if hour == 12 {
                hour = 0;
            }
        } else if is_pm {
            if !(1..=12).contains(&hour) {
                return Err(fail());
            }
            if hour != 12 {
                hour += 12;
            }
        } else if hour > 23 {
            return Err(fail());
        }

        Ok(Token::Time(TimeOfDay::from_hms(hour, minute, 0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|l| l.token).collect()
    }

    #[test]
    fn keywords_and_strings() {
        assert_eq!(
            tokens(r#"job "nightly" backup"#),
            vec![Token::Job, Token::Str("nightly".into()), Token::Backup]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            tokens("job # the rest is ignored\ncheck"),
            vec![Token::Job, Token::Check]
        );
    }

    #[test]
    fn clock_times() {
        assert_eq!(tokens("02:00"), vec![Token::Time(TimeOfDay::from_hms(2, 0, 0))]);
        assert_eq!(tokens("4pm"), vec![Token::Time(TimeOfDay::from_hms(16, 0, 0))]);
        assert_eq!(
            tokens("4:30pm"),
            vec![Token::Time(TimeOfDay::from_hms(16, 30, 0))]
        );
        assert_eq!(tokens("12am"), vec![Token::Time(TimeOfDay::from_hms(0, 0, 0))]);
        assert_eq!(tokens("12pm"), vec![Token::Time(TimeOfDay::from_hms(12, 0, 0))]);
        assert!(tokenize("25:00").is_err());
        assert!(tokenize("10:7").is_err());
        assert!(tokenize("13pm").is_err());
    }

    #[test]
    fn durations_and_sizes() {
        assert_eq!(
            tokens("30m 2h 45sec 1d"),
            vec![
                Token::Duration(Duration::from_secs(1800)),
                Token::Duration(Duration::from_secs(7200)),
                Token::Duration(Duration::from_secs(45)),
                Token::Duration(Duration::from_secs(86400)),
            ]
        );
        assert_eq!(
            tokens("4mb 2kb"),
            vec![Token::Size(4 << 20), Token::Size(2 << 10)]
        );
    }

    #[test]
    fn weekdays_and_months() {
        assert_eq!(
            tokens("mon,wed,fri"),
            vec![
                Token::Weekday(1),
                Token::Comma,
                Token::Weekday(3),
                Token::Comma,
                Token::Weekday(5),
            ]
        );
        assert_eq!(tokens("sunday"), vec![Token::Weekday(0)]);
        assert_eq!(tokens("jan december may"), vec![Token::Month(1), Token::Month(12), Token::Month(5)]);
    }

    #[test]
    fn references() {
        assert_eq!(
            tokens("@prod-repo"),
            vec![Token::Reference("@prod-repo".into())]
        );
        assert!(tokenize("@").is_err());
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            tokens(r#""a\nb\t\"c\\""#),
            vec![Token::Str("a\nb\t\"c\\".into())]
        );
        assert!(tokenize("\"unterminated").is_err());
    }

    #[test]
    fn bare_integers() {
        assert_eq!(tokens("1 15 31"), vec![
            Token::Integer(1),
            Token::Integer(15),
            Token::Integer(31),
        ]);
    }

    #[test]
    fn error_carries_line_number() {
        let err = tokenize("job\n  !").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
