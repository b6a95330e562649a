//! Statement parsing.
//!
//! The engine understands a deliberately small command set: transaction
//! control, timeout settings, the schema and seed commands for table `t`,
//! the contended update, an engine-side sleep and a couple of diagnostic
//! queries. Anything else is rejected with a SQLSTATE error instead of
//! being silently ignored.

use super::error::{DbError, SqlState};
use super::types::Value;
use std::time::Duration;

/// The only table the engine hosts.
pub const TABLE: &str = "t";

/// Session settings the engine enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    LockTimeout,
    StatementTimeout,
    IdleInTransactionSessionTimeout,
}

impl Setting {
    pub fn name(self) -> &'static str {
        match self {
            Self::LockTimeout => "lock_timeout",
            Self::StatementTimeout => "statement_timeout",
            Self::IdleInTransactionSessionTimeout => "idle_in_transaction_session_timeout",
        }
    }

    fn from_name(name: &str) -> Result<Self, DbError> {
        match name {
            "lock_timeout" => Ok(Self::LockTimeout),
            "statement_timeout" => Ok(Self::StatementTimeout),
            "idle_in_transaction_session_timeout" => Ok(Self::IdleInTransactionSessionTimeout),
            other => Err(DbError::new(
                SqlState::UndefinedObject,
                format!("unrecognized configuration parameter \"{other}\""),
            )),
        }
    }
}

/// Right-hand side of a `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetValue {
    Default,
    Duration(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    Set {
        setting: Setting,
        value: SetValue,
        local: bool,
    },
    Reset(Setting),
    ResetAll,
    CreateTable {
        if_not_exists: bool,
    },
    /// `INSERT INTO t(name, num) ...`, optionally with
    /// `ON CONFLICT(name) DO UPDATE SET num = <on_conflict>`.
    Insert {
        key: String,
        num: i64,
        on_conflict: Option<i64>,
    },
    Update {
        key: String,
        num: i64,
    },
    SelectNum {
        key: String,
    },
    Sleep(Duration),
    CountSessions {
        user: Option<String>,
    },
}

impl Statement {
    /// True for statements that end a transaction block.
    pub fn ends_transaction(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }
}

/// Parses one statement, resolving `$n` and `?` placeholders from `params`.
pub fn parse(sql: &str, params: &[Value]) -> Result<Statement, DbError> {
    let tokens = tokenize(sql)?;
    if tokens.iter().all(|t| *t == Token::Symbol(';')) {
        return Err(DbError::syntax("empty statement"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        params,
    };
    let statement = parser.statement()?;
    parser.finish()?;
    Ok(statement)
}

/// Parses a duration setting value.
///
/// Bare numbers are milliseconds; `us`, `ms`, `s`, `min` and `h` units are
/// accepted. Zero disables the timeout.
pub fn parse_duration_setting(setting: Setting, raw: &str) -> Result<Duration, DbError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let invalid = || {
        DbError::new(
            SqlState::InvalidParameterValue,
            format!("invalid value for parameter \"{}\": \"{raw}\"", setting.name()),
        )
    };

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let millis_per_unit = match unit.trim() {
        "" | "ms" => 1.0,
        "us" => 0.001,
        "s" => 1_000.0,
        "min" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(invalid()),
    };

    let millis = value * millis_per_unit;
    if !millis.is_finite() || !(0.0..=f64::from(i32::MAX)).contains(&millis) {
        return Err(DbError::new(
            SqlState::InvalidParameterValue,
            format!(
                "{raw} is outside the valid range for parameter \"{}\" (0 .. 2147483647)",
                setting.name()
            ),
        ));
    }
    Ok(duration_from_millis_f64(millis))
}

fn duration_from_millis_f64(millis: f64) -> Duration {
    Duration::from_nanos((millis * 1_000_000.0).round() as u64)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(String),
    Str(String),
    Param(usize),
    Symbol(char),
}

fn tokenize(sql: &str) -> Result<Vec<Token>, DbError> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    let mut positional = 0;

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '-' && sql_comment_follows(&chars) {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else if c.is_ascii_digit() || c == '-' || c == '.' {
            let mut number = String::new();
            number.push(c);
            chars.next();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '.' {
                    number.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if number == "-" || number == "." {
                return Err(DbError::syntax(format!(
                    "syntax error at or near \"{number}\""
                )));
            }
            tokens.push(Token::Number(number));
        } else if c == '\'' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        text.push('\'');
                    },
                    Some('\'') => break,
                    Some(c) => text.push(c),
                    None => {
                        return Err(DbError::syntax("unterminated quoted string"));
                    },
                }
            }
            tokens.push(Token::Str(text));
        } else if c == '$' {
            chars.next();
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let index: usize = digits
                .parse()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| DbError::syntax("syntax error at or near \"$\""))?;
            tokens.push(Token::Param(index - 1));
        } else if c == '?' {
            chars.next();
            tokens.push(Token::Param(positional));
            positional += 1;
        } else if "(),=*;".contains(c) {
            chars.next();
            tokens.push(Token::Symbol(c));
        } else {
            return Err(DbError::syntax(format!("syntax error at or near \"{c}\"")));
        }
    }

    Ok(tokens)
}

fn sql_comment_follows(chars: &std::iter::Peekable<std::str::Chars<'_>>) -> bool {
    let mut ahead = chars.clone();
    ahead.next();
    ahead.peek() == Some(&'-')
}

struct Parser<'p> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'p [Value],
}

impl Parser<'_> {
    fn statement(&mut self) -> Result<Statement, DbError> {
        let keyword = self.word()?.to_ascii_uppercase();
        match keyword.as_str() {
            "BEGIN" => {
                self.eat_any_keyword(&["TRANSACTION", "WORK"]);
                Ok(Statement::Begin)
            },
            "START" => {
                self.expect_keyword("TRANSACTION")?;
                Ok(Statement::Begin)
            },
            "COMMIT" | "END" => {
                self.eat_any_keyword(&["TRANSACTION", "WORK"]);
                Ok(Statement::Commit)
            },
            "ROLLBACK" | "ABORT" => {
                self.eat_any_keyword(&["TRANSACTION", "WORK"]);
                Ok(Statement::Rollback)
            },
            "SET" => self.set(),
            "RESET" => {
                if self.eat_keyword("ALL") {
                    Ok(Statement::ResetAll)
                } else {
                    let name = self.word()?.to_ascii_lowercase();
                    Ok(Statement::Reset(Setting::from_name(&name)?))
                }
            },
            "CREATE" => self.create_table(),
            "INSERT" => self.insert(),
            "UPDATE" => self.update(),
            "SELECT" => self.select(),
            other => Err(DbError::syntax(format!(
                "syntax error at or near \"{other}\""
            ))),
        }
    }

    fn set(&mut self) -> Result<Statement, DbError> {
        let local = self.eat_keyword("LOCAL");
        if !local {
            self.eat_keyword("SESSION");
        }
        let name = self.word()?.to_ascii_lowercase();
        let setting = Setting::from_name(&name)?;
        if !self.eat_symbol('=') {
            self.expect_keyword("TO")?;
        }

        let value = match self.next() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("DEFAULT") => SetValue::Default,
            Some(Token::Number(raw) | Token::Str(raw)) => {
                SetValue::Duration(parse_duration_setting(setting, &raw)?)
            },
            Some(Token::Param(index)) => match self.param(index)? {
                Value::Integer(ms) => {
                    SetValue::Duration(parse_duration_setting(setting, &ms.to_string())?)
                },
                Value::Text(raw) => SetValue::Duration(parse_duration_setting(setting, &raw)?),
                _ => {
                    return Err(DbError::new(
                        SqlState::InvalidParameterValue,
                        format!("invalid value for parameter \"{}\"", setting.name()),
                    ));
                },
            },
            _ => return Err(DbError::syntax("syntax error at end of input")),
        };

        Ok(Statement::Set {
            setting,
            value,
            local,
        })
    }

    fn create_table(&mut self) -> Result<Statement, DbError> {
        self.expect_keyword("TABLE")?;
        let if_not_exists = if self.eat_keyword("IF") {
            self.expect_keyword("NOT")?;
            self.expect_keyword("EXISTS")?;
            true
        } else {
            false
        };
        self.expect_table()?;
        // Column definitions are fixed by the store; skip them.
        while let Some(token) = self.peek() {
            if *token == Token::Symbol(';') {
                break;
            }
            self.pos += 1;
        }
        Ok(Statement::CreateTable { if_not_exists })
    }

    fn insert(&mut self) -> Result<Statement, DbError> {
        self.expect_keyword("INTO")?;
        self.expect_table()?;

        self.expect_symbol('(')?;
        let mut columns = vec![self.word()?.to_ascii_lowercase()];
        while self.eat_symbol(',') {
            columns.push(self.word()?.to_ascii_lowercase());
        }
        self.expect_symbol(')')?;

        self.expect_keyword("VALUES")?;
        self.expect_symbol('(')?;
        let mut values = vec![self.literal()?];
        while self.eat_symbol(',') {
            values.push(self.literal()?);
        }
        self.expect_symbol(')')?;

        if columns.len() != values.len() {
            return Err(DbError::syntax("INSERT has more target columns than expressions"));
        }

        let mut key = None;
        let mut num = None;
        for (column, value) in columns.iter().zip(values) {
            match column.as_str() {
                "name" => key = Some(text_value(value)?),
                "num" => num = Some(integer_value(value)?),
                other => {
                    return Err(DbError::new(
                        SqlState::FeatureNotSupported,
                        format!("column \"{other}\" cannot be written"),
                    ));
                },
            }
        }
        let key = key.ok_or_else(|| {
            DbError::new(SqlState::FeatureNotSupported, "INSERT must supply \"name\"")
        })?;
        let num = num.unwrap_or(0);

        let on_conflict = if self.eat_keyword("ON") {
            self.expect_keyword("CONFLICT")?;
            self.expect_symbol('(')?;
            self.expect_column("name")?;
            self.expect_symbol(')')?;
            self.expect_keyword("DO")?;
            self.expect_keyword("UPDATE")?;
            self.expect_keyword("SET")?;
            self.expect_column("num")?;
            self.expect_symbol('=')?;
            Some(integer_value(self.literal()?)?)
        } else {
            None
        };

        Ok(Statement::Insert {
            key,
            num,
            on_conflict,
        })
    }

    fn update(&mut self) -> Result<Statement, DbError> {
        self.expect_table()?;
        self.expect_keyword("SET")?;
        self.expect_column("num")?;
        self.expect_symbol('=')?;
        let num = integer_value(self.literal()?)?;
        let key = self.where_name()?;
        Ok(Statement::Update { key, num })
    }

    fn select(&mut self) -> Result<Statement, DbError> {
        let target = self.word()?.to_ascii_lowercase();
        match target.as_str() {
            "pg_sleep" => {
                self.expect_symbol('(')?;
                let seconds = match self.literal()? {
                    Value::Integer(i) => i as f64,
                    Value::Real(r) => r,
                    _ => return Err(DbError::syntax("pg_sleep expects a number of seconds")),
                };
                self.expect_symbol(')')?;
                let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
                Ok(Statement::Sleep(duration_from_millis_f64(seconds * 1_000.0)))
            },
            "count" => {
                self.expect_symbol('(')?;
                self.expect_symbol('*')?;
                self.expect_symbol(')')?;
                self.expect_keyword("FROM")?;
                let relation = self.word()?.to_ascii_lowercase();
                if relation != "pg_stat_activity" {
                    return Err(DbError::new(
                        SqlState::FeatureNotSupported,
                        format!("count(*) is only supported on pg_stat_activity, not \"{relation}\""),
                    ));
                }
                let user = if self.eat_keyword("WHERE") {
                    self.expect_column("usename")?;
                    self.expect_symbol('=')?;
                    Some(text_value(self.literal()?)?)
                } else {
                    None
                };
                Ok(Statement::CountSessions { user })
            },
            "num" => {
                self.expect_keyword("FROM")?;
                self.expect_table()?;
                let key = self.where_name()?;
                Ok(Statement::SelectNum { key })
            },
            other => Err(DbError::new(
                SqlState::FeatureNotSupported,
                format!("unsupported query target \"{other}\""),
            )),
        }
    }

    fn where_name(&mut self) -> Result<String, DbError> {
        self.expect_keyword("WHERE")?;
        self.expect_column("name")?;
        self.expect_symbol('=')?;
        text_value(self.literal()?)
    }

    fn expect_table(&mut self) -> Result<(), DbError> {
        let name = self.word()?.to_ascii_lowercase();
        if name == TABLE {
            Ok(())
        } else {
            Err(DbError::new(
                SqlState::UndefinedTable,
                format!("relation \"{name}\" does not exist"),
            ))
        }
    }

    fn expect_column(&mut self, column: &str) -> Result<(), DbError> {
        let name = self.word()?.to_ascii_lowercase();
        if name == column {
            Ok(())
        } else {
            Err(DbError::syntax(format!(
                "expected column \"{column}\", found \"{name}\""
            )))
        }
    }

    fn literal(&mut self) -> Result<Value, DbError> {
        match self.next() {
            Some(Token::Number(raw)) => {
                if let Ok(i) = raw.parse::<i64>() {
                    Ok(Value::Integer(i))
                } else {
                    raw.parse::<f64>()
                        .map(Value::Real)
                        .map_err(|_| DbError::syntax(format!("invalid number \"{raw}\"")))
                }
            },
            Some(Token::Str(text)) => Ok(Value::Text(text)),
            Some(Token::Param(index)) => self.param(index),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("NULL") => Ok(Value::Null),
            Some(other) => Err(DbError::syntax(format!(
                "syntax error at or near {other:?}"
            ))),
            None => Err(DbError::syntax("syntax error at end of input")),
        }
    }

    fn param(&self, index: usize) -> Result<Value, DbError> {
        self.params.get(index).cloned().ok_or_else(|| {
            DbError::new(
                SqlState::InvalidParameterValue,
                format!("there is no parameter ${}", index + 1),
            )
        })
    }

    fn word(&mut self) -> Result<String, DbError> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            Some(other) => Err(DbError::syntax(format!(
                "syntax error at or near {other:?}"
            ))),
            None => Err(DbError::syntax("syntax error at end of input")),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            },
            _ => false,
        }
    }

    fn eat_any_keyword(&mut self, keywords: &[&str]) {
        for keyword in keywords {
            if self.eat_keyword(keyword) {
                return;
            }
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), DbError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(DbError::syntax(format!("expected {keyword}")))
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<(), DbError> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(DbError::syntax(format!("expected \"{symbol}\"")))
        }
    }

    fn finish(&mut self) -> Result<(), DbError> {
        while self.eat_symbol(';') {}
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(DbError::syntax(format!(
                "syntax error at or near {token:?}"
            ))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

fn integer_value(value: Value) -> Result<i64, DbError> {
    match value {
        Value::Integer(i) => Ok(i),
        other => Err(DbError::new(
            SqlState::InvalidParameterValue,
            format!("invalid input syntax for type integer: {other:?}"),
        )),
    }
}

fn text_value(value: Value) -> Result<String, DbError> {
    match value {
        Value::Text(s) => Ok(s),
        other => Err(DbError::new(
            SqlState::InvalidParameterValue,
            format!("expected text, got {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_transaction_control() {
        assert_eq!(parse("BEGIN", &[]).unwrap(), Statement::Begin);
        assert_eq!(parse("start transaction;", &[]).unwrap(), Statement::Begin);
        assert_eq!(parse("COMMIT;", &[]).unwrap(), Statement::Commit);
        assert_eq!(parse("end", &[]).unwrap(), Statement::Commit);
        assert_eq!(parse("ROLLBACK", &[]).unwrap(), Statement::Rollback);
    }

    #[test]
    fn test_parse_timeout_directives() {
        assert_eq!(
            parse("SET lock_timeout=1500;", &[]).unwrap(),
            Statement::Set {
                setting: Setting::LockTimeout,
                value: SetValue::Duration(Duration::from_millis(1500)),
                local: false,
            }
        );
        assert_eq!(
            parse("SET LOCAL statement_timeout TO '2s'", &[]).unwrap(),
            Statement::Set {
                setting: Setting::StatementTimeout,
                value: SetValue::Duration(Duration::from_secs(2)),
                local: true,
            }
        );
        assert_eq!(
            parse("SET idle_in_transaction_session_timeout = DEFAULT", &[]).unwrap(),
            Statement::Set {
                setting: Setting::IdleInTransactionSessionTimeout,
                value: SetValue::Default,
                local: false,
            }
        );
    }

    #[test]
    fn test_parse_unknown_setting() {
        let err = parse("SET work_mem = 64", &[]).unwrap_err();
        assert_eq!(err.code, SqlState::UndefinedObject);
    }

    #[test]
    fn test_parse_negative_timeout_rejected() {
        let err = parse("SET lock_timeout = -1", &[]).unwrap_err();
        assert_eq!(err.code, SqlState::InvalidParameterValue);
    }

    #[test]
    fn test_parse_seed_upsert() {
        let stmt = parse(
            "INSERT INTO t(name, num) VALUES ('ian', 777) ON CONFLICT(name) DO UPDATE SET num = 777;",
            &[],
        )
        .unwrap();
        assert_eq!(
            stmt,
            Statement::Insert {
                key: "ian".to_string(),
                num: 777,
                on_conflict: Some(777),
            }
        );
    }

    #[test]
    fn test_parse_update_with_placeholders() {
        let expected = Statement::Update {
            key: "ian".to_string(),
            num: 2,
        };
        assert_eq!(
            parse("UPDATE t SET num=? WHERE name='ian';", &[Value::Integer(2)]).unwrap(),
            expected
        );
        assert_eq!(
            parse("UPDATE t SET num=$1 WHERE name='ian'", &[Value::Integer(2)]).unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_missing_parameter() {
        let err = parse("UPDATE t SET num=$1 WHERE name='ian'", &[]).unwrap_err();
        assert_eq!(err.code, SqlState::InvalidParameterValue);
    }

    #[test]
    fn test_parse_queries() {
        assert_eq!(
            parse("SELECT pg_sleep(3);", &[]).unwrap(),
            Statement::Sleep(Duration::from_secs(3))
        );
        assert_eq!(
            parse("SELECT pg_sleep(0.5)", &[]).unwrap(),
            Statement::Sleep(Duration::from_millis(500))
        );
        assert_eq!(
            parse(
                "SELECT count(*) FROM pg_stat_activity WHERE usename = 'postgres';",
                &[]
            )
            .unwrap(),
            Statement::CountSessions {
                user: Some("postgres".to_string())
            }
        );
        assert_eq!(
            parse("SELECT num FROM t WHERE name = 'ian'", &[]).unwrap(),
            Statement::SelectNum {
                key: "ian".to_string()
            }
        );
    }

    #[test]
    fn test_parse_create_table() {
        let stmt = parse(
            "CREATE TABLE IF NOT EXISTS t (id SERIAL PRIMARY KEY, name VARCHAR(64) UNIQUE, num INT);",
            &[],
        )
        .unwrap();
        assert_eq!(
            stmt,
            Statement::CreateTable {
                if_not_exists: true
            }
        );
    }

    #[test]
    fn test_parse_other_table_rejected() {
        let err = parse("UPDATE accounts SET num=1 WHERE name='ian'", &[]).unwrap_err();
        assert_eq!(err.code, SqlState::UndefinedTable);
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse("", &[]).unwrap_err().code, SqlState::SyntaxError);
        assert_eq!(parse("DROP TABLE t", &[]).unwrap_err().code, SqlState::SyntaxError);
        assert_eq!(
            parse("SELECT num FROM t WHERE name = 'ian' extra", &[])
                .unwrap_err()
                .code,
            SqlState::SyntaxError
        );
    }

    #[test]
    fn test_duration_units() {
        let s = Setting::LockTimeout;
        assert_eq!(parse_duration_setting(s, "0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration_setting(s, "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration_setting(s, "1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration_setting(s, "1min").unwrap(), Duration::from_secs(60));
        assert!(parse_duration_setting(s, "10 parsecs").is_err());
    }

    proptest! {
        #[test]
        fn prop_millisecond_directives_round_trip(ms in 0u32..=2_147_483u32) {
            let stmt = parse(&format!("SET statement_timeout={ms}"), &[]).unwrap();
            prop_assert_eq!(
                stmt,
                Statement::Set {
                    setting: Setting::StatementTimeout,
                    value: SetValue::Duration(Duration::from_millis(u64::from(ms))),
                    local: false,
                }
            );
        }

        #[test]
        fn prop_tokenizer_never_panics(input in ".{0,64}") {
            let _ = parse(&input, &[]);
        }
    }
}
