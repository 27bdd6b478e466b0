//! Scalar and aggregate function registry.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

use super::value::{Value, ValueKind};
use crate::executor::{ExecuteError, ExecuteResult};
use crate::session::Context;

/// Built-in scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunc {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    DayOfYear,
    Substring,
    ArrayLength,
    IsBinary,
    /// Guess the programming language of a file from its path and content.
    Language,
    /// Parse content into a UAST via the session's analysis client.
    Uast,
    /// Filter a UAST with an XPath-like query via the analysis client.
    UastXpath,
    Lower,
    Upper,
    Length,
}

impl ScalarFunc {
    /// Look a function up by name, validating arity. None means unknown name;
    /// Some(Err) means known name, wrong number of arguments.
    pub fn lookup(name: &str, arity: usize) -> Option<Result<ScalarFunc, (usize, usize)>> {
        use ScalarFunc::*;
        // (func, min arity, max arity)
        let (func, min, max) = match name.to_ascii_lowercase().as_str() {
            "year" => (Year, 1, 1),
            "month" => (Month, 1, 1),
            "day" => (Day, 1, 1),
            "hour" => (Hour, 1, 1),
            "minute" => (Minute, 1, 1),
            "second" => (Second, 1, 1),
            "dayofyear" => (DayOfYear, 1, 1),
            "substring" | "substr" => (Substring, 2, 3),
            "array_length" => (ArrayLength, 1, 1),
            "is_binary" => (IsBinary, 1, 1),
            "language" => (Language, 1, 2),
            "uast" => (Uast, 1, 2),
            "uast_xpath" => (UastXpath, 2, 2),
            "lower" => (Lower, 1, 1),
            "upper" => (Upper, 1, 1),
            "length" => (Length, 1, 1),
            _ => return None,
        };
        if arity < min || arity > max {
            Some(Err((min, max)))
        } else {
            Some(Ok(func))
        }
    }

    pub fn result_kind(&self) -> ValueKind {
        use ScalarFunc::*;
        match self {
            Year | Month | Day | Hour | Minute | Second | DayOfYear => ValueKind::Int32,
            Substring | Language | Lower | Upper => ValueKind::Text,
            ArrayLength | Length => ValueKind::Int32,
            IsBinary => ValueKind::Bool,
            Uast | UastXpath => ValueKind::Json,
        }
    }

    /// Evaluate over already-evaluated arguments. NULL inputs yield NULL.
    pub fn eval(&self, ctx: &Context, args: &[Value]) -> ExecuteResult<Value> {
        use ScalarFunc::*;

        if args.iter().any(Value::is_null) {
            return Ok(Value::Null);
        }

        match self {
            Year => date_part(&args[0], |t| t.year()),
            Month => date_part(&args[0], |t| t.month() as i32),
            Day => date_part(&args[0], |t| t.day() as i32),
            Hour => date_part(&args[0], |t| t.hour() as i32),
            Minute => date_part(&args[0], |t| t.minute() as i32),
            Second => date_part(&args[0], |t| t.second() as i32),
            DayOfYear => date_part(&args[0], |t| t.ordinal() as i32),

            Substring => {
                let s = args[0].to_string();
                let chars: Vec<char> = s.chars().collect();
                // SQL substring is 1-based; a non-positive start clamps to 1.
                let start = args[1].as_i64().unwrap_or(1).max(1) as usize - 1;
                let len = match args.get(2) {
                    Some(v) => v.as_i64().unwrap_or(0).max(0) as usize,
                    None => chars.len().saturating_sub(start),
                };
                let out: String = chars.iter().skip(start).take(len).collect();
                Ok(Value::Text(out))
            }

            ArrayLength => match &args[0] {
                Value::Array(items) => Ok(Value::Int32(items.len() as i32)),
                other => Err(ExecuteError::TypeMismatch(format!(
                    "array_length over non-array: {}",
                    other
                ))),
            },

            IsBinary => {
                let bytes: &[u8] = match &args[0] {
                    Value::Blob(b) => b,
                    Value::Text(s) => s.as_bytes(),
                    other => {
                        return Err(ExecuteError::TypeMismatch(format!(
                            "is_binary over non-blob: {}",
                            other
                        )))
                    }
                };
                // Same heuristic git uses: a NUL in the first 8000 bytes.
                let probe = &bytes[..bytes.len().min(8000)];
                Ok(Value::Bool(probe.contains(&0)))
            }

            Language => {
                let path = args[0].to_string();
                Ok(match language_of(&path) {
                    Some(lang) => Value::text(lang),
                    None => Value::Null,
                })
            }

            Uast => {
                let content = match &args[0] {
                    Value::Blob(b) => b.clone(),
                    other => other.to_string().into_bytes(),
                };
                let lang = args.get(1).map(|v| v.to_string()).unwrap_or_default();
                let out = ctx.analysis_parse(&lang, &content)?;
                Ok(Value::Json(out))
            }

            UastXpath => {
                let tree = args[0].to_string();
                let query = args[1].to_string();
                let out = ctx.analysis_filter(&tree, &query)?;
                Ok(Value::Json(out))
            }

            Lower => Ok(Value::Text(args[0].to_string().to_lowercase())),
            Upper => Ok(Value::Text(args[0].to_string().to_uppercase())),
            Length => Ok(Value::Int32(args[0].to_string().len() as i32)),
        }
    }
}

impl fmt::Display for ScalarFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarFunc::Year => "year",
            ScalarFunc::Month => "month",
            ScalarFunc::Day => "day",
            ScalarFunc::Hour => "hour",
            ScalarFunc::Minute => "minute",
            ScalarFunc::Second => "second",
            ScalarFunc::DayOfYear => "dayofyear",
            ScalarFunc::Substring => "substring",
            ScalarFunc::ArrayLength => "array_length",
            ScalarFunc::IsBinary => "is_binary",
            ScalarFunc::Language => "language",
            ScalarFunc::Uast => "uast",
            ScalarFunc::UastXpath => "uast_xpath",
            ScalarFunc::Lower => "lower",
            ScalarFunc::Upper => "upper",
            ScalarFunc::Length => "length",
        };
        write!(f, "{}", name)
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn lookup(name: &str) -> Option<AggFunc> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "avg" => Some(AggFunc::Avg),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            _ => None,
        }
    }

    pub fn result_kind(&self, arg: Option<&super::expr::Expr>) -> ValueKind {
        match self {
            AggFunc::Count => ValueKind::Int64,
            AggFunc::Sum | AggFunc::Avg => ValueKind::Double,
            AggFunc::Min | AggFunc::Max => arg.map(|e| e.result_kind()).unwrap_or(ValueKind::Text),
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        };
        write!(f, "{}", name)
    }
}

fn date_part(v: &Value, part: impl Fn(&DateTime<Utc>) -> i32) -> ExecuteResult<Value> {
    match v {
        Value::Timestamp(t) => Ok(Value::Int32(part(t))),
        Value::Text(s) => match parse_timestamp(s) {
            Some(t) => Ok(Value::Int32(part(&t))),
            None => Ok(Value::Null),
        },
        _ => Ok(Value::Null),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if fmt == "%Y-%m-%d" {
            if let Ok(d) = chrono::NaiveDate::parse_from_str(s, fmt) {
                return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
            }
        }
    }
    None
}

/// Extension-based language detection for the `language` function.
fn language_of(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    let lang = match ext.to_ascii_lowercase().as_str() {
        "rs" => "Rust",
        "go" => "Go",
        "py" => "Python",
        "rb" => "Ruby",
        "js" => "JavaScript",
        "ts" => "TypeScript",
        "java" => "Java",
        "c" | "h" => "C",
        "cc" | "cpp" | "hpp" | "cxx" => "C++",
        "cs" => "C#",
        "php" => "PHP",
        "sh" | "bash" => "Shell",
        "md" | "markdown" => "Markdown",
        "json" => "JSON",
        "yml" | "yaml" => "YAML",
        "toml" => "TOML",
        "sql" => "SQL",
        "html" | "htm" => "HTML",
        "css" => "CSS",
        _ => return None,
    };
    Some(lang)
}
