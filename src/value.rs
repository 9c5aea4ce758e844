//! Column value conversions.
//!
//! [`SqlValue`] is the typed scalar carried by decoded binlog events. Values
//! convert out of the driver's wire representation (including binlog row
//! images) and render either as SQL literals for the journal or back into
//! driver values for parameterized direct apply.

use mysql_async::consts::ColumnType;
use mysql_async::Value;

/// A typed column scalar decoded from a binlog row image.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Arbitrary-precision decimal, kept as its exact decimal string.
    Decimal(String),
    Text(String),
    Binary(Vec<u8>),
    /// `YYYY-MM-DD` date or `YYYY-MM-DD HH:MM:SS[.ffffff]` datetime, UTC.
    DateTime(String),
    /// `[-]HH:MM:SS[.ffffff]` time-of-day or interval.
    Time(String),
}

impl SqlValue {
    /// Convert a driver value, using the binlog column type (when known) to
    /// tell DECIMAL bytes apart from text and to render DATE without a time
    /// part.
    pub fn from_mysql(value: &Value, column_type: Option<ColumnType>) -> Self {
        match value {
            Value::NULL => SqlValue::Null,
            Value::Int(i) => SqlValue::Int(*i),
            Value::UInt(u) => SqlValue::UInt(*u),
            Value::Float(f) => SqlValue::Float(f64::from(*f)),
            Value::Double(d) => SqlValue::Float(*d),
            Value::Bytes(bytes) => match column_type {
                Some(ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL) => {
                    SqlValue::Decimal(String::from_utf8_lossy(bytes).into_owned())
                }
                _ => match String::from_utf8(bytes.clone()) {
                    Ok(text) => SqlValue::Text(text),
                    Err(_) => SqlValue::Binary(bytes.clone()),
                },
            },
            Value::Date(year, month, day, hour, minute, second, micros) => {
                let date_only = matches!(
                    column_type,
                    Some(ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE)
                );
                if date_only {
                    SqlValue::DateTime(format!("{year:04}-{month:02}-{day:02}"))
                } else if *micros > 0 {
                    SqlValue::DateTime(format!(
                        "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                    ))
                } else {
                    SqlValue::DateTime(format!(
                        "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                    ))
                }
            }
            Value::Time(negative, days, hours, minutes, seconds, micros) => {
                let sign = if *negative { "-" } else { "" };
                let total_hours = u32::from(*hours) + days * 24;
                if *micros > 0 {
                    SqlValue::Time(format!(
                        "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
                    ))
                } else {
                    SqlValue::Time(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}"))
                }
            }
        }
    }

    /// Render as a SQL literal for the journal.
    ///
    /// Numbers and decimals print bare, NULL prints as `NULL`, binary as a
    /// hex literal, and everything else as a quoted, escaped string.
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::UInt(u) => u.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Decimal(d) => d.clone(),
            SqlValue::Text(s) => format!("'{}'", escape_string(s)),
            SqlValue::Binary(bytes) => {
                let mut literal = String::with_capacity(bytes.len() * 2 + 3);
                literal.push_str("X'");
                for byte in bytes {
                    literal.push_str(&format!("{byte:02X}"));
                }
                literal.push('\'');
                literal
            }
            SqlValue::DateTime(s) | SqlValue::Time(s) => format!("'{s}'"),
        }
    }

    /// Convert back into a driver value for parameterized execution.
    pub fn to_mysql(&self) -> Value {
        match self {
            SqlValue::Null => Value::NULL,
            SqlValue::Int(i) => Value::Int(*i),
            SqlValue::UInt(u) => Value::UInt(*u),
            SqlValue::Float(f) => Value::Double(*f),
            SqlValue::Decimal(s) | SqlValue::Text(s) | SqlValue::DateTime(s) | SqlValue::Time(s) => {
                Value::Bytes(s.clone().into_bytes())
            }
            SqlValue::Binary(bytes) => Value::Bytes(bytes.clone()),
        }
    }
}

/// Escape a string for inclusion in a single-quoted SQL literal.
///
/// Covers backslash, quote, newline, carriage return and tab.
pub fn escape_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Render a driver value as a resumable progress cursor string.
///
/// The snapshot engine stores the last copied primary-key value as text and
/// binds it back into the seek query on resume; MySQL coerces the comparison
/// to the declared column type.
pub fn cursor_string(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Date(..) | Value::Time(..) => {
            Some(SqlValue::from_mysql(value, None).to_literal().replace('\'', ""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_null_and_numbers() {
        assert_eq!(SqlValue::Null.to_literal(), "NULL");
        assert_eq!(SqlValue::Int(-42).to_literal(), "-42");
        assert_eq!(SqlValue::UInt(42).to_literal(), "42");
        assert_eq!(SqlValue::Decimal("123.450".into()).to_literal(), "123.450");
    }

    #[test]
    fn literal_string_escaping() {
        let v = SqlValue::Text("it's a \\ test\nline\r\ttab".into());
        assert_eq!(v.to_literal(), "'it\\'s a \\\\ test\\nline\\r\\ttab'");
    }

    #[test]
    fn literal_binary_hex() {
        let v = SqlValue::Binary(vec![0xDE, 0xAD, 0x00]);
        assert_eq!(v.to_literal(), "X'DEAD00'");
    }

    #[test]
    fn literal_temporal_quoted() {
        let v = SqlValue::DateTime("2026-03-01 10:50:12".into());
        assert_eq!(v.to_literal(), "'2026-03-01 10:50:12'");
    }

    #[test]
    fn decimal_detected_from_column_type() {
        let raw = Value::Bytes(b"99.95".to_vec());
        let decimal = SqlValue::from_mysql(&raw, Some(ColumnType::MYSQL_TYPE_NEWDECIMAL));
        assert_eq!(decimal, SqlValue::Decimal("99.95".into()));
        // Without the column type, bytes stay textual.
        let text = SqlValue::from_mysql(&raw, None);
        assert_eq!(text, SqlValue::Text("99.95".into()));
    }

    #[test]
    fn date_renders_without_time_part() {
        let raw = Value::Date(2026, 3, 1, 0, 0, 0, 0);
        let v = SqlValue::from_mysql(&raw, Some(ColumnType::MYSQL_TYPE_DATE));
        assert_eq!(v, SqlValue::DateTime("2026-03-01".into()));
    }

    #[test]
    fn datetime_keeps_microseconds() {
        let raw = Value::Date(2026, 3, 1, 10, 50, 12, 123456);
        let v = SqlValue::from_mysql(&raw, Some(ColumnType::MYSQL_TYPE_DATETIME));
        assert_eq!(v, SqlValue::DateTime("2026-03-01 10:50:12.123456".into()));
    }

    #[test]
    fn negative_time_with_days() {
        let raw = Value::Time(true, 1, 2, 30, 0, 0);
        let v = SqlValue::from_mysql(&raw, None);
        assert_eq!(v, SqlValue::Time("-26:30:00".into()));
    }

    #[test]
    fn non_utf8_bytes_become_binary() {
        let raw = Value::Bytes(vec![0xFF, 0xFE]);
        let v = SqlValue::from_mysql(&raw, None);
        assert_eq!(v, SqlValue::Binary(vec![0xFF, 0xFE]));
    }

    #[test]
    fn round_trip_to_mysql_params() {
        assert_eq!(SqlValue::Int(7).to_mysql(), Value::Int(7));
        assert_eq!(
            SqlValue::Text("abc".into()).to_mysql(),
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(SqlValue::Null.to_mysql(), Value::NULL);
    }

    #[test]
    fn cursor_string_for_common_pk_types() {
        assert_eq!(cursor_string(&Value::Int(42)).as_deref(), Some("42"));
        assert_eq!(
            cursor_string(&Value::Bytes(b"user-9".to_vec())).as_deref(),
            Some("user-9")
        );
        assert_eq!(cursor_string(&Value::NULL), None);
    }
}
