//! Native value model.
//!
//! Every converter turns a wire string into one of these variants and back.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime};

use crate::entity::Entity;

/// A native value produced by (or fed to) a converter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary precision decimal kept as its canonical text.
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Interval(Interval),
    Point(Point),
    Circle(Circle),
    Segment(Segment),
    Json(serde_json::Value),
    HStore(BTreeMap<String, Option<String>>),
    LTree(Vec<String>),
    NumberRange(Range<Number>),
    TimestampRange(Range<NaiveDateTime>),
    Array(Vec<Value>),
    /// A composite row, keyed by field name.
    Row(BTreeMap<String, Value>),
    Entity(Box<Entity>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) | Value::Numeric(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Short variant name, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Numeric(_) => "numeric",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Interval(_) => "interval",
            Value::Point(_) => "point",
            Value::Circle(_) => "circle",
            Value::Segment(_) => "segment",
            Value::Json(_) => "json",
            Value::HStore(_) => "hstore",
            Value::LTree(_) => "ltree",
            Value::NumberRange(_) => "number range",
            Value::TimestampRange(_) => "timestamp range",
            Value::Array(_) => "array",
            Value::Row(_) => "row",
            Value::Entity(_) => "entity",
        }
    }

    /// The database type a value is bound as when no explicit type is given.
    ///
    /// Returns `None` for values whose type cannot be inferred (null, rows,
    /// arrays holding only nulls are bound as `text[]`).
    pub fn natural_type(&self) -> Option<String> {
        let name = match self {
            Value::Null | Value::Row(_) => return None,
            Value::Bool(_) => "bool",
            Value::Int(_) => "int8",
            Value::Float(_) => "float8",
            Value::Numeric(_) => "numeric",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytea",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Interval(_) => "interval",
            Value::Point(_) => "point",
            Value::Circle(_) => "circle",
            Value::Segment(_) => "lseg",
            Value::Json(_) => "jsonb",
            Value::HStore(_) => "hstore",
            Value::LTree(_) => "ltree",
            Value::NumberRange(_) => "numrange",
            Value::TimestampRange(_) => "tsrange",
            Value::Entity(e) => return Some(e.kind().to_string()),
            Value::Array(items) => {
                let inner = items
                    .iter()
                    .find(|v| !v.is_null())
                    .and_then(Value::natural_type)
                    .unwrap_or_else(|| "text".to_string());
                return Some(format!("{}[]", inner));
            }
        };
        Some(name.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Point> for Value {
    fn from(v: Point) -> Self {
        Value::Point(v)
    }
}

impl From<Entity> for Value {
    fn from(v: Entity) -> Self {
        Value::Entity(Box::new(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Numbers
// ============================================================================

/// A range bound for numeric ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
    /// Decimal text that an `f64` would not reproduce, kept as the server
    /// wrote it.
    Decimal(String),
}

impl Number {
    pub fn parse(s: &str) -> Option<Number> {
        let s = s.trim();
        if let Ok(i) = s.parse::<i64>() {
            return Some(Number::Int(i));
        }
        // Rules out `inf` and `NaN`, which f64 would accept.
        if !s.bytes().all(|b| b.is_ascii_digit() || b"+-.eE".contains(&b)) {
            return None;
        }
        let float = s.parse::<f64>().ok()?;
        if float.is_finite() && float.to_string() == s {
            Some(Number::Float(float))
        } else {
            Some(Number::Decimal(s.to_string()))
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Float(v) => write!(f, "{}", v),
            Number::Decimal(d) => f.write_str(d),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

// ============================================================================
// Ranges
// ============================================================================

/// A range with independently tracked boundary inclusivity.
///
/// `None` bounds are unbounded (`[1,)`).
#[derive(Debug, Clone, PartialEq)]
pub struct Range<T> {
    pub lower: Option<T>,
    pub upper: Option<T>,
    pub lower_inclusive: bool,
    pub upper_inclusive: bool,
}

impl<T> Range<T> {
    pub fn new(lower: T, upper: T, lower_inclusive: bool, upper_inclusive: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_inclusive,
            upper_inclusive,
        }
    }

    pub fn unbounded(
        lower: Option<T>,
        upper: Option<T>,
        lower_inclusive: bool,
        upper_inclusive: bool,
    ) -> Self {
        Self {
            lower,
            upper,
            lower_inclusive,
            upper_inclusive,
        }
    }
}

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

// `{}` on f64 prints the shortest string that parses back to the same bits.
impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub center: Point,
    pub radius: f64,
}

impl Circle {
    pub fn new(center: Point, radius: f64) -> Self {
        Self { center, radius }
    }
}

impl fmt::Display for Circle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}>", self.center, self.radius)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

// ============================================================================
// Interval
// ============================================================================

/// A time span stored the way the server stores it: months, days and
/// microseconds are independent quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

pub(crate) const MICROS_PER_SECOND: i64 = 1_000_000;
pub(crate) const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
pub(crate) const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;

impl Interval {
    pub fn new(months: i32, days: i32, microseconds: i64) -> Self {
        Self {
            months,
            days,
            microseconds,
        }
    }

    pub fn from_parts(
        years: i32,
        months: i32,
        days: i32,
        hours: i64,
        minutes: i64,
        seconds: i64,
        micros: i64,
    ) -> Self {
        Self {
            months: years * 12 + months,
            days,
            microseconds: hours * MICROS_PER_HOUR
                + minutes * MICROS_PER_MINUTE
                + seconds * MICROS_PER_SECOND
                + micros,
        }
    }

    pub fn years(&self) -> i32 {
        self.months / 12
    }
}

/// Renders the server's default (`postgres`) interval style, e.g.
/// `1 year 2 mons 3 days 04:05:06.5`.
impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        let years = self.months / 12;
        let months = self.months % 12;

        if years != 0 {
            parts.push(format!("{} year{}", years, plural(years as i64)));
        }
        if months != 0 {
            parts.push(format!("{} mon{}", months, plural(months as i64)));
        }
        if self.days != 0 {
            parts.push(format!("{} day{}", self.days, plural(self.days as i64)));
        }
        if self.microseconds != 0 || parts.is_empty() {
            let sign = if self.microseconds < 0 { "-" } else { "" };
            let total = self.microseconds.unsigned_abs();
            let hours = total / MICROS_PER_HOUR as u64;
            let minutes = (total % MICROS_PER_HOUR as u64) / MICROS_PER_MINUTE as u64;
            let seconds = (total % MICROS_PER_MINUTE as u64) / MICROS_PER_SECOND as u64;
            let micros = total % MICROS_PER_SECOND as u64;

            let mut time = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
            if micros != 0 {
                let frac = format!("{:06}", micros);
                time.push('.');
                time.push_str(frac.trim_end_matches('0'));
            }
            parts.push(time);
        }

        f.write_str(&parts.join(" "))
    }
}

fn plural(n: i64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_types() {
        assert_eq!(Value::Int(1).natural_type().as_deref(), Some("int8"));
        assert_eq!(Value::Bool(true).natural_type().as_deref(), Some("bool"));
        assert_eq!(
            Value::Array(vec![Value::Null, Value::Int(3)]).natural_type().as_deref(),
            Some("int8[]")
        );
        assert_eq!(
            Value::Array(vec![]).natural_type().as_deref(),
            Some("text[]")
        );
        assert_eq!(Value::Null.natural_type(), None);
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_string()));
    }

    #[test]
    fn test_number_parse() {
        assert_eq!(Number::parse("-5"), Some(Number::Int(-5)));
        assert_eq!(Number::parse("4.5"), Some(Number::Float(4.5)));
        assert_eq!(Number::parse("abc"), None);
        assert_eq!(Number::parse("NaN"), None);
        assert_eq!(Number::parse("inf"), None);
        assert_eq!(
            Number::parse("0.12345678901234567890123"),
            Some(Number::Decimal("0.12345678901234567890123".to_string()))
        );
        assert_eq!(Number::parse("2.50"), Some(Number::Decimal("2.50".to_string())));
    }

    #[test]
    fn test_interval_display() {
        assert_eq!(
            Interval::from_parts(1, 2, 3, 4, 5, 6, 500_000).to_string(),
            "1 year 2 mons 3 days 04:05:06.5"
        );
        assert_eq!(Interval::default().to_string(), "00:00:00");
        assert_eq!(Interval::new(0, -1, -MICROS_PER_HOUR).to_string(), "-1 days -01:00:00");
    }

    #[test]
    fn test_geometry_display_keeps_precision() {
        let p = Point::new(0.1 + 0.2, -1.0 / 3.0);
        let text = p.to_string();
        let inner = text.trim_start_matches('(').trim_end_matches(')');
        let (x, y) = inner.split_once(',').unwrap();
        assert_eq!(x.parse::<f64>().unwrap(), p.x);
        assert_eq!(y.parse::<f64>().unwrap(), p.y);
    }
}
