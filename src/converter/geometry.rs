use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::{Circle, Point, Segment, Value};

fn parse_float(s: &str) -> Option<f64> {
    s.trim().parse().ok()
}

fn strip_delims<'a>(s: &'a str, open: char, close: char) -> Option<&'a str> {
    s.trim().strip_prefix(open)?.strip_suffix(close)
}

/// `(x,y)`
pub(crate) fn parse_point(s: &str) -> Option<Point> {
    let inner = strip_delims(s, '(', ')')?;
    let (x, y) = inner.split_once(',')?;
    Some(Point::new(parse_float(x)?, parse_float(y)?))
}

/// `<(x,y),r>`
pub(crate) fn parse_circle(s: &str) -> Option<Circle> {
    let inner = strip_delims(s, '<', '>')?;
    let (center, radius) = inner.rsplit_once(',')?;
    Some(Circle::new(parse_point(center)?, parse_float(radius)?))
}

/// `[(x1,y1),(x2,y2)]`
pub(crate) fn parse_segment(s: &str) -> Option<Segment> {
    let inner = strip_delims(s, '[', ']')?;
    let split = inner.find(')')? + 1;
    let (start, rest) = inner.split_at(split);
    let end = rest.trim_start().strip_prefix(',')?;
    Some(Segment::new(parse_point(start)?, parse_point(end)?))
}

macro_rules! geometry_converter {
    ($(#[$doc:meta])* $name:ident, $parse:ident, $variant:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $name;

        impl Converter for $name {
            fn to_native(
                &self,
                data: Option<&str>,
                type_name: &str,
                _registry: &ConverterRegistry,
            ) -> Result<Value> {
                match data {
                    None => Ok(Value::Null),
                    Some(s) => $parse(s)
                        .map(Value::$variant)
                        .ok_or_else(|| Error::conversion(type_name, s, concat!("not a ", $label))),
                }
            }

            fn to_wire(
                &self,
                value: &Value,
                type_name: &str,
                _registry: &ConverterRegistry,
            ) -> Result<Option<String>> {
                match value {
                    Value::Null => Ok(None),
                    Value::$variant(v) => Ok(Some(v.to_string())),
                    other => Err(unexpected_value(type_name, other)),
                }
            }
        }
    };
}

geometry_converter!(
    /// `point`
    PointConverter, parse_point, Point, "point"
);
geometry_converter!(
    /// `circle`
    CircleConverter, parse_circle, Circle, "circle"
);
geometry_converter!(
    /// `lseg`
    SegmentConverter, parse_segment, Segment, "segment"
);
