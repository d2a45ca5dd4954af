use std::collections::BTreeMap;

/// A scalar field value as it travels from a source query to a destination
/// write. The variant decides the line-protocol rendering, which is what
/// preserves the value's type across the copy.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    /// Builds a value from a JSON scalar as returned by `/query`. Null and
    /// non-scalar values yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<FieldValue> {
        match value {
            serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(FieldValue::Integer(i))
                } else {
                    n.as_f64().filter(|f| f.is_finite()).map(FieldValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(FieldValue::Text(s.clone())),
            _ => None,
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            // A bare number without suffix is a float in line protocol.
            FieldValue::Float(f) => out.push_str(&f.to_string()),
            FieldValue::Integer(i) => {
                out.push_str(&i.to_string());
                out.push('i');
            }
            FieldValue::Boolean(true) => out.push('t'),
            FieldValue::Boolean(false) => out.push('f'),
            FieldValue::Text(s) => {
                out.push('"');
                for c in s.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        c => out.push(c),
                    }
                }
                out.push('"');
            }
        }
    }
}

/// One row of a single-field query: the timestamp, the tag set, and the one
/// field's value. The unit flowing through the whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub timestamp_ns: i64,
    pub tags: BTreeMap<String, String>,
    pub field: String,
    pub value: FieldValue,
}

/// Encodes a batch of points for one measurement into a line-protocol body
/// with nanosecond timestamps. Tags render in lexicographic order (the
/// `BTreeMap` ordering).
pub fn encode_batch(measurement: &str, points: &[Point]) -> String {
    let mut body = String::with_capacity(points.len() * 64);
    for point in points {
        if !body.is_empty() {
            body.push('\n');
        }
        encode_point(measurement, point, &mut body);
    }
    body
}

fn encode_point(measurement: &str, point: &Point, out: &mut String) {
    escape_measurement(measurement, out);
    for (key, value) in &point.tags {
        out.push(',');
        escape_tag(key, out);
        out.push('=');
        escape_tag(value, out);
    }
    out.push(' ');
    escape_tag(&point.field, out);
    out.push('=');
    point.value.render(out);
    out.push(' ');
    out.push_str(&point.timestamp_ns.to_string());
}

fn escape_measurement(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            ',' => out.push_str("\\,"),
            ' ' => out.push_str("\\ "),
            c => out.push(c),
        }
    }
}

// Tag keys, tag values and field keys share one escaping rule.
fn escape_tag(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            ',' => out.push_str("\\,"),
            '=' => out.push_str("\\="),
            ' ' => out.push_str("\\ "),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64, tags: &[(&str, &str)], field: &str, value: FieldValue) -> Point {
        Point {
            timestamp_ns: ts,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            field: field.to_string(),
            value,
        }
    }

    #[test]
    fn float_renders_bare() {
        let p = point(1_700_000_000_000_000_000, &[], "temperature", FieldValue::Float(21.5));
        assert_eq!(
            encode_batch("weather", &[p]),
            "weather temperature=21.5 1700000000000000000"
        );
    }

    #[test]
    fn integer_gets_suffix() {
        let p = point(10, &[], "count", FieldValue::Integer(42));
        assert_eq!(encode_batch("weather", &[p]), "weather count=42i 10");
    }

    #[test]
    fn booleans_render_t_f() {
        let p = point(10, &[], "raining", FieldValue::Boolean(true));
        assert_eq!(encode_batch("weather", &[p]), "weather raining=t 10");
        let p = point(10, &[], "raining", FieldValue::Boolean(false));
        assert_eq!(encode_batch("weather", &[p]), "weather raining=f 10");
    }

    #[test]
    fn strings_quoted_and_escaped() {
        let p = point(
            10,
            &[],
            "note",
            FieldValue::Text(r#"say "hi" \ bye"#.to_string()),
        );
        assert_eq!(
            encode_batch("weather", &[p]),
            r#"weather note="say \"hi\" \\ bye" 10"#
        );
    }

    #[test]
    fn tags_sorted_lexicographically() {
        let p = point(
            10,
            &[("zone", "b"), ("city", "madrid"), ("station", "s1")],
            "temperature",
            FieldValue::Float(1.0),
        );
        assert_eq!(
            encode_batch("weather", &[p]),
            "weather,city=madrid,station=s1,zone=b temperature=1 10"
        );
    }

    #[test]
    fn special_characters_escaped() {
        let p = point(
            10,
            &[("my tag", "a,b=c")],
            "field key",
            FieldValue::Float(1.0),
        );
        assert_eq!(
            encode_batch("my,meas urement", &[p]),
            r"my\,meas\ urement,my\ tag=a\,b\=c field\ key=1 10"
        );
    }

    #[test]
    fn batch_joins_with_newlines() {
        let points = vec![
            point(1, &[], "v", FieldValue::Integer(1)),
            point(2, &[], "v", FieldValue::Integer(2)),
        ];
        assert_eq!(encode_batch("m", &points), "m v=1i 1\nm v=2i 2");
    }

    #[test]
    fn from_json_maps_types() {
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(1.5)),
            Some(FieldValue::Float(1.5))
        );
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(7)),
            Some(FieldValue::Integer(7))
        );
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(true)),
            Some(FieldValue::Boolean(true))
        );
        assert_eq!(
            FieldValue::from_json(&serde_json::json!("x")),
            Some(FieldValue::Text("x".to_string()))
        );
        assert_eq!(FieldValue::from_json(&serde_json::Value::Null), None);
    }
}
