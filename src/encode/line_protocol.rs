use crate::metric::{FieldValue, Point};

/// Encodes points as line protocol, one line per point, in the given order.
pub fn encode_points(points: &[Point]) -> Vec<String> {
    points.iter().map(encode_point).collect()
}

// Format: <measurement>[,<tag_key>=<tag_value>...] <field_key>=<field_value>[,...] <timestamp_ns>
pub fn encode_point(point: &Point) -> String {
    let mut line = escape_measurement(point.measurement());

    // BTreeMap keeps tags sorted, which is also what the store prefers.
    for (key, value) in point.tags() {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    let fields: Vec<String> = point
        .fields()
        .iter()
        .map(|(key, value)| format!("{}={}", escape_key(key), encode_field_value(value)))
        .collect();
    line.push_str(&fields.join(","));

    line.push(' ');
    line.push_str(&point.timestamp().to_string());
    line
}

fn encode_field_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => v.to_string(),
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::UInteger(v) => format!("{}u", v),
        FieldValue::Boolean(v) => v.to_string(),
        FieldValue::String(v) => format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

// Tag keys, tag values and field keys share the same escaping rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
