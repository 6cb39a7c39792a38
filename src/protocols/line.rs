//! InfluxDB line protocol encoding.
//!
//! `measurement[,tag=value...] field=value[,field=value...] timestamp`
//!
//! Measurement names escape commas and spaces; tag keys, tag values and field
//! keys additionally escape `=`. String field values are double quoted with
//! `"` and `\` escaped. Integers carry an `i` suffix, unsigned integers a `u`.

use crate::metric::{FieldValue, Metric, TagMap};
use std::fmt::Write;

#[inline]
fn escape_into(s: &str, specials: &[char], buf: &mut String) {
    for c in s.chars() {
        if specials.contains(&c) {
            buf.push('\\');
        }
        buf.push(c);
    }
}

const MEASUREMENT: &[char] = &[',', ' '];
const KEY: &[char] = &[',', '=', ' '];

#[inline]
fn fmt_tags(tags: &TagMap, s: &mut String) {
    for &(ref k, ref v) in tags.iter() {
        if k.is_empty() || v.is_empty() {
            continue;
        }
        s.push(',');
        escape_into(k, KEY, s);
        s.push('=');
        escape_into(v, KEY, s);
    }
}

#[inline]
fn fmt_value(value: &FieldValue, s: &mut String) {
    // writing into a String cannot fail
    let _ = match *value {
        FieldValue::Int(i) => write!(s, "{}i", i),
        FieldValue::UInt(u) => write!(s, "{}u", u),
        FieldValue::Float(f) => write!(s, "{}", f),
        FieldValue::Bool(b) => write!(s, "{}", b),
        FieldValue::Str(ref v) => {
            s.push('"');
            for c in v.chars() {
                if c == '"' || c == '\\' {
                    s.push('\\');
                }
                s.push(c);
            }
            s.push('"');
            Ok(())
        }
    };
}

/// Append the line for `metric`, newline terminated, to `buf`. Non-finite
/// float fields are omitted. Returns false, leaving `buf` untouched, when no
/// field remains to write.
///
/// # Examples
///
/// ```
/// use tally::metric::Metric;
/// use tally::protocols::line;
///
/// let m = Metric::new("cpu").overlay_tag("host", "a b").field("idle", 0.5).time(10);
/// let mut buf = String::new();
/// assert!(line::write_metric(&m, &mut buf));
/// assert_eq!("cpu,host=a\\ b idle=0.5 10\n", buf);
/// ```
pub fn write_metric(metric: &Metric, buf: &mut String) -> bool {
    let mark = buf.len();
    escape_into(metric.name(), MEASUREMENT, buf);
    fmt_tags(metric.tags(), buf);
    let mut sep = ' ';
    for (key, value) in metric.fields() {
        if value.is_non_finite() {
            continue;
        }
        buf.push(sep);
        sep = ',';
        escape_into(key, KEY, buf);
        buf.push('=');
        fmt_value(value, buf);
    }
    if sep == ' ' {
        buf.truncate(mark);
        return false;
    }
    let _ = writeln!(buf, " {}", metric.timestamp());
    true
}

/// The line for `metric`, if it has any writable field.
pub fn to_line(metric: &Metric) -> Option<String> {
    let mut buf = String::with_capacity(128);
    if write_metric(metric, &mut buf) {
        Some(buf)
    } else {
        None
    }
}
