//! Canonical JSON rendering.
//!
//! Object keys are sorted lexicographically (by UTF-8 bytes), arrays keep
//! their order, no insignificant whitespace is emitted, and integral floats
//! render without a fractional part. Two values that are equal modulo key
//! order render to identical strings, which is what makes seal hashes
//! independent of how a document was assembled.

use serde::Serialize;
use serde_json::{Number, Value};
use thiserror::Error;

/// Maximum nesting depth accepted before rendering is refused.
///
/// `serde_json::Value` trees cannot be cyclic, so runaway nesting is the only
/// unbounded structure left to reject.
pub const MAX_DEPTH: usize = 128;

/// Largest integer an IEEE-754 double represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CanonicalError {
    #[error("value nests deeper than {limit} levels (self-referential input?)")]
    DepthExceeded { limit: usize },

    #[error("value cannot be represented as JSON: {0}")]
    Unrepresentable(String),
}

/// Render any serializable value in canonical form.
///
/// Non-finite floats become `null` during conversion to a JSON value, the
/// same way absent values are dropped by `skip_serializing_if`.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    let value =
        serde_json::to_value(value).map_err(|e| CanonicalError::Unrepresentable(e.to_string()))?;
    canonicalize_value(&value)
}

/// Render an already-parsed JSON value in canonical form.
pub fn canonicalize_value(value: &Value) -> Result<String, CanonicalError> {
    let mut out = String::new();
    write_value(value, 0, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, depth: usize, out: &mut String) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::DepthExceeded { limit: MAX_DEPTH });
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, depth + 1, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out)?;
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_value(child, depth + 1, out)?;
                }
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(n: &Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            out.push_str("null");
        } else if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
            // 1.0 -> "1", -0.0 -> "0"
            out.push_str(&(f as i64).to_string());
        } else {
            out.push_str(&n.to_string());
        }
    } else {
        out.push_str("null");
    }
}

fn write_string(s: &str, out: &mut String) -> Result<(), CanonicalError> {
    let quoted =
        serde_json::to_string(s).map_err(|e| CanonicalError::Unrepresentable(e.to_string()))?;
    out.push_str(&quoted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "y": null}, "c": [3, {"k": 2, "j": 1}]});
        assert_eq!(
            canonicalize_value(&v).unwrap(),
            r#"{"a":{"y":null,"z":true},"b":1,"c":[3,{"j":1,"k":2}]}"#
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"p":[1,2],"q":"s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"q":"s","p":[1,2]},"x":1}"#).unwrap();
        assert_eq!(canonicalize_value(&a).unwrap(), canonicalize_value(&b).unwrap());
    }

    #[test]
    fn array_order_is_preserved() {
        assert_ne!(
            canonicalize_value(&json!([1, 2])).unwrap(),
            canonicalize_value(&json!([2, 1])).unwrap()
        );
    }

    #[test]
    fn integral_floats_render_without_fraction() {
        assert_eq!(canonicalize_value(&json!(1.0)).unwrap(), "1");
        assert_eq!(canonicalize_value(&json!(-0.0)).unwrap(), "0");
        assert_eq!(canonicalize_value(&json!(2.5)).unwrap(), "2.5");
        assert_eq!(canonicalize_value(&json!(u64::MAX)).unwrap(), u64::MAX.to_string());
    }

    #[test]
    fn non_finite_floats_become_null() {
        #[derive(Serialize)]
        struct Probe {
            nan: f64,
            inf: f64,
        }
        let rendered = canonicalize(&Probe {
            nan: f64::NAN,
            inf: f64::INFINITY,
        })
        .unwrap();
        assert_eq!(rendered, r#"{"inf":null,"nan":null}"#);
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(
            canonicalize_value(&json!({"k": "a\"b\n"})).unwrap(),
            r#"{"k":"a\"b\n"}"#
        );
    }

    #[test]
    fn runaway_nesting_is_rejected() {
        let mut v = json!(0);
        for _ in 0..(MAX_DEPTH + 2) {
            v = json!([v]);
        }
        assert_eq!(
            canonicalize_value(&v).unwrap_err(),
            CanonicalError::DepthExceeded { limit: MAX_DEPTH }
        );
    }
}
