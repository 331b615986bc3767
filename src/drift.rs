//! Drift between a desired object and its live counterpart
//!
//! The API server fills in defaults (`terminationMessagePath`, `dnsPolicy`,
//! status, managed fields, ...), so a live object is never equal to the
//! document that created it. Only fields present in the desired document are
//! compared.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;

/// JSON paths where `desired` and `live` disagree
pub fn drift<T: Serialize>(desired: &T, live: &T) -> Result<Vec<String>> {
    let desired = serde_json::to_value(desired)?;
    let live = serde_json::to_value(live)?;
    let mut paths = Vec::new();
    collect(&desired, &live, String::new(), &mut paths);
    Ok(paths)
}

/// True when every field of `desired` has an equal value in `live`
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    let mut paths = Vec::new();
    collect(desired, live, String::new(), &mut paths);
    paths.is_empty()
}

fn collect(desired: &Value, live: &Value, path: String, out: &mut Vec<String>) {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => {
            for (key, value) in want {
                let child = format!("{}.{}", path, key);
                match have.get(key) {
                    Some(existing) => collect(value, existing, child, out),
                    // An unset optional and an absent field are the same thing
                    None if value.is_null() => {}
                    None => out.push(child),
                }
            }
        }
        (Value::Array(want), Value::Array(have)) => {
            if want.len() != have.len() {
                out.push(path);
                return;
            }
            for (i, (w, h)) in want.iter().zip(have).enumerate() {
                collect(w, h, format!("{}[{}]", path, i), out);
            }
        }
        (w, h) if w == h => {}
        _ => out.push(if path.is_empty() { ".".to_string() } else { path }),
    }
}
