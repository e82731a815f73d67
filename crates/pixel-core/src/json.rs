//! JSON helpers shared by identity merging and settings loading.

use serde_json::Value;

/// Merge `source` into `target`.
///
/// Objects merge key by key, recursively. Any other `source` value replaces
/// what was there, except `null`, which leaves the target key untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}
