use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::core::shape::{Shape, TYPE_TAG};
use crate::core::task::{ResolvedArgs, TaskDescription};
use crate::core::LambdaValue;

/// Bounds applied while fingerprinting argument values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintLimits {
    /// Elements inspected per list.
    pub sample: usize,
    /// Keys inspected per object.
    pub keys: usize,
    pub depth: usize,
}

impl Default for FingerprintLimits {
    fn default() -> Self {
        Self {
            sample: 3,
            keys: 16,
            depth: 6,
        }
    }
}

/// Structural fingerprint of a value: its type and nesting, never its contents.
pub fn fingerprint(value: &LambdaValue, limits: &FingerprintLimits) -> String {
    fingerprint_at(value, limits, 0)
}

fn fingerprint_at(value: &LambdaValue, limits: &FingerprintLimits, depth: usize) -> String {
    if depth >= limits.depth {
        return "...".to_string();
    }
    match value {
        LambdaValue::Null => "none".to_string(),
        LambdaValue::Bool(_) => "bool".to_string(),
        LambdaValue::Number(n) if n.is_f64() => "float".to_string(),
        LambdaValue::Number(_) => "int".to_string(),
        LambdaValue::String(_) => "str".to_string(),
        LambdaValue::Array(items) => {
            let mut kinds: Vec<String> = Vec::new();
            for item in items.iter().take(limits.sample) {
                let kind = fingerprint_at(item, limits, depth + 1);
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
            if kinds.is_empty() {
                "list[?]".to_string()
            } else {
                kinds.sort();
                format!("list[{}]", kinds.join("|"))
            }
        }
        LambdaValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| *k != TYPE_TAG).collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .take(limits.keys)
                .map(|k| format!("{}: {}", quoted(k), fingerprint_at(&map[k], limits, depth + 1)))
                .collect();
            let name = match map.get(TYPE_TAG).and_then(|t| t.as_str()) {
                Some(tag) if is_identifier(tag) && tag != "dict" => tag.to_string(),
                Some(tag) => quoted(tag),
                None => "dict".to_string(),
            };
            format!("{}{{{}}}", name, fields.join(", "))
        }
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// JSON string literal of `text`, so keys can never be confused with fingerprint syntax.
fn quoted(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("{:?}", text))
}

/// Deterministic cache key of a synthesis task.
///
/// Two calls with equal signatures are treated as interchangeable: the implementation
/// validated for one is reused for the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Hex SHA-256 over every component below.
    pub key: String,
    pub prompt: String,
    pub fingerprints: Vec<String>,
    pub shape: Option<String>,
    pub namespace: String,
}

impl Signature {
    pub fn build(
        task: &TaskDescription,
        args: &ResolvedArgs,
        shape: Option<&Shape>,
        namespace: &str,
        limits: &FingerprintLimits,
    ) -> Self {
        let prompt = task.normalized();
        let fingerprints: Vec<String> = args
            .values
            .iter()
            .map(|v| fingerprint(v, limits))
            .collect();
        let shape = shape.map(|s| s.to_string());

        let mut hasher = Sha256::new();
        hasher.update(b"lambdai.signature.v2\0");
        hasher.update(prompt.as_bytes());
        hasher.update([0u8]);
        for fp in &fingerprints {
            hasher.update(fp.as_bytes());
            hasher.update([0x1fu8]);
        }
        hasher.update([0u8]);
        hasher.update(shape.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(namespace.as_bytes());
        let key = format!("{:x}", hasher.finalize());

        Self {
            key,
            prompt,
            fingerprints,
            shape,
            namespace: namespace.to_string(),
        }
    }

    /// First 12 hex digits, for logs and file names.
    pub fn short(&self) -> &str {
        &self.key[..12]
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Binding;
    use serde_json::json;

    fn sig(template: &str, values: Vec<LambdaValue>, shape: Option<&str>, ns: &str) -> Signature {
        let task = TaskDescription::parse(template).unwrap();
        let bindings: Vec<Binding> = values.into_iter().map(Binding::positional).collect();
        let args = task.bind(&bindings).unwrap();
        let shape = shape.map(|s| s.parse::<Shape>().unwrap());
        Signature::build(&task, &args, shape.as_ref(), ns, &FingerprintLimits::default())
    }

    #[test]
    fn test_fingerprint_ignores_values() {
        let limits = FingerprintLimits::default();
        assert_eq!(
            fingerprint(&json!([["123"]]), &limits),
            fingerprint(&json!([["456"], ["789"]]), &limits)
        );
        assert_eq!(fingerprint(&json!([["a"]]), &limits), "list[list[str]]");
        assert_ne!(
            fingerprint(&json!(["a"]), &limits),
            fingerprint(&json!([1]), &limits)
        );
    }

    #[test]
    fn test_fingerprint_mixed_and_empty() {
        let limits = FingerprintLimits::default();
        assert_eq!(fingerprint(&json!([1, "a", 2]), &limits), "list[int|str]");
        assert_eq!(fingerprint(&json!([]), &limits), "list[?]");
        assert_eq!(
            fingerprint(&json!({"__type__": "Person", "name": "Ann", "age": 3}), &limits),
            r#"Person{"age": int, "name": str}"#
        );
    }

    #[test]
    fn test_fingerprint_keys_cannot_mimic_structure() {
        let limits = FingerprintLimits::default();
        let forged = fingerprint(&json!({"a: int, b": "x"}), &limits);
        let real = fingerprint(&json!({"a": 1, "b": "x"}), &limits);
        assert_ne!(forged, real);
        assert_eq!(real, r#"dict{"a": int, "b": str}"#);

        // A record tagged "dict" is not a plain dict
        assert_ne!(
            fingerprint(&json!({"__type__": "dict", "a": 1}), &limits),
            fingerprint(&json!({"a": 1}), &limits)
        );
        assert_eq!(
            fingerprint(&json!({"__type__": "my type", "a": 1}), &limits),
            r#""my type"{"a": int}"#
        );
    }

    #[test]
    fn test_fingerprint_samples_bounded_prefix() {
        let limits = FingerprintLimits {
            sample: 2,
            ..Default::default()
        };
        // Only the first two elements are inspected
        assert_eq!(fingerprint(&json!(["a", "b", 3]), &limits), "list[str]");
    }

    #[test]
    fn test_fingerprint_depth_bound() {
        let limits = FingerprintLimits {
            depth: 2,
            ..Default::default()
        };
        assert_eq!(fingerprint(&json!([[[1]]]), &limits), "list[list[...]]");
    }

    #[test]
    fn test_signature_same_shape_different_values() {
        let a = sig("read {path}, keep columns A and B", vec![json!("a.csv")], Some("list[list[str]]"), "default");
        let b = sig("read {file}, keep columns A and B", vec![json!("/tmp/b.csv")], Some("list[list[str]]"), "default");
        assert_eq!(a.key, b.key);
        assert_eq!(a.key.len(), 64);
    }

    #[test]
    fn test_signature_distinguishes_components() {
        let base = sig("merge {a} {b}", vec![json!(["x"]), json!(["y"])], Some("list[str]"), "default");
        let other_types = sig("merge {a} {b}", vec![json!([1]), json!([2])], Some("list[str]"), "default");
        let other_shape = sig("merge {a} {b}", vec![json!(["x"]), json!(["y"])], Some("list[list[str]]"), "default");
        let no_shape = sig("merge {a} {b}", vec![json!(["x"]), json!(["y"])], None, "default");
        let other_ns = sig("merge {a} {b}", vec![json!(["x"]), json!(["y"])], Some("list[str]"), "reports");

        for other in [&other_types, &other_shape, &no_shape, &other_ns] {
            assert_ne!(base.key, other.key);
        }
    }

    #[test]
    fn test_signature_without_bindings() {
        let a = sig("return the first ten primes", vec![], None, "default");
        let b = sig("return  the first ten primes", vec![], None, "default");
        assert_eq!(a, b);
        assert!(a.fingerprints.is_empty());
    }
}
