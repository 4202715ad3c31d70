//! Content similarity and field-level merge of JSON payloads.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Returns a similarity score in `0.0..=1.0` between two payloads.
///
/// Objects score the mean of their per-field scores over the union of
/// field names; a field present on one side only scores 0. Strings use
/// normalized edit distance, numbers their relative difference, arrays are
/// compared position by position. Values of different types score 0.
pub fn similarity(a: &Value, b: &Value) -> f64 {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => object_similarity(a, b),
        (Value::Array(a), Value::Array(b)) => array_similarity(a, b),
        (Value::String(a), Value::String(b)) => text_similarity(a, b),
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => number_similarity(a, b),
            _ => 0.0,
        },
        _ if a == b => 1.0,
        _ => 0.0,
    }
}

fn object_similarity(a: &Map<String, Value>, b: &Map<String, Value>) -> f64 {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    if keys.is_empty() {
        return 1.0;
    }
    let total: f64 = keys
        .iter()
        .map(|key| match (a.get(*key), b.get(*key)) {
            (Some(x), Some(y)) => similarity(x, y),
            _ => 0.0,
        })
        .sum();
    total / keys.len() as f64
}

fn array_similarity(a: &[Value], b: &[Value]) -> f64 {
    let len = a.len().max(b.len());
    if len == 0 {
        return 1.0;
    }
    let total: f64 = a.iter().zip(b).map(|(x, y)| similarity(x, y)).sum();
    total / len as f64
}

fn number_similarity(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return 1.0;
    }
    (1.0 - (a - b).abs() / scale).clamp(0.0, 1.0)
}

/// Normalized Levenshtein similarity: `1 - distance / max(len)`.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let len = a.len().max(b.len());
    if len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / len as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Overlays `local` on `remote`.
///
/// Objects merge field by field, recursing into nested objects; local
/// values win. Any other combination yields `local`.
pub fn merge_payloads(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(local), Value::Object(remote)) => {
            let mut merged = remote.clone();
            for (key, value) in local {
                let next = match remote.get(key) {
                    Some(theirs) => merge_payloads(value, theirs),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::Null, _) => remote.clone(),
        _ => local.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn identical_values_score_one() {
        let v = json!({"front": "hola", "back": "hello", "box": 3});
        assert_eq!(similarity(&v, &v), 1.0);
        assert_eq!(similarity(&json!({}), &json!({})), 1.0);
    }

    #[test]
    fn missing_fields_score_zero() {
        let a = json!({"front": "hola"});
        let b = json!({"back": "hello"});
        assert_eq!(similarity(&a, &b), 0.0);
    }

    #[test]
    fn small_text_edit_is_similar() {
        let a = json!({"front": "the quick brown fox", "back": "x"});
        let b = json!({"front": "the quick brown fix", "back": "x"});
        let score = similarity(&a, &b);
        assert!(score > 0.9, "{score}");
    }

    #[test]
    fn numbers_use_relative_difference() {
        assert_eq!(similarity(&json!(10), &json!(5)), 0.5);
        assert_eq!(similarity(&json!(0), &json!(0.0)), 1.0);
    }

    #[test]
    fn type_mismatch_scores_zero() {
        assert_eq!(similarity(&json!("1"), &json!(1)), 0.0);
        assert_eq!(similarity(&json!(null), &json!(null)), 1.0);
        assert_eq!(similarity(&json!(true), &json!(false)), 0.0);
    }

    #[test]
    fn levenshtein_distance() {
        assert_eq!(text_similarity("kitten", "sitting"), 1.0 - 3.0 / 7.0);
        assert_eq!(text_similarity("", ""), 1.0);
        assert_eq!(text_similarity("abc", ""), 0.0);
    }

    #[test]
    fn merge_prefers_local_fields() {
        let local = json!({"front": "mine", "meta": {"box": 2}});
        let remote = json!({"front": "theirs", "back": "kept", "meta": {"box": 1, "seen": true}});
        assert_eq!(
            merge_payloads(&local, &remote),
            json!({"front": "mine", "back": "kept", "meta": {"box": 2, "seen": true}})
        );
    }

    #[test]
    fn merge_of_null_local_takes_remote() {
        let remote = json!({"front": "theirs"});
        assert_eq!(merge_payloads(&Value::Null, &remote), remote);
    }

    proptest! {
        #[test]
        fn similarity_is_symmetric_and_bounded(a in "[a-z ]{0,24}", b in "[a-z ]{0,24}") {
            let x = json!({"text": a});
            let y = json!({"text": b});
            let s = similarity(&x, &y);
            prop_assert!((0.0..=1.0).contains(&s));
            prop_assert_eq!(s, similarity(&y, &x));
        }
    }
}
