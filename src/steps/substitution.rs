//! Placeholder resolution and idempotency synthesis
//!
//! Planner output may reference the previous step's result through a
//! reserved marker instead of a concrete id. Resolution happens right
//! before the step is delegated to the invoker.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::{is_mutating_operation, is_present, value_truthy};

/// Marker prefix, matched case-insensitively on string args.
pub const PLACEHOLDER_PREFIX: &str = "{{TRANSACTION_ID_FROM_PREV";

/// Canonical marker the planner emits for chained payment steps.
pub const TRANSACTION_ID_PLACEHOLDER: &str = "{{TRANSACTION_ID_FROM_PREV_STEP}}";

/// Deterministic token for a (operation, step_idx) pair. Re-running the
/// identical step yields the identical token, which is what lets the
/// backend deduplicate at-least-once resumes.
pub fn idempotency_token(operation: &str, step_idx: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}||{}", operation, step_idx).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("pay:{}", &digest[..16])
}

fn probe_id(last_result: &Value) -> Option<Value> {
    let fields = last_result.as_object()?;
    let candidates = [
        fields.get("id"),
        fields.get("transactionId"),
        fields.get("data").and_then(|data| data.get("id")),
    ];
    for candidate in candidates.into_iter().flatten() {
        if value_truthy(candidate) {
            return Some(candidate.clone());
        }
    }
    None
}

/// Replace marker-valued args with the id probed from the previous result.
/// Unresolved markers pass through unchanged; the invoker deals with them.
pub fn resolve_placeholders(args: &mut Map<String, Value>, last_result: Option<&Value>) {
    let replacement = last_result.and_then(probe_id);
    for value in args.values_mut() {
        let is_marker = value
            .as_str()
            .map(|s| s.to_ascii_uppercase().starts_with(PLACEHOLDER_PREFIX))
            .unwrap_or(false);
        if is_marker {
            if let Some(id) = &replacement {
                *value = id.clone();
            }
        }
    }
}

/// Synthesize an idempotency key for mutating operations that lack one.
pub fn ensure_idempotency_key(operation: &str, step_idx: usize, args: &mut Map<String, Value>) {
    if !is_mutating_operation(operation) {
        return;
    }
    if is_present(args.get("idempotencyKey")) {
        return;
    }
    args.insert(
        "idempotencyKey".to_string(),
        Value::String(idempotency_token(operation, step_idx)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args_of(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn token_is_deterministic_and_prefixed() {
        let first = idempotency_token("payments.make", 2);
        let second = idempotency_token("payments.make", 2);
        assert_eq!(first, second);
        assert!(first.starts_with("pay:"));
        assert_eq!(first.len(), "pay:".len() + 16);
    }

    #[test]
    fn token_varies_with_operation_and_index() {
        let base = idempotency_token("payments.make", 0);
        assert_ne!(base, idempotency_token("payments.make", 1));
        assert_ne!(base, idempotency_token("transactions.create", 0));
    }

    #[test]
    fn marker_resolves_id_field_first() {
        let mut args = args_of(json!({"transactionId": "{{TRANSACTION_ID_FROM_PREV}}"}));
        let last = json!({"id": 77, "transactionId": 77});
        resolve_placeholders(&mut args, Some(&last));
        assert_eq!(args.get("transactionId"), Some(&json!(77)));
    }

    #[test]
    fn falsy_candidates_are_skipped() {
        let mut args = args_of(json!({"transactionId": "{{TRANSACTION_ID_FROM_PREV}}"}));
        let last = json!({"id": 0, "transactionId": 42});
        resolve_placeholders(&mut args, Some(&last));
        assert_eq!(args.get("transactionId"), Some(&json!(42)));
    }

    #[test]
    fn nested_data_id_is_probed_last() {
        let mut args = args_of(json!({"transactionId": "{{TRANSACTION_ID_FROM_PREV}}"}));
        let last = json!({"data": {"id": "tx-9"}});
        resolve_placeholders(&mut args, Some(&last));
        assert_eq!(args.get("transactionId"), Some(&json!("tx-9")));
    }

    #[test]
    fn unresolved_marker_passes_through() {
        let mut args = args_of(json!({"transactionId": "{{TRANSACTION_ID_FROM_PREV}}"}));
        resolve_placeholders(&mut args, None);
        assert_eq!(
            args.get("transactionId"),
            Some(&json!("{{TRANSACTION_ID_FROM_PREV}}"))
        );

        resolve_placeholders(&mut args, Some(&json!({"other": 1})));
        assert_eq!(
            args.get("transactionId"),
            Some(&json!("{{TRANSACTION_ID_FROM_PREV}}"))
        );
    }

    #[test]
    fn marker_match_is_case_insensitive() {
        let mut args = args_of(json!({"transactionId": "{{transaction_id_from_prev}}"}));
        let last = json!({"id": "tx-1"});
        resolve_placeholders(&mut args, Some(&last));
        assert_eq!(args.get("transactionId"), Some(&json!("tx-1")));
    }

    #[test]
    fn idempotency_key_synthesized_only_when_needed() {
        let mut args = args_of(json!({}));
        ensure_idempotency_key("payments.make", 1, &mut args);
        let synthesized = args.get("idempotencyKey").unwrap().as_str().unwrap();
        assert_eq!(synthesized, idempotency_token("payments.make", 1));

        let mut supplied = args_of(json!({"idempotencyKey": "client-key"}));
        ensure_idempotency_key("payments.make", 1, &mut supplied);
        assert_eq!(supplied.get("idempotencyKey"), Some(&json!("client-key")));

        let mut read_only = args_of(json!({}));
        ensure_idempotency_key("payments.get", 1, &mut read_only);
        assert!(read_only.get("idempotencyKey").is_none());
    }

    #[test]
    fn empty_idempotency_key_is_replaced() {
        let mut args = args_of(json!({"idempotencyKey": ""}));
        ensure_idempotency_key("transactions.create", 0, &mut args);
        assert_eq!(
            args.get("idempotencyKey"),
            Some(&json!(idempotency_token("transactions.create", 0)))
        );
    }
}
