//! Tool invoker for the payments backend
//!
//! Maps planner operations onto the backend's REST surface. Operations the
//! backend does not cover resolve to an empty JSON object instead of an
//! error, which is the tolerant contract the step executors expect.

use lazy_static::lazy_static;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::error::AgentError;
use crate::models::value_truthy;
use crate::Result;

lazy_static! {
    /// Tool-style names accepted from planners, mapped to canonical operations.
    static ref OPERATION_ALIASES: HashMap<&'static str, &'static str> = {
        let mut aliases = HashMap::new();
        aliases.insert("get_customer", "customers.get");
        aliases.insert("create_customer", "customers.create");
        aliases.insert("list_customer_transactions", "transactions.list");
        aliases.insert("create_transaction", "transactions.create");
        aliases.insert("get_transaction", "transactions.get");
        aliases.insert("search_transactions", "transactions.search");
        aliases.insert("cancel_transaction", "transactions.cancel");
        aliases.insert("make_payment", "payments.make");
        aliases.insert("get_payment", "payments.get");
        aliases.insert("get_payment_by_transaction", "payments.get");
        aliases.insert("retry_payment", "payments.retry");
        aliases.insert("fail_payment", "payments.fail");
        aliases.insert("spend_summary", "analytics.spend");
        aliases.insert("spend_by_category", "analytics.category");
        aliases.insert("time_series", "analytics.series");
        aliases
    };
}

pub fn canonical_operation(operation: &str) -> String {
    let normalized = operation.trim().to_ascii_lowercase();
    OPERATION_ALIASES
        .get(normalized.as_str())
        .map(|canonical| canonical.to_string())
        .unwrap_or(normalized)
}

/// Trait for delegating one step to a tool backend
#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, operation: &str, args: &Map<String, Value>) -> Result<Value>;
}

/// Pull a path id out of args; falsy ids count as absent.
fn scalar_param(args: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = args.get(*key) {
            if !value_truthy(value) {
                continue;
            }
            match value {
                Value::String(s) => return Some(s.clone()),
                Value::Number(n) => return Some(n.to_string()),
                _ => continue,
            }
        }
    }
    None
}

/// Render args into query pairs, skipping nulls, empty strings and
/// the keys already consumed by the path.
fn query_params(args: &Map<String, Value>, skip: &[&str]) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for (key, value) in args {
        if skip.contains(&key.as_str()) || key == "idempotencyKey" {
            continue;
        }
        let rendered = match value {
            Value::Null => continue,
            Value::String(s) if s.is_empty() => continue,
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        params.push((key.clone(), rendered));
    }
    params
}

fn body_without_key(args: &Map<String, Value>) -> Value {
    let mut body = args.clone();
    body.remove("idempotencyKey");
    Value::Object(body)
}

fn idempotency_key(args: &Map<String, Value>) -> Option<String> {
    args.get("idempotencyKey")
        .and_then(|value| value.as_str())
        .filter(|key| !key.is_empty())
        .map(|key| key.to_string())
}

//
// ================= HTTP Invoker =================
//

#[derive(Clone)]
pub struct HttpToolInvoker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpToolInvoker {
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("PAYMENTS_API_BASE_URL")
            .or_else(|_| env::var("MY_PAYMENTS_BASE_URL"))
            .ok()?;

        let api_key = env::var("PAYMENTS_API_KEY")
            .or_else(|_| env::var("MY_PAYMENTS_API_KEY"))
            .ok()
            .filter(|key| !key.is_empty());

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;

        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get_json(&self, path: &str, params: Vec<(String, String)>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(url).query(&params);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.json::<Value>().await?;

        if !status.is_success() {
            return Err(AgentError::InvocationError(format!(
                "payments backend returned {} for {}: {}",
                status, path, body
            )));
        }
        Ok(body)
    }

    async fn post_json(
        &self,
        path: &str,
        body: Option<&Value>,
        idempotency: Option<&str>,
        params: Vec<(String, String)>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(url).query(&params);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        if let Some(key) = idempotency {
            request = request.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.json::<Value>().await?;

        if !status.is_success() {
            return Err(AgentError::InvocationError(format!(
                "payments backend returned {} for {}: {}",
                status, path, body
            )));
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl ToolInvoker for HttpToolInvoker {

    async fn invoke(&self, operation: &str, args: &Map<String, Value>) -> Result<Value> {
        let operation = canonical_operation(operation);
        debug!(operation = %operation, "delegating step to payments backend");
        let key = idempotency_key(args);

        match operation.as_str() {
            "customers.create" => {
                self.post_json("/customers", Some(&body_without_key(args)), None, vec![])
                    .await
            }
            "customers.get" => match scalar_param(args, &["id", "customerId"]) {
                Some(id) => self.get_json(&format!("/customers/{}", id), vec![]).await,
                None => Ok(json!({})),
            },
            "transactions.create" => {
                self.post_json(
                    "/transactions",
                    Some(&body_without_key(args)),
                    key.as_deref(),
                    vec![],
                )
                .await
            }
            "transactions.get" => match scalar_param(args, &["id", "transactionId"]) {
                Some(id) => self.get_json(&format!("/transactions/{}", id), vec![]).await,
                None => Ok(json!({})),
            },
            // Customer-scoped listing when a customer id is supplied,
            // otherwise the global search endpoint.
            "transactions.list" | "transactions.search" => {
                match scalar_param(args, &["customerId"]) {
                    Some(customer_id) => {
                        self.get_json(
                            &format!("/customers/{}/transactions", customer_id),
                            query_params(args, &["customerId"]),
                        )
                        .await
                    }
                    None => {
                        self.get_json("/transactions", query_params(args, &[]))
                            .await
                    }
                }
            }
            "transactions.cancel" => match scalar_param(args, &["id", "transactionId"]) {
                Some(id) => {
                    self.post_json(
                        &format!("/transactions/{}/cancel", id),
                        None,
                        key.as_deref(),
                        vec![],
                    )
                    .await
                }
                None => Ok(json!({})),
            },
            "payments.make" => {
                self.post_json(
                    "/payments",
                    Some(&body_without_key(args)),
                    key.as_deref(),
                    vec![],
                )
                .await
            }
            "payments.get" => {
                if let Some(id) = scalar_param(args, &["id", "paymentId"]) {
                    self.get_json(&format!("/payments/{}", id), vec![]).await
                } else if let Some(tx) = scalar_param(args, &["transactionId"]) {
                    self.get_json(&format!("/transactions/{}/payment", tx), vec![])
                        .await
                } else {
                    Ok(json!({}))
                }
            }
            "payments.retry" => match scalar_param(args, &["id", "paymentId"]) {
                Some(id) => {
                    self.post_json(
                        &format!("/payments/{}/retry", id),
                        None,
                        key.as_deref(),
                        vec![],
                    )
                    .await
                }
                None => Ok(json!({})),
            },
            "payments.fail" => match scalar_param(args, &["id", "paymentId"]) {
                Some(id) => {
                    self.post_json(
                        &format!("/payments/{}/fail", id),
                        None,
                        key.as_deref(),
                        query_params(args, &["id", "paymentId"]),
                    )
                    .await
                }
                None => Ok(json!({})),
            },
            "analytics.spend" => {
                self.get_json("/analytics/spend-summary", query_params(args, &[]))
                    .await
            }
            "analytics.category" => {
                self.get_json("/analytics/spend-by-category", query_params(args, &[]))
                    .await
            }
            "analytics.series" => {
                self.get_json("/analytics/time-series", query_params(args, &[]))
                    .await
            }
            other => {
                debug!(operation = %other, "no backend route for operation");
                Ok(json!({}))
            }
        }
    }
}

//
// ================= Mock Invoker =================
//

/// Canned backend used by the demo binary and when no backend is configured.
/// Outputs echo enough of the args to keep downstream steps realistic.
pub struct MockToolInvoker;

#[async_trait::async_trait]
impl ToolInvoker for MockToolInvoker {

    async fn invoke(&self, operation: &str, args: &Map<String, Value>) -> Result<Value> {
        let operation = canonical_operation(operation);
        let customer_id = args.get("customerId").cloned().unwrap_or(json!(1));
        let amount = args.get("amount").cloned().unwrap_or(json!(0));
        let currency = args.get("currency").cloned().unwrap_or(json!("USD"));

        let output = match operation.as_str() {
            "customers.get" => json!({
                "id": customer_id,
                "name": "Demo Customer",
                "email": "demo.customer@example.com",
            }),
            "customers.create" => json!({
                "id": 101,
                "name": args.get("name").cloned().unwrap_or(json!("New Customer")),
                "email": args.get("email").cloned().unwrap_or(json!("new.customer@example.com")),
            }),
            "transactions.list" | "transactions.search" => json!({
                "items": [
                    {"id": 4001, "customerId": customer_id, "amount": 42.5, "currency": currency, "status": "COMPLETED"},
                    {"id": 4002, "customerId": customer_id, "amount": 18.0, "currency": currency, "status": "PENDING"},
                ],
                "page": 1,
                "size": 2,
            }),
            "transactions.get" => json!({
                "id": args.get("id").cloned().unwrap_or(json!(4001)),
                "customerId": customer_id,
                "amount": 42.5,
                "currency": currency,
                "status": "COMPLETED",
            }),
            "transactions.create" => json!({
                "id": 5001,
                "customerId": customer_id,
                "amount": amount,
                "currency": currency,
                "category": args.get("category").cloned().unwrap_or(json!("general")),
                "status": "PENDING",
            }),
            "payments.make" => json!({
                "id": 9001,
                "transactionId": args.get("transactionId").cloned().unwrap_or(json!(5001)),
                "status": "COMPLETED",
                "amount": amount,
                "currency": currency,
            }),
            "payments.get" => json!({
                "id": args.get("id").cloned().unwrap_or(json!(9001)),
                "status": "COMPLETED",
            }),
            "analytics.spend" => json!({
                "customerId": customer_id,
                "total": 1234.56,
                "currency": currency,
                "count": 14,
            }),
            "analytics.category" => json!({
                "customerId": customer_id,
                "categories": [
                    {"category": "groceries", "total": 420.0},
                    {"category": "travel", "total": 814.56},
                ],
            }),
            _ => json!({}),
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_operations() {
        assert_eq!(canonical_operation("make_payment"), "payments.make");
        assert_eq!(canonical_operation(" Get_Payment "), "payments.get");
        assert_eq!(canonical_operation("spend_summary"), "analytics.spend");
        assert_eq!(canonical_operation("payments.make"), "payments.make");
        assert_eq!(canonical_operation("something.else"), "something.else");
    }

    #[test]
    fn scalar_params_skip_falsy_values() {
        let args = match json!({"id": 0, "customerId": 7}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(scalar_param(&args, &["id", "customerId"]), Some("7".to_string()));
        assert_eq!(scalar_param(&args, &["paymentId"]), None);
    }

    #[test]
    fn query_params_drop_nulls_and_consumed_keys() {
        let args = match json!({
            "customerId": 7,
            "status": "COMPLETED",
            "category": null,
            "currency": "",
            "idempotencyKey": "pay:abc",
            "size": 10,
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let params = query_params(&args, &["customerId"]);
        assert!(params.contains(&("status".to_string(), "COMPLETED".to_string())));
        assert!(params.contains(&("size".to_string(), "10".to_string())));
        assert!(!params.iter().any(|(k, _)| k == "customerId"));
        assert!(!params.iter().any(|(k, _)| k == "category"));
        assert!(!params.iter().any(|(k, _)| k == "currency"));
        assert!(!params.iter().any(|(k, _)| k == "idempotencyKey"));
    }

    #[tokio::test]
    async fn mock_invoker_echoes_transaction_args() {
        let args = match json!({"customerId": 50, "amount": 3000, "currency": "INR"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let out = MockToolInvoker
            .invoke("transactions.create", &args)
            .await
            .unwrap();
        assert_eq!(out["customerId"], json!(50));
        assert_eq!(out["amount"], json!(3000));
        assert_eq!(out["currency"], json!("INR"));
        assert!(out["id"].is_number());
    }

    #[tokio::test]
    async fn mock_invoker_returns_empty_for_unknown_operation() {
        let out = MockToolInvoker
            .invoke("weather.today", &Map::new())
            .await
            .unwrap();
        assert_eq!(out, json!({}));
    }
}
