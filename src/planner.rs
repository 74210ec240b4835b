//! Intent detection and plan construction
//!
//! The planner turns a free-text request into an ordered list of steps over
//! the fixed operation vocabulary. Anything it cannot map stays a noop; the
//! summarizer answers those with the scope help text instead of guessing.

use serde_json::{json, Map, Value};

use crate::models::{ChatTurn, Step, StepAgent};
use crate::steps::substitution::{idempotency_token, TRANSACTION_ID_PLACEHOLDER};
use crate::Result;

/// Reply for requests outside the supported operations
pub const OUT_OF_SCOPE_HELP: &str = "Sorry, that's outside my scope. I'm the payments assistant, so I can help with things like:\n- look up a customer or their recent transactions\n- create a transaction or make a payment\n- retry or fail a payment\n- spending summaries and category breakdowns\n\nTry: \"show customer 42's transactions\" or \"create a transaction of $120 for customer 7 for groceries\".";

const CURRENCIES: &[&str] = &[
    "USD", "EUR", "INR", "GBP", "JPY", "AUD", "CAD", "SGD", "AED",
];

const CATEGORIES: &[&str] = &[
    "groceries",
    "utilities",
    "travel",
    "dining",
    "entertainment",
    "rent",
    "shopping",
    "fuel",
    "subscriptions",
];

/// Intent plus the steps that will satisfy it
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub intent: String,
    pub plan: Vec<Step>,
}

impl PlanOutcome {
    pub fn noop() -> Self {
        Self {
            intent: "noop".to_string(),
            plan: Vec::new(),
        }
    }

    fn single(intent: &str, agent: StepAgent, operation: &str, args: Map<String, Value>) -> Self {
        Self {
            intent: intent.to_string(),
            plan: vec![Step {
                agent,
                operation: operation.to_string(),
                args,
            }],
        }
    }
}

/// Trait for plan construction
#[async_trait::async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: &str, history: &[ChatTurn]) -> Result<PlanOutcome>;
}

//
// ================= Keyword Planner =================
//

/// Deterministic rule-table planner. First matching rule wins.
pub struct KeywordPlanner;

impl KeywordPlanner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KeywordPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, input: &str, _history: &[ChatTurn]) -> Result<PlanOutcome> {
        let words = tokenize(input);
        if words.is_empty() {
            return Ok(PlanOutcome::noop());
        }

        if has_word(&words, "retry") && has_any(&words, &["payment", "payments"]) {
            let mut args = Map::new();
            insert_number(&mut args, "paymentId", number_after(&words, "payment"));
            return Ok(PlanOutcome::single(
                "retry_payment",
                StepAgent::Execution,
                "payments.retry",
                args,
            ));
        }

        if has_word(&words, "fail") && has_any(&words, &["payment", "payments"]) {
            let mut args = Map::new();
            insert_number(&mut args, "paymentId", number_after(&words, "payment"));
            return Ok(PlanOutcome::single(
                "fail_payment",
                StepAgent::Execution,
                "payments.fail",
                args,
            ));
        }

        let create_intent = has_any(&words, &["create", "add", "record", "log", "new"]);

        if create_intent && has_any(&words, &["transaction", "transactions"]) {
            let mut args = Map::new();
            insert_number(&mut args, "customerId", number_after(&words, "customer"));
            insert_number(&mut args, "amount", amount_token(&words));
            args.insert("currency".to_string(), json!(currency_token(&words)));
            if let Some(category) = category_token(&words) {
                args.insert("category".to_string(), json!(category));
            }

            let mut plan = vec![Step {
                agent: StepAgent::Execution,
                operation: "transactions.create".to_string(),
                args,
            }];

            if has_any(&words, &["pay", "payment"]) {
                let mut pay_args = Map::new();
                pay_args.insert(
                    "transactionId".to_string(),
                    json!(TRANSACTION_ID_PLACEHOLDER),
                );
                pay_args.insert("method".to_string(), json!(method_token(&words)));
                pay_args.insert(
                    "idempotencyKey".to_string(),
                    json!(idempotency_token("payments.make", plan.len())),
                );
                plan.push(Step {
                    agent: StepAgent::Execution,
                    operation: "payments.make".to_string(),
                    args: pay_args,
                });
                return Ok(PlanOutcome {
                    intent: "create_and_pay".to_string(),
                    plan,
                });
            }

            return Ok(PlanOutcome {
                intent: "create_transaction".to_string(),
                plan,
            });
        }

        if create_intent && has_any(&words, &["customer", "customers"]) {
            let mut args = Map::new();
            if let Some(email) = email_token(&words) {
                args.insert("email".to_string(), json!(email));
            }
            return Ok(PlanOutcome::single(
                "create_customer",
                StepAgent::Execution,
                "customers.create",
                args,
            ));
        }

        if has_word(&words, "pay") || (has_word(&words, "make") && has_word(&words, "payment")) {
            let mut args = Map::new();
            insert_number(&mut args, "transactionId", number_after(&words, "transaction"));
            args.insert("method".to_string(), json!(method_token(&words)));
            args.insert(
                "idempotencyKey".to_string(),
                json!(idempotency_token("payments.make", 0)),
            );
            return Ok(PlanOutcome::single(
                "make_payment",
                StepAgent::Execution,
                "payments.make",
                args,
            ));
        }

        if has_any(&words, &["payment", "payments"])
            && has_any(&words, &["status", "show", "get", "details"])
        {
            let mut args = Map::new();
            insert_number(&mut args, "paymentId", number_after(&words, "payment"));
            insert_number(&mut args, "transactionId", number_after(&words, "transaction"));
            return Ok(PlanOutcome::single(
                "payment_status",
                StepAgent::Data,
                "payments.get",
                args,
            ));
        }

        if has_any(&words, &["transactions", "history", "statement", "recent"]) {
            let mut args = Map::new();
            insert_number(&mut args, "customerId", number_after(&words, "customer"));
            return Ok(PlanOutcome::single(
                "list_transactions",
                StepAgent::Data,
                "transactions.list",
                args,
            ));
        }

        if has_word(&words, "transaction") {
            if let Some(id) = number_after(&words, "transaction") {
                let mut args = Map::new();
                insert_number(&mut args, "transactionId", Some(id));
                return Ok(PlanOutcome::single(
                    "get_transaction",
                    StepAgent::Data,
                    "transactions.get",
                    args,
                ));
            }
        }

        if has_any(&words, &["category", "categories", "breakdown"]) {
            let mut args = Map::new();
            insert_number(&mut args, "customerId", number_after(&words, "customer"));
            return Ok(PlanOutcome::single(
                "category_breakdown",
                StepAgent::Data,
                "analytics.category",
                args,
            ));
        }

        if has_any(&words, &["spend", "spending", "spent"]) {
            let mut args = Map::new();
            insert_number(&mut args, "customerId", number_after(&words, "customer"));
            return Ok(PlanOutcome::single(
                "spend_summary",
                StepAgent::Data,
                "analytics.spend",
                args,
            ));
        }

        if has_any(&words, &["customer", "customers"]) {
            if let Some(id) = number_after(&words, "customer") {
                let mut args = Map::new();
                insert_number(&mut args, "customerId", Some(id));
                return Ok(PlanOutcome::single(
                    "lookup_customer",
                    StepAgent::Data,
                    "customers.get",
                    args,
                ));
            }
        }

        Ok(PlanOutcome::noop())
    }
}

//
// ================= Token Helpers =================
//

fn tokenize(input: &str) -> Vec<String> {
    input
        .split(|c: char| {
            c.is_whitespace()
                || matches!(c, ',' | '.' | '?' | '!' | ';' | ':' | '(' | ')' | '"')
        })
        .filter(|word| !word.is_empty())
        .map(|word| word.to_string())
        .collect()
}

fn has_word(words: &[String], keyword: &str) -> bool {
    words.iter().any(|word| word.eq_ignore_ascii_case(keyword))
}

fn has_any(words: &[String], keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| has_word(words, keyword))
}

fn numeric_value(word: &str) -> Option<f64> {
    let trimmed = word.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

/// First number within a few words after `keyword`
fn number_after(words: &[String], keyword: &str) -> Option<f64> {
    let at = words
        .iter()
        .position(|word| word.eq_ignore_ascii_case(keyword))?;
    words[at + 1..].iter().take(3).find_map(|word| numeric_value(word))
}

fn amount_token(words: &[String]) -> Option<f64> {
    if let Some(value) = words
        .iter()
        .find(|word| word.starts_with('$'))
        .and_then(|word| numeric_value(word))
    {
        return Some(value);
    }
    if let Some(at) = words
        .iter()
        .position(|word| CURRENCIES.contains(&word.to_ascii_uppercase().as_str()))
    {
        if at > 0 {
            if let Some(value) = numeric_value(&words[at - 1]) {
                return Some(value);
            }
        }
    }
    number_after(words, "of")
}

fn currency_token(words: &[String]) -> String {
    if let Some(code) = words
        .iter()
        .map(|word| word.to_ascii_uppercase())
        .find(|word| CURRENCIES.contains(&word.as_str()))
    {
        return code;
    }
    "USD".to_string()
}

fn category_token(words: &[String]) -> Option<String> {
    words
        .iter()
        .map(|word| word.to_ascii_lowercase())
        .find(|word| CATEGORIES.contains(&word.as_str()))
}

fn method_token(words: &[String]) -> String {
    if has_word(words, "upi") {
        return "UPI".to_string();
    }
    for method in ["card", "netbanking", "wallet"] {
        if has_word(words, method) {
            return method.to_string();
        }
    }
    "card".to_string()
}

fn email_token(words: &[String]) -> Option<String> {
    words
        .iter()
        .find(|word| word.contains('@') && word.contains('.'))
        .cloned()
}

fn insert_number(args: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(value) = value {
        if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
            args.insert(key.to_string(), json!(value as i64));
        } else {
            args.insert(key.to_string(), json!(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn plan_for(input: &str) -> PlanOutcome {
        KeywordPlanner::new().plan(input, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_pay_builds_two_step_plan() {
        let outcome =
            plan_for("Create a transaction of 3000 INR for customer 11 for groceries and pay it via UPI")
                .await;

        assert_eq!(outcome.intent, "create_and_pay");
        assert_eq!(outcome.plan.len(), 2);

        let create = &outcome.plan[0];
        assert_eq!(create.operation, "transactions.create");
        assert_eq!(create.agent, StepAgent::Execution);
        assert_eq!(create.args["customerId"], json!(11));
        assert_eq!(create.args["amount"], json!(3000));
        assert_eq!(create.args["currency"], json!("INR"));
        assert_eq!(create.args["category"], json!("groceries"));

        let pay = &outcome.plan[1];
        assert_eq!(pay.operation, "payments.make");
        assert_eq!(pay.args["transactionId"], json!(TRANSACTION_ID_PLACEHOLDER));
        assert_eq!(pay.args["method"], json!("UPI"));
        assert_eq!(
            pay.args["idempotencyKey"],
            json!(idempotency_token("payments.make", 1))
        );
    }

    #[tokio::test]
    async fn dollar_amount_defaults_to_usd() {
        let outcome = plan_for("create a transaction of $120 for customer 7").await;

        assert_eq!(outcome.intent, "create_transaction");
        let create = &outcome.plan[0];
        assert_eq!(create.args["amount"], json!(120));
        assert_eq!(create.args["currency"], json!("USD"));
    }

    #[tokio::test]
    async fn pay_existing_transaction_is_single_step() {
        let outcome = plan_for("pay transaction 55").await;

        assert_eq!(outcome.intent, "make_payment");
        assert_eq!(outcome.plan.len(), 1);
        let pay = &outcome.plan[0];
        assert_eq!(pay.operation, "payments.make");
        assert_eq!(pay.args["transactionId"], json!(55));
        assert_eq!(pay.args["method"], json!("card"));
        assert!(pay.args.contains_key("idempotencyKey"));
    }

    #[tokio::test]
    async fn listing_extracts_customer_id_through_possessive() {
        let outcome = plan_for("show customer 42's transactions").await;

        assert_eq!(outcome.intent, "list_transactions");
        assert_eq!(outcome.plan[0].operation, "transactions.list");
        assert_eq!(outcome.plan[0].agent, StepAgent::Data);
        assert_eq!(outcome.plan[0].args["customerId"], json!(42));
    }

    #[tokio::test]
    async fn retry_and_fail_route_to_execution() {
        let retry = plan_for("retry payment 9").await;
        assert_eq!(retry.plan[0].operation, "payments.retry");
        assert_eq!(retry.plan[0].args["paymentId"], json!(9));

        let fail = plan_for("fail payment 9 please").await;
        assert_eq!(fail.plan[0].operation, "payments.fail");
    }

    #[tokio::test]
    async fn analytics_rules_match_spend_and_category() {
        let spend = plan_for("spend summary for customer 7").await;
        assert_eq!(spend.plan[0].operation, "analytics.spend");
        assert_eq!(spend.plan[0].args["customerId"], json!(7));

        let category = plan_for("category breakdown of my spending").await;
        assert_eq!(category.plan[0].operation, "analytics.category");
    }

    #[tokio::test]
    async fn unmatched_input_is_noop() {
        let outcome = plan_for("what's the weather like tomorrow").await;
        assert_eq!(outcome.intent, "noop");
        assert!(outcome.plan.is_empty());

        let empty = plan_for("   ").await;
        assert_eq!(empty.intent, "noop");
    }

    #[tokio::test]
    async fn customer_lookup_needs_an_id() {
        let with_id = plan_for("who is customer 42").await;
        assert_eq!(with_id.plan[0].operation, "customers.get");
        assert_eq!(with_id.plan[0].args["customerId"], json!(42));

        let without = plan_for("tell me about the customer").await;
        assert_eq!(without.intent, "noop");
    }
}
