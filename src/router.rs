//! Virtual-model router: resolves incoming requests to a virtual model.
//!
//! Resolution order: explicit `X-Virtual-Model` header, explicit
//! `virtualModel` body field, then priority-ordered routing rules, then the
//! configured default. No match is 3005 PIPELINE_SELECTION_FAILED. Rules
//! carry conditions over path, method, headers, and body fields with the
//! operators equals, not_equals, contains, regex, and in.

use crate::assembler::VmDefaults;
use crate::error::{ErrorCode, PipelineError, Result};
use crate::payload::{Dialect, Payload};
use crate::scheduler::{ExecutionOptions, ExecutionResult, Scheduler};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Header carrying an explicit virtual-model override.
pub const VIRTUAL_MODEL_HEADER: &str = "x-virtual-model";

/// The slice of an incoming HTTP request the router looks at. The body
/// stays opaque beyond the fields conditions name.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased by the front-end.
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl GatewayRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: Value) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    pub fn dialect(&self) -> Dialect {
        Dialect::from_path(&self.path)
    }
}

/// Condition operator over one request field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    Regex,
    In,
}

/// One condition: `field` is `path`, `method`, `header.<name>`, or
/// `body.<dotted.path>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

/// How a matching rule picks the virtual model.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSelection {
    pub virtual_model: Option<String>,
    pub strategy: Option<String>,
    /// For the weighted strategy: virtual model → weight.
    pub weights: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub rule_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub pipeline_selection: PipelineSelection,
}

fn default_enabled() -> bool {
    true
}

struct CompiledRule {
    rule: RoutingRule,
    /// Regexes pre-compiled per condition index.
    regexes: HashMap<usize, Regex>,
}

/// Resolves requests to virtual models and hands them to the scheduler.
pub struct VirtualModelRouter {
    rules: Vec<CompiledRule>,
    default_virtual_model: Option<String>,
    vm_defaults: HashMap<String, VmDefaults>,
    scheduler: Arc<Scheduler>,
}

impl std::fmt::Debug for VirtualModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualModelRouter")
            .field("rules", &self.rules.len())
            .field("default", &self.default_virtual_model)
            .finish()
    }
}

impl VirtualModelRouter {
    /// Build a router; regex conditions compile here so a bad pattern is a
    /// configuration error at startup, not at request time.
    pub fn new(
        mut rules: Vec<RoutingRule>,
        default_virtual_model: Option<String>,
        vm_defaults: HashMap<String, VmDefaults>,
        scheduler: Arc<Scheduler>,
    ) -> Result<Self> {
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut regexes = HashMap::new();
            for (index, condition) in rule.conditions.iter().enumerate() {
                if condition.operator == Operator::Regex {
                    let pattern = condition.value.as_str().ok_or_else(|| {
                        PipelineError::new(
                            ErrorCode::INVALID_CONFIG,
                            format!("rule '{}': regex value must be a string", rule.rule_id),
                        )
                    })?;
                    let regex = Regex::new(pattern).map_err(|e| {
                        PipelineError::new(
                            ErrorCode::INVALID_CONFIG,
                            format!("rule '{}': bad regex: {}", rule.rule_id, e),
                        )
                    })?;
                    regexes.insert(index, regex);
                }
            }
            compiled.push(CompiledRule { rule, regexes });
        }
        Ok(Self {
            rules: compiled,
            default_virtual_model,
            vm_defaults,
            scheduler,
        })
    }

    /// Resolve the virtual model for a request.
    pub fn resolve(&self, request: &GatewayRequest) -> Result<String> {
        if let Some(vm) = request.headers.get(VIRTUAL_MODEL_HEADER) {
            return Ok(vm.clone());
        }
        if let Some(vm) = request.body.get("virtualModel").and_then(|v| v.as_str()) {
            return Ok(vm.to_string());
        }

        for compiled in &self.rules {
            if !compiled.rule.enabled {
                continue;
            }
            if self.matches(compiled, request) {
                return self.select_virtual_model(&compiled.rule);
            }
        }

        self.default_virtual_model.clone().ok_or_else(|| {
            PipelineError::new(
                ErrorCode::PIPELINE_SELECTION_FAILED,
                format!("no routing rule matched {} {}", request.method, request.path),
            )
        })
    }

    /// Resolve, then execute through the scheduler with the virtual model's
    /// assembly defaults.
    pub async fn route_and_execute(
        &self,
        request: GatewayRequest,
        mut options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let virtual_model = self.resolve(&request)?;
        if let Some(defaults) = self.vm_defaults.get(&virtual_model) {
            options.timeout = options.timeout.or(defaults.timeout);
            options.max_retries = options.max_retries.or(defaults.max_retries);
        }
        let payload = Payload::new(request.dialect(), request.body);
        self.scheduler
            .execute(&virtual_model, payload, options)
            .await
    }

    fn matches(&self, compiled: &CompiledRule, request: &GatewayRequest) -> bool {
        compiled
            .rule
            .conditions
            .iter()
            .enumerate()
            .all(|(index, condition)| {
                let field = lookup_field(request, &condition.field);
                evaluate(condition, field.as_ref(), compiled.regexes.get(&index))
            })
    }

    fn select_virtual_model(&self, rule: &RoutingRule) -> Result<String> {
        let selection = &rule.pipeline_selection;
        if selection.strategy.as_deref() == Some("weighted") && !selection.weights.is_empty() {
            let total: u32 = selection.weights.values().sum();
            if total > 0 {
                let mut roll = fastrand::u32(..total);
                for (vm, weight) in &selection.weights {
                    if roll < *weight {
                        return Ok(vm.clone());
                    }
                    roll -= weight;
                }
            }
        }
        selection.virtual_model.clone().ok_or_else(|| {
            PipelineError::new(
                ErrorCode::PIPELINE_SELECTION_FAILED,
                format!("rule '{}' selects no virtual model", rule.rule_id),
            )
        })
    }
}

/// Pull the addressed field out of the request as a JSON value.
fn lookup_field(request: &GatewayRequest, field: &str) -> Option<Value> {
    match field {
        "path" => Some(Value::String(request.path.clone())),
        "method" => Some(Value::String(request.method.to_uppercase())),
        _ => {
            if let Some(name) = field.strip_prefix("header.") {
                return request
                    .headers
                    .get(&name.to_lowercase())
                    .map(|v| Value::String(v.clone()));
            }
            if let Some(path) = field.strip_prefix("body.") {
                let mut current = &request.body;
                for segment in path.split('.') {
                    current = current.get(segment)?;
                }
                return Some(current.clone());
            }
            None
        }
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evaluate(condition: &RuleCondition, field: Option<&Value>, regex: Option<&Regex>) -> bool {
    let Some(field) = field else {
        // Absent fields only satisfy not_equals.
        return condition.operator == Operator::NotEquals;
    };
    match condition.operator {
        Operator::Equals => {
            if condition.field == "method" {
                value_as_string(field).eq_ignore_ascii_case(&value_as_string(&condition.value))
            } else {
                field == &condition.value
            }
        }
        Operator::NotEquals => field != &condition.value,
        Operator::Contains => match (field, &condition.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        Operator::Regex => regex.is_some_and(|r| r.is_match(&value_as_string(field))),
        Operator::In => condition
            .value
            .as_array()
            .is_some_and(|options| options.contains(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::instance::{PipelineInstance, Target};
    use crate::stages::{MockOutcome, MockProviderStage};
    use serde_json::json;

    async fn scheduler_with_vm(vm: &str) -> Arc<Scheduler> {
        let mut config = SchedulerConfig::default();
        config.load_balancing.health_check.enabled = false;
        let scheduler = Scheduler::builder(config).build().unwrap();
        let instance = Arc::new(PipelineInstance::new(
            format!("{}-0", vm),
            vm,
            Target {
                provider_id: "mockai".into(),
                model_id: "m".into(),
                credential_index: 0,
            },
            vec![Arc::new(MockProviderStage::new(
                "mock",
                vec![MockOutcome::reply(json!({ "ok": true }))],
            ))],
            1,
            8,
        ));
        scheduler.create_pipeline(instance).await.unwrap();
        scheduler
    }

    fn rule(raw: Value) -> RoutingRule {
        serde_json::from_value(raw).unwrap()
    }

    async fn router(rules: Vec<RoutingRule>, default: Option<&str>) -> VirtualModelRouter {
        let scheduler = scheduler_with_vm("gpt-4o-vm").await;
        VirtualModelRouter::new(
            rules,
            default.map(String::from),
            HashMap::new(),
            scheduler,
        )
        .unwrap()
    }

    fn chat_request() -> GatewayRequest {
        GatewayRequest::new(
            "POST",
            "/v1/chat/completions",
            json!({ "model": "gpt-4o", "messages": [] }),
        )
    }

    #[tokio::test]
    async fn test_header_override_wins() {
        let router = router(
            vec![rule(json!({
                "ruleId": "all",
                "conditions": [],
                "pipelineSelection": { "virtualModel": "rule-vm" },
            }))],
            None,
        )
        .await;

        let request = chat_request().with_header("X-Virtual-Model", "override-vm");
        assert_eq!(router.resolve(&request).unwrap(), "override-vm");
    }

    #[tokio::test]
    async fn test_body_field_override() {
        let router = router(vec![], Some("default-vm")).await;
        let request = GatewayRequest::new(
            "POST",
            "/v1/chat/completions",
            json!({ "virtualModel": "body-vm" }),
        );
        assert_eq!(router.resolve(&request).unwrap(), "body-vm");
    }

    #[tokio::test]
    async fn test_rules_evaluate_by_priority() {
        let router = router(
            vec![
                rule(json!({
                    "ruleId": "low",
                    "priority": 1,
                    "conditions": [],
                    "pipelineSelection": { "virtualModel": "low-vm" },
                })),
                rule(json!({
                    "ruleId": "high",
                    "priority": 10,
                    "conditions": [],
                    "pipelineSelection": { "virtualModel": "high-vm" },
                })),
            ],
            None,
        )
        .await;
        assert_eq!(router.resolve(&chat_request()).unwrap(), "high-vm");
    }

    #[tokio::test]
    async fn test_disabled_rules_are_skipped() {
        let router = router(
            vec![rule(json!({
                "ruleId": "off",
                "enabled": false,
                "conditions": [],
                "pipelineSelection": { "virtualModel": "off-vm" },
            }))],
            Some("default-vm"),
        )
        .await;
        assert_eq!(router.resolve(&chat_request()).unwrap(), "default-vm");
    }

    #[tokio::test]
    async fn test_condition_operators() {
        let router = router(
            vec![rule(json!({
                "ruleId": "ops",
                "conditions": [
                    { "field": "method", "operator": "equals", "value": "post" },
                    { "field": "path", "operator": "contains", "value": "/chat/" },
                    { "field": "body.model", "operator": "regex", "value": "^gpt-4" },
                    { "field": "body.model", "operator": "in", "value": ["gpt-4o", "gpt-4-turbo"] },
                    { "field": "body.missing", "operator": "not_equals", "value": "x" },
                ],
                "pipelineSelection": { "virtualModel": "matched-vm" },
            }))],
            Some("default-vm"),
        )
        .await;

        assert_eq!(router.resolve(&chat_request()).unwrap(), "matched-vm");

        let other = GatewayRequest::new(
            "POST",
            "/v1/chat/completions",
            json!({ "model": "claude-3", "messages": [] }),
        );
        assert_eq!(router.resolve(&other).unwrap(), "default-vm");
    }

    #[tokio::test]
    async fn test_no_match_without_default_is_3005() {
        let router = router(vec![], None).await;
        let err = router.resolve(&chat_request()).unwrap_err();
        assert_eq!(err.code, ErrorCode::PIPELINE_SELECTION_FAILED);
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_bad_regex_is_config_error_at_build() {
        let scheduler = scheduler_with_vm("vm").await;
        let err = VirtualModelRouter::new(
            vec![rule(json!({
                "ruleId": "broken",
                "conditions": [
                    { "field": "path", "operator": "regex", "value": "(unclosed" },
                ],
                "pipelineSelection": { "virtualModel": "vm" },
            }))],
            None,
            HashMap::new(),
            scheduler,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_CONFIG);
    }

    #[tokio::test]
    async fn test_weighted_selection_stays_within_weights() {
        let router = router(
            vec![rule(json!({
                "ruleId": "split",
                "conditions": [],
                "pipelineSelection": {
                    "strategy": "weighted",
                    "weights": { "vm-a": 3, "vm-b": 1 },
                },
            }))],
            None,
        )
        .await;
        for _ in 0..50 {
            let vm = router.resolve(&chat_request()).unwrap();
            assert!(vm == "vm-a" || vm == "vm-b");
        }
    }

    #[tokio::test]
    async fn test_route_and_execute_end_to_end() {
        let scheduler = scheduler_with_vm("gpt-4o-vm").await;
        let router = VirtualModelRouter::new(
            vec![rule(json!({
                "ruleId": "chat",
                "conditions": [
                    { "field": "path", "operator": "equals", "value": "/v1/chat/completions" },
                ],
                "pipelineSelection": { "virtualModel": "gpt-4o-vm" },
            }))],
            None,
            HashMap::new(),
            scheduler,
        )
        .unwrap();

        let result = router
            .route_and_execute(chat_request(), ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.virtual_model, "gpt-4o-vm");
        assert_eq!(result.instance_id, "gpt-4o-vm-0");
    }
}
