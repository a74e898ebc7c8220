//! Compatibility stage: declarative per-provider field mapping.
//!
//! Provider families disagree on field names and defaults even within one
//! dialect. This stage applies a mapping table — rename, drop, default —
//! to the request on the way down and to buffered responses on the way up.
//! Paths are dot-separated; intermediate objects are created on insert.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::payload::{Payload, Reply};
use crate::stage::Stage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One mapping operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FieldMapping {
    /// Move the value at `from` to `to`. No-op when `from` is absent.
    Rename { from: String, to: String },
    /// Remove the field. No-op when absent.
    Drop { field: String },
    /// Insert `value` when the field is absent.
    Default { field: String, value: Value },
}

fn take_path(body: &mut Value, path: &str) -> Option<Value> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop()?;
    let mut current = body;
    for segment in segments {
        current = current.get_mut(segment)?;
    }
    current.as_object_mut()?.remove(last)
}

fn set_path(body: &mut Value, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut current = body;
    for segment in segments {
        if !current.get(segment).is_some_and(|v| v.is_object()) {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(segment.to_string(), Value::Object(Map::new()));
            } else {
                return;
            }
        }
        current = match current.get_mut(segment) {
            Some(next) => next,
            None => return,
        };
    }
    if let Some(obj) = current.as_object_mut() {
        obj.insert(last.to_string(), value);
    }
}

fn get_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Apply a mapping table to a JSON body in declared order.
pub fn apply_mappings(body: &mut Value, mappings: &[FieldMapping]) {
    for mapping in mappings {
        match mapping {
            FieldMapping::Rename { from, to } => {
                if let Some(value) = take_path(body, from) {
                    set_path(body, to, value);
                }
            }
            FieldMapping::Drop { field } => {
                take_path(body, field);
            }
            FieldMapping::Default { field, value } => {
                if get_path(body, field).is_none() {
                    set_path(body, field, value.clone());
                }
            }
        }
    }
}

/// Applies field mappings for one provider family.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityStage {
    name: String,
    request_mappings: Vec<FieldMapping>,
    response_mappings: Vec<FieldMapping>,
}

impl CompatibilityStage {
    pub fn new(
        name: impl Into<String>,
        request_mappings: Vec<FieldMapping>,
        response_mappings: Vec<FieldMapping>,
    ) -> Self {
        Self {
            name: name.into(),
            request_mappings,
            response_mappings,
        }
    }
}

#[async_trait]
impl Stage for CompatibilityStage {
    fn kind(&self) -> &'static str {
        "compatibility"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, _ctx: &ExecutionContext, mut payload: Payload) -> Result<Payload> {
        apply_mappings(&mut payload.body, &self.request_mappings);
        Ok(payload)
    }

    async fn process_response(&self, _ctx: &ExecutionContext, reply: Reply) -> Result<Reply> {
        match reply {
            Reply::Complete(mut body) => {
                apply_mappings(&mut body, &self.response_mappings);
                Ok(Reply::Complete(body))
            }
            // Frame payloads are provider-shaped deltas; mapping tables
            // target buffered bodies only.
            stream => Ok(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rename_moves_value() {
        let mut body = json!({ "max_tokens": 100 });
        apply_mappings(
            &mut body,
            &[FieldMapping::Rename {
                from: "max_tokens".into(),
                to: "max_completion_tokens".into(),
            }],
        );
        assert_eq!(body["max_completion_tokens"], 100);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_rename_missing_field_is_noop() {
        let mut body = json!({ "model": "m" });
        apply_mappings(
            &mut body,
            &[FieldMapping::Rename {
                from: "absent".into(),
                to: "elsewhere".into(),
            }],
        );
        assert_eq!(body, json!({ "model": "m" }));
    }

    #[test]
    fn test_drop_removes_nested_field() {
        let mut body = json!({ "options": { "logprobs": true, "seed": 7 } });
        apply_mappings(
            &mut body,
            &[FieldMapping::Drop {
                field: "options.logprobs".into(),
            }],
        );
        assert_eq!(body, json!({ "options": { "seed": 7 } }));
    }

    #[test]
    fn test_default_only_fills_missing() {
        let mut body = json!({ "temperature": 0.9 });
        apply_mappings(
            &mut body,
            &[
                FieldMapping::Default {
                    field: "temperature".into(),
                    value: json!(0.5),
                },
                FieldMapping::Default {
                    field: "top_p".into(),
                    value: json!(1.0),
                },
            ],
        );
        assert_eq!(body["temperature"], 0.9);
        assert_eq!(body["top_p"], 1.0);
    }

    #[test]
    fn test_rename_creates_intermediate_objects() {
        let mut body = json!({ "seed": 42 });
        apply_mappings(
            &mut body,
            &[FieldMapping::Rename {
                from: "seed".into(),
                to: "options.seed".into(),
            }],
        );
        assert_eq!(body["options"]["seed"], 42);
    }

    #[test]
    fn test_mapping_wire_format() {
        let mappings: Vec<FieldMapping> = serde_json::from_value(json!([
            { "op": "rename", "from": "a", "to": "b" },
            { "op": "drop", "field": "c" },
            { "op": "default", "field": "d", "value": 1 },
        ]))
        .unwrap();
        assert_eq!(mappings.len(), 3);
        assert_eq!(
            mappings[0],
            FieldMapping::Rename {
                from: "a".into(),
                to: "b".into()
            }
        );
    }

    #[tokio::test]
    async fn test_stage_applies_request_and_response_tables() {
        let stage = CompatibilityStage::new(
            "compat",
            vec![FieldMapping::Drop {
                field: "logit_bias".into(),
            }],
            vec![FieldMapping::Default {
                field: "object".into(),
                value: json!("chat.completion"),
            }],
        );
        let ctx = ExecutionContext::builder("vm").build();

        let payload = Payload::openai(json!({ "model": "m", "logit_bias": {} }));
        let out = stage.process(&ctx, payload).await.unwrap();
        assert!(out.body.get("logit_bias").is_none());

        let reply = stage
            .process_response(&ctx, Reply::Complete(json!({ "choices": [] })))
            .await
            .unwrap();
        let body = reply.into_complete().unwrap();
        assert_eq!(body["object"], "chat.completion");
    }
}
