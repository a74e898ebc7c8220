//! Pipeline assembler: declarative assembly table → registered instances.
//!
//! The assembly table carries routing rules (consumed by the router),
//! pipeline templates, and a module registry. For each template the
//! assembler validates every declared module against the stage registry,
//! wires the stages in connection order, builds one instance per target,
//! initializes it, and registers it with the scheduler. A bad template is
//! fatal for that virtual-model entry only; the rest still assemble.

use crate::error::{ErrorCode, PipelineError, Result};
use crate::instance::{PipelineInstance, Target};
use crate::payload::Dialect;
use crate::router::RoutingRule;
use crate::scheduler::Scheduler;
use crate::stage::Stage;
use crate::stages::{
    CompatibilityStage, FieldMapping, MockOutcome, MockProviderStage, ProtocolSwitchStage,
    ProviderAuth, ProviderStage, WorkflowStage,
};
use crate::token_cache::TokenCache;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Top-level assembly table, as written by operators (camelCase JSON).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyTable {
    pub version: String,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub pipeline_templates: Vec<PipelineTemplate>,
    #[serde(default)]
    pub module_registry: Vec<ModuleRegistryEntry>,
}

impl AssemblyTable {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            PipelineError::new(
                ErrorCode::INVALID_CONFIG,
                format!("assembly table parse failure: {}", e),
            )
        })
    }
}

/// Declares a stage kind available to templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRegistryEntry {
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

/// One virtual model's template: stage chain plus its concrete targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTemplate {
    /// Doubles as the virtual-model id.
    pub template_id: String,
    #[serde(default)]
    pub base_config: BaseConfig,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    pub module_assembly: ModuleAssembly,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseConfig {
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub max_concurrent_per_instance: Option<usize>,
}

/// One concrete upstream for a template.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default)]
    pub credential_index: usize,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleAssembly {
    pub module_instances: Vec<ModuleInstanceSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInstanceSpec {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub from: String,
    pub to: String,
}

/// Everything a factory needs to build one stage.
pub struct StageBuildContext<'a> {
    pub name: &'a str,
    pub config: &'a Value,
    pub target: &'a TargetSpec,
}

type StageFactory = Arc<dyn Fn(&StageBuildContext<'_>) -> Result<Arc<dyn Stage>> + Send + Sync>;

/// Factory map from stage kind to constructor.
#[derive(Clone)]
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn config_error(message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorCode::INVALID_CONFIG, message)
}

fn parse_dialect(config: &Value, key: &str) -> Result<Dialect> {
    match config.get(key).and_then(|v| v.as_str()) {
        Some("openai") => Ok(Dialect::OpenAi),
        Some("anthropic") => Ok(Dialect::Anthropic),
        Some("unknown") | None => Ok(Dialect::Unknown),
        Some(other) => Err(config_error(format!("unknown dialect '{}'", other))),
    }
}

fn parse_mappings(config: &Value, key: &str) -> Result<Vec<FieldMapping>> {
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| config_error(format!("bad field mapping table '{}': {}", key, e))),
    }
}

fn parse_auth(config: &Value) -> Result<ProviderAuth> {
    let auth = match config.get("auth") {
        None => return Ok(ProviderAuth::None),
        Some(auth) => auth,
    };
    match auth.get("type").and_then(|v| v.as_str()) {
        Some("none") | None => Ok(ProviderAuth::None),
        Some("api-keys") => {
            let keys: Vec<String> = auth
                .get("keys")
                .and_then(|v| v.as_array())
                .map(|keys| {
                    keys.iter()
                        .filter_map(|k| k.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            if keys.is_empty() {
                return Err(config_error("auth.keys must hold at least one key"));
            }
            Ok(ProviderAuth::ApiKeys(keys))
        }
        Some("oauth") => {
            let dir = auth
                .get("cacheDir")
                .and_then(|v| v.as_str())
                .ok_or_else(|| config_error("oauth auth requires cacheDir"))?;
            Ok(ProviderAuth::OAuth {
                cache: TokenCache::new(dir),
                token_endpoint: auth
                    .get("tokenEndpoint")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                client_id: auth.get("clientId").and_then(|v| v.as_str()).map(String::from),
            })
        }
        Some(other) => Err(config_error(format!("unknown auth type '{}'", other))),
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the four built-in stage kinds plus the mock provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register("protocol-switch", |ctx| {
            let client = parse_dialect(ctx.config, "client")?;
            let upstream = parse_dialect(ctx.config, "upstream")?;
            Ok(Arc::new(ProtocolSwitchStage::new(ctx.name, client, upstream)) as Arc<dyn Stage>)
        });

        registry.register("workflow", |ctx| {
            let dialect = parse_dialect(ctx.config, "dialect")?;
            let upstream_streaming = ctx
                .config
                .get("upstreamStreaming")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(Arc::new(WorkflowStage::new(ctx.name, dialect, upstream_streaming)) as Arc<dyn Stage>)
        });

        registry.register("compatibility", |ctx| {
            let request = parse_mappings(ctx.config, "requestMappings")?;
            let response = parse_mappings(ctx.config, "responseMappings")?;
            Ok(Arc::new(CompatibilityStage::new(ctx.name, request, response)) as Arc<dyn Stage>)
        });

        registry.register("provider", |ctx| {
            let base_url = ctx
                .config
                .get("baseUrl")
                .and_then(|v| v.as_str())
                .ok_or_else(|| config_error("provider stage requires baseUrl"))?;
            let path = ctx
                .config
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or("/v1/chat/completions");
            let auth = parse_auth(ctx.config)?;
            let mut stage = ProviderStage::new(
                ctx.name,
                ctx.target.provider_id.clone(),
                base_url,
                path,
                auth,
            )
            .with_credential_index(ctx.target.credential_index);
            if let Some(headers) = ctx.config.get("headers").and_then(|v| v.as_object()) {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        stage = stage.with_header(name.clone(), value);
                    }
                }
            }
            Ok(Arc::new(stage) as Arc<dyn Stage>)
        });

        registry.register("mock-provider", |ctx| {
            let replies = ctx
                .config
                .get("replies")
                .and_then(|v| v.as_array())
                .ok_or_else(|| config_error("mock-provider stage requires replies"))?;
            if replies.is_empty() {
                return Err(config_error("mock-provider replies must be non-empty"));
            }
            let script = replies.iter().cloned().map(MockOutcome::reply).collect();
            Ok(Arc::new(MockProviderStage::new(ctx.name, script)) as Arc<dyn Stage>)
        });

        registry
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(&StageBuildContext<'_>) -> Result<Arc<dyn Stage>> + Send + Sync + 'static,
    ) {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn build(&self, kind: &str, ctx: &StageBuildContext<'_>) -> Result<Arc<dyn Stage>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| config_error(format!("unregistered stage kind '{}'", kind)))?;
        factory(ctx)
    }
}

/// Per-virtual-model execution defaults extracted from `baseConfig`.
#[derive(Debug, Clone, Default)]
pub struct VmDefaults {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

/// What one `assemble` run produced.
#[derive(Debug, Default)]
pub struct AssemblyReport {
    /// Instance ids registered with the scheduler.
    pub registered: Vec<String>,
    /// Templates that failed, with the failure. Non-fatal for the rest.
    pub failures: Vec<(String, PipelineError)>,
    /// Per-virtual-model execution defaults for the router.
    pub vm_defaults: HashMap<String, VmDefaults>,
}

/// Materializes assembly tables into scheduler-registered instances.
#[derive(Debug)]
pub struct Assembler {
    registry: StageRegistry,
}

impl Assembler {
    pub fn new(registry: StageRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Assemble every template; per-template failures are isolated.
    pub async fn assemble(&self, table: &AssemblyTable, scheduler: &Scheduler) -> AssemblyReport {
        let mut report = AssemblyReport::default();

        for template in &table.pipeline_templates {
            match self.assemble_template(template, table, scheduler).await {
                Ok(ids) => {
                    report.registered.extend(ids);
                    if template.base_config.timeout_ms.is_some()
                        || template.base_config.max_retries.is_some()
                    {
                        report.vm_defaults.insert(
                            template.template_id.clone(),
                            VmDefaults {
                                timeout: template.base_config.timeout_ms.map(Duration::from_millis),
                                max_retries: template.base_config.max_retries,
                            },
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        template = %template.template_id,
                        code = err.code.0,
                        "template assembly failed: {}",
                        err.message
                    );
                    report.failures.push((template.template_id.clone(), err));
                }
            }
        }
        report
    }

    async fn assemble_template(
        &self,
        template: &PipelineTemplate,
        table: &AssemblyTable,
        scheduler: &Scheduler,
    ) -> Result<Vec<String>> {
        if template.base_config.timeout_ms == Some(0) {
            return Err(PipelineError::new(
                ErrorCode::INVALID_TIMEOUT,
                format!("template '{}' declares a zero timeout", template.template_id),
            ));
        }
        if template.targets.is_empty() {
            return Err(config_error(format!(
                "template '{}' declares no targets",
                template.template_id
            )));
        }

        let ordered = order_modules(&template.module_assembly)?;
        for spec in &ordered {
            // Kinds must be declared in the table's registry (when present)
            // and constructible here.
            if !table.module_registry.is_empty()
                && !table.module_registry.iter().any(|e| e.kind == spec.kind)
            {
                return Err(config_error(format!(
                    "stage kind '{}' missing from moduleRegistry",
                    spec.kind
                )));
            }
            if !self.registry.contains(&spec.kind) {
                return Err(config_error(format!(
                    "stage kind '{}' has no registered factory",
                    spec.kind
                )));
            }
        }

        let max_concurrent = template
            .base_config
            .max_concurrent_per_instance
            .unwrap_or(8);

        let mut registered = Vec::new();
        for (index, target) in template.targets.iter().enumerate() {
            let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(ordered.len());
            for spec in &ordered {
                let ctx = StageBuildContext {
                    name: &spec.name,
                    config: &spec.config,
                    target,
                };
                stages.push(self.registry.build(&spec.kind, &ctx)?);
            }

            let instance_id = format!(
                "{}-{}-{}",
                template.template_id, target.provider_id, index
            );
            let instance = Arc::new(PipelineInstance::new(
                instance_id.clone(),
                template.template_id.clone(),
                Target {
                    provider_id: target.provider_id.clone(),
                    model_id: target.model_id.clone(),
                    credential_index: target.credential_index,
                },
                stages,
                target.weight,
                max_concurrent,
            ));
            scheduler.create_pipeline(instance).await?;
            registered.push(instance_id);
        }
        Ok(registered)
    }
}

/// Resolve the stage order: follow `connections` when given (a linear
/// chain), else the declared `moduleInstances` order.
fn order_modules(assembly: &ModuleAssembly) -> Result<Vec<ModuleInstanceSpec>> {
    let by_name: HashMap<&str, &ModuleInstanceSpec> = assembly
        .module_instances
        .iter()
        .map(|m| (m.name.as_str(), m))
        .collect();
    if by_name.len() != assembly.module_instances.len() {
        return Err(config_error("duplicate module instance names"));
    }

    if assembly.connections.is_empty() {
        return Ok(assembly.module_instances.clone());
    }

    for connection in &assembly.connections {
        if !by_name.contains_key(connection.from.as_str()) {
            return Err(config_error(format!(
                "connection references unknown module '{}'",
                connection.from
            )));
        }
        if !by_name.contains_key(connection.to.as_str()) {
            return Err(config_error(format!(
                "connection references unknown module '{}'",
                connection.to
            )));
        }
    }

    // The chain head is the one module never appearing as a `to`.
    let mut next: HashMap<&str, &str> = HashMap::new();
    for connection in &assembly.connections {
        if next
            .insert(connection.from.as_str(), connection.to.as_str())
            .is_some()
        {
            return Err(config_error(format!(
                "module '{}' has more than one outgoing connection",
                connection.from
            )));
        }
    }
    let head = assembly
        .module_instances
        .iter()
        .map(|m| m.name.as_str())
        .find(|name| !assembly.connections.iter().any(|c| c.to == *name))
        .ok_or_else(|| config_error("connections form a cycle"))?;

    let mut ordered = Vec::with_capacity(assembly.module_instances.len());
    let mut current = Some(head);
    let mut seen = std::collections::HashSet::new();
    while let Some(name) = current {
        if !seen.insert(name) {
            return Err(config_error("connections form a cycle"));
        }
        ordered.push((*by_name[name]).clone());
        current = next.get(name).copied();
    }
    if ordered.len() != assembly.module_instances.len() {
        return Err(config_error(
            "connections do not link every module into one chain",
        ));
    }
    Ok(ordered)
}
