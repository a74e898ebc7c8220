//! # LLM Gateway
//!
//! Virtual-model request gateway for LLM providers: pipeline assembly,
//! load balancing, error-driven failover, and streaming transcoding.
//!
//! A **virtual model** is a logical model id clients address; the
//! **scheduler** resolves it to one of several concrete
//! (provider, model, credential) targets, each served by a **pipeline
//! instance** — an ordered chain of stages (protocol switch → workflow →
//! compatibility → provider I/O). Failures are classified by a numeric
//! error taxonomy; the **error response center** picks a recovery action
//! (retry, failover, blacklist, maintenance) that the scheduler applies
//! under a single monotonic deadline.
//!
//! ## Core Concepts
//!
//! - **[`Scheduler`]** — owns the instance pool per virtual model and runs
//!   execute-with-retry.
//! - **[`PipelineInstance`]** — one assembled stage chain bound to one
//!   target; tracks state, health, and metrics.
//! - **[`Stage`]** — one transform layer with a down-path and an up-path.
//! - **[`ErrorCenter`]** — classifies failures and produces recovery
//!   actions.
//! - **[`Assembler`]** — materializes instances from a declarative assembly
//!   table.
//! - **[`VirtualModelRouter`]** — resolves incoming requests to a virtual
//!   model and feeds the scheduler.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_gateway::{
//!     Assembler, AssemblyTable, ExecutionOptions, Payload, Scheduler,
//!     SchedulerConfig, StageRegistry,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = Scheduler::builder(SchedulerConfig::default()).build()?;
//!
//!     let table = AssemblyTable::from_json(r#"{
//!         "version": "1.0",
//!         "pipelineTemplates": [{
//!             "templateId": "gpt-4o-vm",
//!             "targets": [{ "providerId": "openai", "modelId": "gpt-4o" }],
//!             "moduleAssembly": {
//!                 "moduleInstances": [
//!                     { "name": "proto", "kind": "protocol-switch",
//!                       "config": { "client": "openai", "upstream": "openai" } },
//!                     { "name": "wf", "kind": "workflow",
//!                       "config": { "dialect": "openai" } },
//!                     { "name": "io", "kind": "provider",
//!                       "config": { "baseUrl": "https://api.openai.com",
//!                                   "auth": { "type": "api-keys", "keys": ["sk-..."] } } }
//!                 ]
//!             }
//!         }]
//!     }"#)?;
//!
//!     let assembler = Assembler::new(StageRegistry::with_defaults());
//!     let report = assembler.assemble(&table, &scheduler).await;
//!     assert!(report.failures.is_empty());
//!
//!     let payload = Payload::openai(json!({
//!         "model": "gpt-4o-vm",
//!         "messages": [{ "role": "user", "content": "hi" }],
//!     }));
//!     let result = scheduler
//!         .execute("gpt-4o-vm", payload, ExecutionOptions::default())
//!         .await?;
//!     println!("served by {} after {} retries", result.instance_id, result.retry_count);
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod balancer;
pub mod blacklist;
pub mod config;
pub mod context;
pub mod error;
pub mod error_center;
pub mod events;
pub mod instance;
pub mod metrics;
pub mod payload;
pub mod router;
pub mod scheduler;
pub mod stage;
pub mod stages;
pub mod token_cache;

pub use assembler::{Assembler, AssemblyReport, AssemblyTable, StageRegistry};
pub use balancer::LoadBalancer;
pub use blacklist::{BlacklistEntry, BlacklistRegistry};
pub use config::{SchedulerConfig, StrategyKind};
pub use context::ExecutionContext;
pub use error::{ErrorCategory, ErrorCode, PipelineError, Result, Severity};
pub use error_center::{ErrorAction, ErrorCenter};
pub use events::{Event, EventHandler, FnEventHandler};
pub use instance::{InstanceState, InstanceStatus, PipelineInstance, Target};
pub use metrics::{HealthStatus, InstanceMetrics, MetricsSnapshot};
pub use payload::{Dialect, Payload, Reply, SseFrame};
pub use router::{GatewayRequest, RoutingRule, VirtualModelRouter};
pub use scheduler::{ExecutionOptions, ExecutionResult, Scheduler, SchedulerStats};
pub use stage::Stage;
pub use token_cache::TokenCache;
