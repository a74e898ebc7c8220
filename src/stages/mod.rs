//! Built-in stage kinds.
//!
//! A pipeline instance composes these in template order:
//!
//! ```text
//! request ──► protocol-switch ──► workflow ──► compatibility ──► provider ──► upstream
//!                   ▲                ▲              ▲               │
//! response ◄────────┴────────────────┴──────────────┴───────────────┘
//! ```
//!
//! [`MockProviderStage`] substitutes for the provider stage in tests.

pub mod compat;
pub mod mock;
pub mod protocol;
pub mod provider;
pub mod sse;
pub mod workflow;

pub use compat::{CompatibilityStage, FieldMapping};
pub use mock::{MockOutcome, MockProviderStage, MockResult};
pub use protocol::ProtocolSwitchStage;
pub use provider::{ProviderAuth, ProviderStage};
pub use sse::SseDecoder;
pub use workflow::WorkflowStage;
