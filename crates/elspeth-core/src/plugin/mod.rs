//! Contrato de plugins consumido por el engine (C1).

pub mod context;
pub mod error;
pub mod registry;
pub mod result;
pub mod traits;

pub use context::PluginContext;
pub use error::{PluginError, PluginErrorKind};
pub use registry::PluginRegistry;
pub use result::{ErrorType, GateDecision, SinkAck, SourcePoll, SuccessReason, TransformErrorReason, TransformResult};
pub use traits::{Determinism, ErrorDisposition, GatePlugin, RouteTarget, SinkPlugin, SourcePlugin, TransformPlugin};
