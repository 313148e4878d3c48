//! Registry con los plugins de referencia registrados.

use elspeth_core::plugin::PluginRegistry;

use crate::gates::ConditionGate;
use crate::sinks::{JsonlSink, MemorySink, NullSink};
use crate::sources::{JsonlSource, StaticSource};
use crate::transforms::{BatchStatsTransform, FlakyTransform, PassthroughTransform, SetFieldsTransform, SplitTransform};

/// Registra el set de adapters de referencia. La CLI parte de acá; los
/// deployments agregan los suyos encima.
pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();

    registry.register_source("static", StaticSource::from_options);
    registry.register_source("jsonl", JsonlSource::from_options);

    registry.register_transform("passthrough", PassthroughTransform::from_options);
    registry.register_transform("set_fields", SetFieldsTransform::from_options);
    registry.register_transform("split", SplitTransform::from_options);
    registry.register_transform("flaky", FlakyTransform::from_options);
    registry.register_transform("batch_stats", BatchStatsTransform::from_options);

    registry.register_gate("condition", ConditionGate::from_options);

    registry.register_sink("memory", MemorySink::from_options);
    registry.register_sink("jsonl", JsonlSink::from_options);
    registry.register_sink("null", NullSink::from_options);

    registry
}
