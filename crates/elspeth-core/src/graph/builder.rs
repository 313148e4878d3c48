//! Construcción del pipeline: de plugins instanciados + settings al grafo
//! validado y sus ejecutores de nodo.
//!
//! Orden de ensamblado (posiciones secuenciales con edges MOVE "continue"):
//! source → transforms (con aggregations tejidas a continuación) → gates →
//! coalesce → default_sink. Las rutas de gate se vuelven edges etiquetados a
//! su sink o a "continue"; los branches de fork se vuelven edges COPY hacia
//! el coalesce que declara el branch o hacia el sink homónimo (branch sin
//! match: error de construcción con los candidatos disponibles).
//! `on_validation_failure` / `on_error` crean edges DIVERT.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{CoalesceStrategySettings, PipelineSettings};
use crate::constants::{error_label, CONTINUE_LABEL, QUARANTINE_LABEL};
use crate::errors::ConfigError;
use crate::plugin::{ErrorDisposition, GatePlugin, PluginRegistry, RouteTarget, SinkPlugin, SourcePlugin,
                    TransformPlugin};

use super::validate::validate;
use super::{EdgeMode, ExecutionGraph, GraphEdge, GraphNode, NodeKind};

/// Disparador de flush de una aggregation (cualquiera que ocurra primero).
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    pub count: Option<usize>,
    pub size_bytes: Option<usize>,
    pub interval: Option<Duration>,
}

/// Política de cierre de una barrera de coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceStrategy {
    /// Espera todos los branches declarados; deadline vencido = fallo
    /// COALESCE_TIMED_OUT, nunca un hang.
    RequireAll,
    /// Fusiona lo que haya llegado al vencer el deadline.
    BestEffort,
    /// Cierra cuando llegaron todos (o venció el deadline); gana el payload
    /// de la primera llegada.
    FirstComplete,
    /// Cierra al alcanzar el umbral; llegadas tardías quedan COALESCED pero
    /// no son padres del token fusionado.
    Quorum(usize),
}

#[derive(Debug, Clone)]
pub struct CoalescePolicy {
    pub branches: Vec<String>,
    pub strategy: CoalesceStrategy,
    pub timeout: Duration,
}

/// Ejecutor runtime de un nodo. El grafo es estructura pura; las instancias
/// de plugin viven aquí, compartidas entre workers.
pub enum NodeExecutor {
    Transform {
        plugin: Box<dyn TransformPlugin>,
        on_error: ErrorDisposition,
    },
    Aggregation {
        plugin: Box<dyn TransformPlugin>,
        trigger: Trigger,
    },
    Gate {
        plugin: Box<dyn GatePlugin>,
    },
    Coalesce {
        policy: CoalescePolicy,
    },
    Sink {
        plugin: Mutex<Box<dyn SinkPlugin>>,
        idempotent: bool,
    },
}

/// Pipeline construido: grafo validado + ejecutores + la fuente.
pub struct BuiltPipeline {
    pub graph: ExecutionGraph,
    pub executors: HashMap<String, NodeExecutor>,
    pub source: Box<dyn SourcePlugin>,
    pub source_node_id: String,
    pub default_sink: String,
}

impl std::fmt::Debug for BuiltPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltPipeline")
            .field("graph", &self.graph)
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .field("source_node_id", &self.source_node_id)
            .field("default_sink", &self.default_sink)
            .finish()
    }
}

/// Builder del pipeline a partir de settings + registry.
pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_settings(settings: &PipelineSettings, registry: &PluginRegistry) -> Result<BuiltPipeline, ConfigError> {
        settings.validate()?;

        let mut graph = ExecutionGraph::new();
        let mut executors: HashMap<String, NodeExecutor> = HashMap::new();

        // --- source ---
        let source = registry.make_source(&settings.source.plugin, &settings.source.options)?;
        let source_id = source.name().to_string();
        graph.add_node(GraphNode { id: source_id.clone(),
                                   kind: NodeKind::Source,
                                   plugin_name: settings.source.plugin.clone(),
                                   config: settings.source.options.clone(),
                                   input_schema: None,
                                   output_schema: Some(source.output_schema().clone()) })?;

        // --- sinks ---
        for (sink_name, sink_settings) in &settings.sinks {
            let plugin = registry.make_sink(&sink_settings.plugin, &sink_settings.options)?;
            graph.add_node(GraphNode { id: sink_name.clone(),
                                       kind: NodeKind::Sink,
                                       plugin_name: sink_settings.plugin.clone(),
                                       config: sink_settings.options.clone(),
                                       input_schema: Some(plugin.input_schema().clone()),
                                       output_schema: None })?;
            let idempotent = plugin.idempotent();
            executors.insert(sink_name.clone(), NodeExecutor::Sink { plugin: Mutex::new(plugin), idempotent });
        }

        // --- posiciones secuenciales ---
        // `positions` junta transforms, aggregations, gates y coalesce en el
        // orden de ensamblado; después se encadenan con MOVE "continue".
        let mut positions: Vec<String> = vec![source_id.clone()];

        for t in &settings.transforms {
            let plugin = registry.make_transform(&t.plugin, &t.options)?;
            // Mismo fallback de id que los edges DIVERT: el nombre del plugin
            // en la config, no el que la instancia reporte.
            let id = t.name.clone().unwrap_or_else(|| t.plugin.clone());
            graph.add_node(GraphNode { id: id.clone(),
                                       kind: NodeKind::Transform,
                                       plugin_name: t.plugin.clone(),
                                       config: t.options.clone(),
                                       input_schema: Some(plugin.input_schema().clone()),
                                       output_schema: Some(plugin.output_schema().clone()) })?;
            let on_error = match &t.on_error {
                Some(s) => ErrorDisposition::from_config(s),
                None => plugin.on_error().cloned().unwrap_or(ErrorDisposition::Discard),
            };
            executors.insert(id.clone(), NodeExecutor::Transform { plugin, on_error });
            positions.push(id);
        }

        for a in &settings.aggregations {
            let plugin = registry.make_transform(&a.plugin, &a.options)?;
            graph.add_node(GraphNode { id: a.name.clone(),
                                       kind: NodeKind::Aggregation,
                                       plugin_name: a.plugin.clone(),
                                       config: a.options.clone(),
                                       input_schema: Some(plugin.input_schema().clone()),
                                       output_schema: Some(plugin.output_schema().clone()) })?;
            let trigger = Trigger { count: a.trigger.count,
                                    size_bytes: a.trigger.size_bytes,
                                    interval: a.trigger.interval_ms.map(Duration::from_millis) };
            executors.insert(a.name.clone(), NodeExecutor::Aggregation { plugin, trigger });
            positions.push(a.name.clone());
        }

        // Las rutas y branches salen del plugin instanciado, no de la config
        // cruda: el gate es quien declara su contrato de salida.
        let mut fork_gates: Vec<String> = Vec::new();
        let mut gate_decls: Vec<(String, Vec<(String, RouteTarget)>, Option<Vec<String>>)> = Vec::new();
        for g in &settings.gates {
            let gate_options = serde_json::to_value(g).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            let plugin = registry.make_gate("condition", &gate_options)?;
            graph.add_node(GraphNode { id: g.name.clone(),
                                       kind: NodeKind::Gate,
                                       plugin_name: "condition".to_string(),
                                       config: gate_options,
                                       input_schema: Some(plugin.input_schema().clone()),
                                       // Los gates no modifican la fila: pass-through.
                                       output_schema: Some(plugin.input_schema().clone()) })?;
            let declared_branches = plugin.fork_branches();
            gate_decls.push((g.name.clone(), plugin.routes(), declared_branches.clone()));
            executors.insert(g.name.clone(), NodeExecutor::Gate { plugin });
            if declared_branches.is_some() {
                fork_gates.push(g.name.clone());
            }
            positions.push(g.name.clone());
        }

        for c in &settings.coalesce {
            graph.add_node(GraphNode { id: c.name.clone(),
                                       kind: NodeKind::Coalesce,
                                       plugin_name: "coalesce".to_string(),
                                       config: serde_json::to_value(c).map_err(|e| ConfigError::Invalid(e.to_string()))?,
                                       input_schema: None,
                                       output_schema: None })?;
            let strategy = match c.strategy {
                CoalesceStrategySettings::RequireAll => CoalesceStrategy::RequireAll,
                CoalesceStrategySettings::BestEffort => CoalesceStrategy::BestEffort,
                CoalesceStrategySettings::FirstComplete => CoalesceStrategy::FirstComplete,
                CoalesceStrategySettings::Quorum { threshold } => CoalesceStrategy::Quorum(threshold),
            };
            let timeout = Duration::from_millis(c.timeout_ms.unwrap_or(settings.execution.coalesce_timeout_ms));
            executors.insert(c.name.clone(),
                             NodeExecutor::Coalesce { policy: CoalescePolicy { branches: c.branches.clone(),
                                                                               strategy,
                                                                               timeout } });
            positions.push(c.name.clone());
        }

        // --- continuación secuencial ---
        // Un fork gate no tiene edge de continuación: el padre termina FORKED
        // y los hijos viajan por los edges COPY.
        for pair in positions.windows(2) {
            if fork_gates.contains(&pair[0]) {
                continue;
            }
            graph.add_edge(GraphEdge::new(&pair[0], &pair[1], CONTINUE_LABEL, EdgeMode::Move))?;
        }
        if let Some(last) = positions.last() {
            if !fork_gates.contains(last) {
                graph.add_edge(GraphEdge::new(last, &settings.default_sink, CONTINUE_LABEL, EdgeMode::Move))?;
            }
        }

        // --- rutas de gate ---
        for (gate_name, routes, fork_branches) in &gate_decls {
            let next_after_gate = positions.iter()
                                           .position(|p| p == gate_name)
                                           .and_then(|i| positions.get(i + 1).cloned())
                                           .unwrap_or_else(|| settings.default_sink.clone());
            for (label, target) in routes {
                match target {
                    RouteTarget::Continue => {
                        if label != CONTINUE_LABEL {
                            graph.add_edge(GraphEdge::new(gate_name, &next_after_gate, label, EdgeMode::Move))?;
                        }
                    }
                    RouteTarget::Sink(sink) => {
                        graph.add_edge(GraphEdge::new(gate_name, sink, label, EdgeMode::Move))?;
                    }
                }
            }

            // --- branches de fork (edges COPY) ---
            if let Some(branches) = fork_branches {
                for branch in branches {
                    let coalesce_target = settings.coalesce
                                                  .iter()
                                                  .find(|c| c.branches.contains(branch))
                                                  .map(|c| c.name.clone());
                    let target = match coalesce_target {
                        Some(t) => t,
                        None if settings.sinks.contains_key(branch) => branch.clone(),
                        None => {
                            let mut available: Vec<String> = settings.coalesce
                                                                     .iter()
                                                                     .flat_map(|c| c.branches.iter().cloned())
                                                                     .collect();
                            available.extend(settings.sinks.keys().cloned());
                            return Err(ConfigError::UnknownForkBranch { gate: gate_name.clone(),
                                                                        branch: branch.clone(),
                                                                        available: available.join(", ") });
                        }
                    };
                    graph.add_edge(GraphEdge::new(gate_name, &target, branch, EdgeMode::Copy))?;
                }
            }
        }

        // --- edges DIVERT ---
        if let Some(target) = &settings.source.on_validation_failure {
            if target != "discard" {
                if !settings.sinks.contains_key(target) {
                    return Err(ConfigError::Invalid(format!("on_validation_failure sink '{target}' is not declared")));
                }
                graph.add_edge(GraphEdge::new(&source_id, target, QUARANTINE_LABEL, EdgeMode::Divert))?;
            }
        }
        for (n, t) in settings.transforms.iter().enumerate() {
            if let Some(target) = &t.on_error {
                if target != "discard" {
                    if !settings.sinks.contains_key(target) {
                        return Err(ConfigError::Invalid(format!("on_error sink '{target}' is not declared")));
                    }
                    let id = t.name.clone().unwrap_or_else(|| t.plugin.clone());
                    graph.add_edge(GraphEdge::new(&id, target, &error_label(n), EdgeMode::Divert))?;
                }
            }
        }

        validate(&graph)?;

        Ok(BuiltPipeline { graph,
                           executors,
                           source,
                           source_node_id: source_id,
                           default_sink: settings.default_sink.clone() })
    }
}
