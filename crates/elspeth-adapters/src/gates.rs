//! Gate de condición config-driven.
//!
//! La condición es una expresión mínima `campo op literal` (ops: ==, !=,
//! >, >=, <, <=) o el literal `true`. Decide:
//! - gate con `fork_to`: condición verdadera → Fork; falsa → continue.
//! - gate con rutas: condición verdadera → primera ruta declarada; falsa →
//!   continue.
//! Los gates enrutan; nunca modifican la fila.

use elspeth_core::errors::ConfigError;
use elspeth_core::plugin::{GateDecision, GatePlugin, PluginContext, PluginError, RouteTarget};
use elspeth_core::schema::Schema;
use serde_json::Value;

use crate::schema_from_options;

/// Operador de comparación soportado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Condición parseada.
#[derive(Debug, Clone)]
enum Condition {
    Always,
    Compare { field: String, op: Op, literal: Value },
}

impl Condition {
    fn parse(expr: &str) -> Result<Self, ConfigError> {
        let trimmed = expr.trim();
        if trimmed == "true" {
            return Ok(Condition::Always);
        }
        // Orden de búsqueda: operadores de dos caracteres primero.
        for (text, op) in [(">=", Op::Ge), ("<=", Op::Le), ("==", Op::Eq), ("!=", Op::Ne), (">", Op::Gt),
                           ("<", Op::Lt)]
        {
            if let Some(idx) = trimmed.find(text) {
                let field = trimmed[..idx].trim();
                let literal_text = trimmed[idx + text.len()..].trim();
                if field.is_empty() || literal_text.is_empty() {
                    return Err(ConfigError::InvalidCondition { expr: expr.to_string(),
                                                               reason: "missing field or literal".to_string() });
                }
                let literal = parse_literal(literal_text).ok_or_else(|| ConfigError::InvalidCondition {
                                                             expr: expr.to_string(),
                                                             reason: format!("invalid literal '{literal_text}'"),
                                                         })?;
                return Ok(Condition::Compare { field: field.to_string(), op, literal });
            }
        }
        Err(ConfigError::InvalidCondition { expr: expr.to_string(),
                                            reason: "no comparison operator found".to_string() })
    }

    fn evaluate(&self, row: &Value) -> bool {
        match self {
            Condition::Always => true,
            Condition::Compare { field, op, literal } => {
                let value = match row.get(field) {
                    Some(v) => v,
                    None => return false,
                };
                match op {
                    Op::Eq => value == literal,
                    Op::Ne => value != literal,
                    Op::Gt | Op::Ge | Op::Lt | Op::Le => compare_numeric(value, literal).map(|ord| match op {
                                                             Op::Gt => ord.is_gt(),
                                                             Op::Ge => ord.is_ge(),
                                                             Op::Lt => ord.is_lt(),
                                                             Op::Le => ord.is_le(),
                                                             _ => unreachable!(),
                                                         })
                                                         .unwrap_or(false),
                }
            }
        }
    }
}

fn parse_literal(text: &str) -> Option<Value> {
    if let Some(stripped) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Some(Value::String(stripped.to_string()));
    }
    if let Some(stripped) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Some(Value::String(stripped.to_string()));
    }
    serde_json::from_str(text).ok()
}

fn compare_numeric(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    a.as_f64().and_then(|a| b.as_f64().and_then(|b| a.partial_cmp(&b)))
}

pub struct ConditionGate {
    name: String,
    condition: Condition,
    routes: Vec<(String, RouteTarget)>,
    fork_branches: Option<Vec<String>>,
    schema: Schema,
}

impl ConditionGate {
    /// Construye desde las opciones serializadas del `GateSettings` (name,
    /// condition, routes, fork_to).
    pub fn from_options(options: &Value) -> Result<Box<dyn GatePlugin>, ConfigError> {
        let name = options.get("name")
                          .and_then(|n| n.as_str())
                          .unwrap_or("condition")
                          .to_string();
        let expr = options.get("condition")
                          .and_then(|c| c.as_str())
                          .ok_or_else(|| ConfigError::Invalid(format!("gate '{name}' requires 'condition'")))?;
        let condition = Condition::parse(expr)?;
        let routes: Vec<(String, RouteTarget)> = options.get("routes")
                                                        .and_then(|r| r.as_object())
                                                        .map(|map| {
                                                            map.iter()
                                                               .map(|(label, target)| {
                                                                   let target = match target.as_str() {
                                                                       Some("continue") | None => RouteTarget::Continue,
                                                                       Some(sink) => RouteTarget::Sink(sink.to_string()),
                                                                   };
                                                                   (label.clone(), target)
                                                               })
                                                               .collect()
                                                        })
                                                        .unwrap_or_default();
        let fork_branches: Option<Vec<String>> = options.get("fork_to")
                                                        .and_then(|f| f.as_array())
                                                        .map(|branches| {
                                                            branches.iter()
                                                                    .filter_map(|b| b.as_str().map(str::to_string))
                                                                    .collect()
                                                        });
        let schema = schema_from_options(options)?;
        Ok(Box::new(ConditionGate { name, condition, routes, fork_branches, schema }))
    }
}

impl GatePlugin for ConditionGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn routes(&self) -> Vec<(String, RouteTarget)> {
        self.routes.clone()
    }

    fn fork_branches(&self) -> Option<Vec<String>> {
        self.fork_branches.clone()
    }

    fn decide(&self, row: &Value, _ctx: &PluginContext) -> Result<GateDecision, PluginError> {
        // Un gate de fork forkea siempre: sus edges COPY son el único camino
        // de salida (el builder no le tiende edge de continuación).
        if self.fork_branches.is_some() {
            return Ok(GateDecision::Fork);
        }
        if self.condition.evaluate(row) {
            if let Some((label, _)) = self.routes.first() {
                return Ok(GateDecision::Route(label.clone()));
            }
        }
        Ok(GateDecision::Route("continue".to_string()))
    }
}
