//! Barreras de coalesce.
//!
//! El coordinador registra cada llegada a un nodo de coalesce y cierra la
//! barrera según la política:
//! - `require_all`: espera todos los branches declarados; deadline vencido =
//!   fallo por timeout (nunca un hang).
//! - `first_complete`: cierra cuando llegaron todos o venció el deadline;
//!   el payload de la PRIMERA llegada gana. Los padres del token fusionado
//!   quedan en orden de llegada.
//! - `best_effort`: fusiona lo llegado al vencer el deadline (o todo, si
//!   llega completo antes).
//! - `quorum(n)`: cierra al alcanzar `n` llegadas; las tardías se marcan
//!   COALESCED en el mismo join group pero no son padres.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;

use crate::experiment::merge_overrides;
use crate::graph::{CoalescePolicy, CoalesceStrategy};
use crate::landscape::TokenRecord;
use crate::processor::WorkItem;

/// Llegada registrada en una barrera.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub token: TokenRecord,
    pub row: Value,
    pub branch: Option<String>,
}

struct Barrier {
    arrivals: Vec<Arrival>,
    deadline: Instant,
}

/// Acción que el coordinador debe ejecutar tras una llegada o un tick.
#[derive(Debug)]
pub enum BarrierAction {
    /// Nada que hacer todavía.
    Wait,
    /// Cerrar: fusionar estos inputs (en orden de llegada) con esta fila.
    Merge { node_id: String, inputs: Vec<Arrival>, merged_row: Value },
    /// Deadline vencido sin satisfacer la política: los inputs llegados
    /// fallan con timeout.
    TimedOut { node_id: String, inputs: Vec<Arrival> },
    /// Llegada tardía a una barrera ya cerrada: COALESCED suelto, sin
    /// parentesco en el token fusionado.
    Late { item: WorkItem, join_group_id: uuid::Uuid },
}

/// Tracker de barreras por (nodo, grupo). El grupo de una llegada es su
/// `fork_group_id`; tokens sin fork agrupan por fila.
pub struct CoalesceTracker {
    policies: HashMap<String, CoalescePolicy>,
    open: HashMap<(String, String), Barrier>,
    closed: HashMap<(String, String), uuid::Uuid>,
}

impl CoalesceTracker {
    pub fn new(policies: HashMap<String, CoalescePolicy>) -> Self {
        Self { policies,
               open: HashMap::new(),
               closed: HashMap::new() }
    }

    fn group_key(token: &TokenRecord) -> String {
        token.fork_group_id
             .map(|g| g.to_string())
             .unwrap_or_else(|| token.row_id.clone())
    }

    /// Registra la llegada de `item` al nodo de coalesce `node_id`.
    pub fn arrive(&mut self, item: WorkItem) -> BarrierAction {
        let node_id = item.node_id.clone();
        let policy = match self.policies.get(&node_id) {
            Some(p) => p.clone(),
            None => {
                // Nodo sin política registrada: pasa directo como merge de uno.
                return BarrierAction::Merge { node_id,
                                              merged_row: item.row.clone(),
                                              inputs: vec![Arrival { token: item.token,
                                                                     row: item.row,
                                                                     branch: None }] };
            }
        };
        let key = (node_id.clone(), Self::group_key(&item.token));

        if let Some(join_group_id) = self.closed.get(&key) {
            return BarrierAction::Late { item, join_group_id: *join_group_id };
        }

        let timeout = policy.timeout;
        let barrier = self.open.entry(key.clone()).or_insert_with(|| Barrier { arrivals: Vec::new(),
                                                                               deadline: Instant::now() + timeout });
        barrier.arrivals.push(Arrival { branch: item.token.branch_name.clone(),
                                        token: item.token,
                                        row: item.row });

        let satisfied = match policy.strategy {
            CoalesceStrategy::RequireAll | CoalesceStrategy::FirstComplete => {
                policy.branches
                      .iter()
                      .all(|b| barrier.arrivals.iter().any(|a| a.branch.as_deref() == Some(b.as_str())))
            }
            CoalesceStrategy::Quorum(threshold) => barrier.arrivals.len() >= threshold,
            CoalesceStrategy::BestEffort => false,
        };
        if !satisfied {
            return BarrierAction::Wait;
        }

        let barrier = self.open.remove(&key).expect("barrier present");
        self.close_barrier(key, &policy, barrier.arrivals)
    }

    fn close_barrier(&mut self,
                     key: (String, String),
                     policy: &CoalescePolicy,
                     inputs: Vec<Arrival>)
                     -> BarrierAction {
        let node_id = key.0.clone();
        let join_group_id = uuid::Uuid::new_v4();
        self.closed.insert(key, join_group_id);
        let merged_row = merged_row_for(policy.strategy, &inputs);
        BarrierAction::Merge { node_id, inputs, merged_row }
    }

    /// Revisa deadlines vencidos. Llamar periódicamente desde el loop del
    /// coordinador.
    pub fn tick(&mut self) -> Vec<BarrierAction> {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self.open
                                                 .iter()
                                                 .filter(|(_, b)| b.deadline <= now)
                                                 .map(|(k, _)| k.clone())
                                                 .collect();
        let mut actions = Vec::new();
        for key in expired {
            let barrier = self.open.remove(&key).expect("expired barrier present");
            let policy = match self.policies.get(&key.0) {
                Some(p) => p.clone(),
                None => continue,
            };
            match policy.strategy {
                // Sin la política satisfecha al deadline: timeout explícito.
                CoalesceStrategy::RequireAll | CoalesceStrategy::Quorum(_) => {
                    self.closed.insert(key.clone(), uuid::Uuid::new_v4());
                    actions.push(BarrierAction::TimedOut { node_id: key.0.clone(), inputs: barrier.arrivals });
                }
                CoalesceStrategy::BestEffort | CoalesceStrategy::FirstComplete => {
                    if barrier.arrivals.is_empty() {
                        continue;
                    }
                    actions.push(self.close_barrier(key, &policy, barrier.arrivals));
                }
            }
        }
        actions
    }

    /// Fuerza el cierre de todas las barreras abiertas (drenaje de shutdown
    /// o fin de la fuente con branches que ya no van a llegar).
    pub fn drain(&mut self) -> Vec<BarrierAction> {
        let keys: Vec<(String, String)> = self.open.keys().cloned().collect();
        let mut actions = Vec::new();
        for key in keys {
            let barrier = self.open.remove(&key).expect("open barrier present");
            let policy = match self.policies.get(&key.0) {
                Some(p) => p.clone(),
                None => continue,
            };
            match policy.strategy {
                CoalesceStrategy::RequireAll | CoalesceStrategy::Quorum(_) => {
                    self.closed.insert(key.clone(), uuid::Uuid::new_v4());
                    actions.push(BarrierAction::TimedOut { node_id: key.0.clone(), inputs: barrier.arrivals });
                }
                CoalesceStrategy::BestEffort | CoalesceStrategy::FirstComplete => {
                    if barrier.arrivals.is_empty() {
                        continue;
                    }
                    actions.push(self.close_barrier(key, &policy, barrier.arrivals));
                }
            }
        }
        actions
    }

    pub fn has_open_barriers(&self) -> bool {
        !self.open.is_empty()
    }
}

/// Fila resultante de la fusión según la estrategia: `first_complete` toma
/// el payload de la primera llegada; el resto hace merge shallow en orden de
/// llegada (llegadas posteriores pisan claves repetidas).
fn merged_row_for(strategy: CoalesceStrategy, inputs: &[Arrival]) -> Value {
    match strategy {
        CoalesceStrategy::FirstComplete => inputs.first().map(|a| a.row.clone()).unwrap_or(Value::Null),
        _ => {
            let mut merged = Value::Object(Default::default());
            for arrival in inputs {
                merged = merge_overrides(&merged, &arrival.row);
            }
            merged
        }
    }
}
