//! Buffers de aggregation y sus disparadores.
//!
//! Cada nodo de aggregation acumula tokens BUFFERED en un batch abierto. El
//! flush se dispara por count, tamaño acumulado o tiempo (lo que ocurra
//! primero) y también al agotarse la fuente (flush final de batches
//! parciales).

use std::collections::HashMap;
use std::time::Instant;

use crate::graph::Trigger;
use crate::processor::WorkItem;

struct OpenBatch {
    batch_id: uuid::Uuid,
    members: Vec<WorkItem>,
    bytes: usize,
    opened_at: Instant,
}

/// Flush listo para ejecutar: el batch y sus miembros en orden de buffer.
pub struct PendingFlush {
    pub node_id: String,
    pub batch_id: uuid::Uuid,
    pub members: Vec<WorkItem>,
}

pub struct AggregationTracker {
    triggers: HashMap<String, Trigger>,
    open: HashMap<String, OpenBatch>,
}

impl AggregationTracker {
    pub fn new(triggers: HashMap<String, Trigger>) -> Self {
        Self { triggers, open: HashMap::new() }
    }

    /// Suma un token al batch abierto del nodo. Devuelve el batch_id
    /// (creándolo si es el primero) y el flush si un trigger se satisfizo.
    pub fn buffer(&mut self, item: WorkItem) -> (uuid::Uuid, u32, Option<PendingFlush>) {
        let node_id = item.node_id.clone();
        let row_bytes = item.row.to_string().len();
        let batch = self.open.entry(node_id.clone()).or_insert_with(|| OpenBatch { batch_id: uuid::Uuid::new_v4(),
                                                                                   members: Vec::new(),
                                                                                   bytes: 0,
                                                                                   opened_at: Instant::now() });
        let ordinal = batch.members.len() as u32;
        let batch_id = batch.batch_id;
        batch.members.push(item);
        batch.bytes += row_bytes;

        let trigger = self.triggers.get(&node_id).cloned().unwrap_or_default();
        let count_hit = trigger.count.map(|c| batch.members.len() >= c).unwrap_or(false);
        let size_hit = trigger.size_bytes.map(|s| batch.bytes >= s).unwrap_or(false);
        let flush = if count_hit || size_hit {
            Some(self.take(&node_id))
        } else {
            None
        };
        (batch_id, ordinal, flush)
    }

    fn take(&mut self, node_id: &str) -> PendingFlush {
        let batch = self.open.remove(node_id).expect("open batch present");
        PendingFlush { node_id: node_id.to_string(),
                       batch_id: batch.batch_id,
                       members: batch.members }
    }

    /// Revisa triggers de tiempo vencidos.
    pub fn tick(&mut self) -> Vec<PendingFlush> {
        let now = Instant::now();
        let due: Vec<String> = self.open
                                   .iter()
                                   .filter(|(node_id, batch)| {
                                       self.triggers
                                           .get(*node_id)
                                           .and_then(|t| t.interval)
                                           .map(|i| batch.opened_at + i <= now)
                                           .unwrap_or(false)
                                   })
                                   .map(|(node_id, _)| node_id.clone())
                                   .collect();
        due.into_iter().map(|node_id| self.take(&node_id)).collect()
    }

    /// Flush final: drena todos los batches parciales (fin de fuente o
    /// shutdown ordenado).
    pub fn drain(&mut self) -> Vec<PendingFlush> {
        let nodes: Vec<String> = self.open.keys().cloned().collect();
        nodes.into_iter().map(|node_id| self.take(&node_id)).collect()
    }

    pub fn has_open_batches(&self) -> bool {
        !self.open.is_empty()
    }
}
