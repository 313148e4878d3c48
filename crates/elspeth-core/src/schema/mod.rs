//! Modelo de esquemas de fila (C2).
//!
//! Un esquema es un conjunto ordenado y nombrado de campos tipados. Hay dos
//! modos:
//! - `Strict`: el shape se valida campo a campo.
//! - `Dynamic`: centinela "observado"; cualquier shape concreto es aceptable
//!   y la compatibilidad se cumple trivialmente.
//!
//! Contrato de compatibilidad `produces(P) ⊇ requires(C)`:
//! - Si cualquiera de los dos es dinámico, compatible.
//! - Si no, todo campo requerido del consumidor debe existir en el productor
//!   con tipo compatible bajo la relación de subtipos (widening numérico
//!   Int → Float; el resto requiere igualdad exacta).
//!
//! Todas las comprobaciones de edges del grafo pasan por una única función,
//! `missing_required_fields`; no hay atajos por plugin.

mod compat;
mod field;
mod validate;

pub use compat::missing_required_fields;
pub use field::{FieldDef, FieldType};
pub use validate::{validate_row, FieldError};

use serde::{Deserialize, Serialize};

/// Esquema de fila: estricto (campos declarados) o dinámico.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schema {
    /// Cualquier shape concreto es aceptable.
    Dynamic,
    /// Conjunto ordenado de campos tipados.
    Strict { fields: Vec<FieldDef> },
}

impl Schema {
    pub fn strict(fields: Vec<FieldDef>) -> Self {
        Schema::Strict { fields }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Schema::Dynamic)
    }

    /// Busca un campo por nombre (None en esquemas dinámicos).
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        match self {
            Schema::Dynamic => None,
            Schema::Strict { fields } => fields.iter().find(|f| f.name == name),
        }
    }

    /// Nombres de campos declarados, en orden (vacío para dinámicos).
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Schema::Dynamic => vec![],
            Schema::Strict { fields } => fields.iter().map(|f| f.name.as_str()).collect(),
        }
    }
}
