//! Compatibilidad productor → consumidor.

use super::Schema;

/// Campos requeridos del consumidor que el productor no satisface.
///
/// Devuelve la lista ordenada de nombres (vacía sii compatible). Un campo
/// cuenta como faltante si no existe en el productor o si su tipo no
/// satisface el requerido (ver `FieldType::satisfies`).
///
/// Si cualquiera de los dos esquemas es dinámico la compatibilidad se cumple
/// trivialmente y la lista es vacía.
pub fn missing_required_fields(producer: &Schema, consumer: &Schema) -> Vec<String> {
    let consumer_fields = match consumer {
        Schema::Dynamic => return vec![],
        Schema::Strict { fields } => fields,
    };
    if producer.is_dynamic() {
        return vec![];
    }

    let mut missing: Vec<String> = consumer_fields.iter()
                                                  .filter(|req| req.required)
                                                  .filter(|req| match producer.field(&req.name) {
                                                      Some(produced) => !produced.ty.satisfies(req.ty),
                                                      None => true,
                                                  })
                                                  .map(|req| req.name.clone())
                                                  .collect();
    missing.sort();
    missing
}
