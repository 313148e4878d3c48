//! Registro de plugins: factory por nombre y capacidad.
//!
//! Se construye al arranque; el engine sólo consume instancias tipadas.
//! Nombres desconocidos son `ConfigError::UnknownPlugin` (error de usuario,
//! no panic).

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::ConfigError;

use super::traits::{GatePlugin, SinkPlugin, SourcePlugin, TransformPlugin};

type SourceFactory = Box<dyn Fn(&Value) -> Result<Box<dyn SourcePlugin>, ConfigError> + Send + Sync>;
type TransformFactory = Box<dyn Fn(&Value) -> Result<Box<dyn TransformPlugin>, ConfigError> + Send + Sync>;
type GateFactory = Box<dyn Fn(&Value) -> Result<Box<dyn GatePlugin>, ConfigError> + Send + Sync>;
type SinkFactory = Box<dyn Fn(&Value) -> Result<Box<dyn SinkPlugin>, ConfigError> + Send + Sync>;

#[derive(Default)]
pub struct PluginRegistry {
    sources: HashMap<String, SourceFactory>,
    transforms: HashMap<String, TransformFactory>,
    gates: HashMap<String, GateFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&mut self, name: &str, factory: F)
        where F: Fn(&Value) -> Result<Box<dyn SourcePlugin>, ConfigError> + Send + Sync + 'static
    {
        self.sources.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_transform<F>(&mut self, name: &str, factory: F)
        where F: Fn(&Value) -> Result<Box<dyn TransformPlugin>, ConfigError> + Send + Sync + 'static
    {
        self.transforms.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_gate<F>(&mut self, name: &str, factory: F)
        where F: Fn(&Value) -> Result<Box<dyn GatePlugin>, ConfigError> + Send + Sync + 'static
    {
        self.gates.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_sink<F>(&mut self, name: &str, factory: F)
        where F: Fn(&Value) -> Result<Box<dyn SinkPlugin>, ConfigError> + Send + Sync + 'static
    {
        self.sinks.insert(name.to_string(), Box::new(factory));
    }

    pub fn make_source(&self, name: &str, options: &Value) -> Result<Box<dyn SourcePlugin>, ConfigError> {
        let factory = self.sources
                          .get(name)
                          .ok_or_else(|| ConfigError::UnknownPlugin { capability: "source".to_string(),
                                                                      name: name.to_string() })?;
        factory(options)
    }

    pub fn make_transform(&self, name: &str, options: &Value) -> Result<Box<dyn TransformPlugin>, ConfigError> {
        let factory = self.transforms
                          .get(name)
                          .ok_or_else(|| ConfigError::UnknownPlugin { capability: "transform".to_string(),
                                                                      name: name.to_string() })?;
        factory(options)
    }

    pub fn make_gate(&self, name: &str, options: &Value) -> Result<Box<dyn GatePlugin>, ConfigError> {
        let factory = self.gates
                          .get(name)
                          .ok_or_else(|| ConfigError::UnknownPlugin { capability: "gate".to_string(),
                                                                      name: name.to_string() })?;
        factory(options)
    }

    pub fn make_sink(&self, name: &str, options: &Value) -> Result<Box<dyn SinkPlugin>, ConfigError> {
        let factory = self.sinks
                          .get(name)
                          .ok_or_else(|| ConfigError::UnknownPlugin { capability: "sink".to_string(),
                                                                      name: name.to_string() })?;
        factory(options)
    }
}
