//! El documento YAML de settings parsea al shape del core y construye un
//! grafo válido.

use elspeth_adapters::builtin_registry;
use elspeth_core::config::PipelineSettings;
use elspeth_core::PipelineBuilder;

const SAMPLE: &str = r#"
source:
  plugin: static
  options:
    rows:
      - {id: 1, score: 10}
      - {id: 2, score: 90}
gates:
  - name: threshold
    condition: "score > 50"
    routes:
      flag: flagged
sinks:
  flagged:
    plugin: memory
  out:
    plugin: memory
default_sink: out
execution:
  workers: 2
  queue_depth: 16
  retry:
    max_attempts: 3
    backoff_ms: 15
  drain_timeout_ms: 5000
  coalesce_timeout_ms: 5000
"#;

#[test]
fn sample_yaml_parses_and_builds() {
    let settings: PipelineSettings = serde_yaml::from_str(SAMPLE).expect("parses");
    settings.validate().expect("valid surface");
    assert_eq!(settings.fingerprint().len(), 64, "blake3 hex fingerprint");

    let registry = builtin_registry();
    let pipeline = PipelineBuilder::from_settings(&settings, &registry).expect("builds");
    assert!(pipeline.graph.edge_labelled("threshold", "flag").is_some());
}

#[test]
fn fingerprint_is_stable_for_identical_documents() {
    let a: PipelineSettings = serde_yaml::from_str(SAMPLE).expect("parses");
    let b: PipelineSettings = serde_yaml::from_str(SAMPLE).expect("parses");
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn reserved_labels_fail_at_the_settings_surface() {
    let bad = SAMPLE.replace("flag:", "__flag__:");
    let settings: PipelineSettings = serde_yaml::from_str(&bad).expect("parses");
    assert!(settings.validate().is_err());
}
