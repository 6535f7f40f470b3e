use std::path::Path;

use qnet_core::fixed::Fixed64;
use qnet_core::qkd::QkdConfig;
use qnet_core::topology::{LinkDomain, NodeKind};
use serde::{Deserialize, Serialize};

use crate::error::SceneError;

/// Top-level scene definition, loaded from a `.ron` or `.json` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneData {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<SceneNode>,
    #[serde(default)]
    pub links: Vec<SceneLink>,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Application data injected at given ticks.
    #[serde(default)]
    pub messages: Vec<ScriptedMessage>,
    /// Keys established ahead of traffic.
    #[serde(default)]
    pub key_requests: Vec<ScriptedKeyRequest>,
}

/// A network node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneNode {
    /// Unique id within the scene; becomes the engine node name.
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub address: String,
    /// 2D layout position for rendering.
    #[serde(default)]
    pub position: (f32, f32),
    /// Display label (defaults to the id).
    #[serde(default)]
    pub label: Option<String>,
}

/// An undirected link between two scene nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneLink {
    pub a: String,
    pub b: String,
    pub domain: LinkDomain,
    /// Per-qubit flip probability. Quantum links only.
    #[serde(default)]
    pub error_probability: f64,
    #[serde(default = "default_latency")]
    pub latency: u64,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_latency() -> u64 {
    1
}

/// Simulation parameters for the scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub seed: u64,
    /// Hard stop for headless runs.
    #[serde(default = "default_tick_limit")]
    pub tick_limit: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub qkd: QkdSettings,
    /// Event types to leave out of the stream.
    #[serde(default)]
    pub suppress: Vec<String>,
}

fn default_tick_limit() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    4096
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            tick_limit: default_tick_limit(),
            event_capacity: default_event_capacity(),
            qkd: QkdSettings::default(),
            suppress: Vec::new(),
        }
    }
}

/// BB84 parameters as written in scene files. Every field is optional and
/// falls back to the engine default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QkdSettings {
    #[serde(default)]
    pub qubit_count: Option<usize>,
    #[serde(default)]
    pub sample_fraction: Option<f64>,
    #[serde(default)]
    pub error_threshold: Option<f64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub batch_escalation: Option<u32>,
    #[serde(default)]
    pub max_qubit_count: Option<usize>,
}

impl QkdSettings {
    /// Overlay these settings on the defaults. Range checks happen when the
    /// engine validates the result.
    pub fn to_config(&self) -> Result<QkdConfig, SceneError> {
        let defaults = QkdConfig::default();
        Ok(QkdConfig {
            qubit_count: self.qubit_count.unwrap_or(defaults.qubit_count),
            sample_fraction: match self.sample_fraction {
                Some(v) => to_fixed("sample_fraction", v)?,
                None => defaults.sample_fraction,
            },
            error_threshold: match self.error_threshold {
                Some(v) => to_fixed("error_threshold", v)?,
                None => defaults.error_threshold,
            },
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            batch_escalation: self.batch_escalation.unwrap_or(defaults.batch_escalation),
            max_qubit_count: self.max_qubit_count.unwrap_or(defaults.max_qubit_count),
        })
    }
}

/// Convert a scene number to fixed point, rejecting NaN and out-of-range
/// values instead of panicking.
pub fn to_fixed(field: &str, value: f64) -> Result<Fixed64, SceneError> {
    Fixed64::checked_from_num(value).ok_or_else(|| SceneError::InvalidNumber {
        field: field.to_string(),
        value,
    })
}

/// Send `data` from host `from` to host `to` at `tick`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedMessage {
    #[serde(default)]
    pub tick: u64,
    pub from: String,
    pub to: String,
    pub data: String,
}

/// Establish a key between two paired adapters at `tick`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedKeyRequest {
    #[serde(default)]
    pub tick: u64,
    pub initiator: String,
    pub responder: String,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Scene file encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneFormat {
    Ron,
    Json,
}

impl SceneFormat {
    /// Pick the format from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "ron" => Some(Self::Ron),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl SceneData {
    /// Parse a scene from text. `file` is used for error reporting only.
    pub fn parse(content: &str, format: SceneFormat, file: &Path) -> Result<Self, SceneError> {
        let parsed = match format {
            SceneFormat::Ron => ron::from_str(content).map_err(|e| e.to_string()),
            SceneFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|detail| SceneError::Parse {
            file: file.to_path_buf(),
            detail,
        })
    }

    /// Read and parse a scene file.
    pub fn load(path: &Path) -> Result<Self, SceneError> {
        let format = SceneFormat::from_path(path).ok_or_else(|| SceneError::UnsupportedFormat {
            file: path.to_path_buf(),
        })?;
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, format, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"(
        title: "pair",
        nodes: [
            (id: "H1", kind: classical_host),
            (id: "H2", kind: classical_host, address: "10.0.0.2"),
        ],
        links: [(a: "H1", b: "H2", domain: classical)],
        messages: [(from: "H1", to: "H2", data: "hi")],
    )"#;

    #[test]
    fn ron_defaults_fill_in() {
        let scene = SceneData::parse(MINIMAL, SceneFormat::Ron, Path::new("pair.ron")).unwrap();
        assert_eq!(scene.nodes.len(), 2);
        assert_eq!(scene.nodes[0].address, "");
        assert_eq!(scene.links[0].latency, 1);
        assert_eq!(scene.links[0].error_probability, 0.0);
        assert_eq!(scene.simulation.tick_limit, 1000);
        assert_eq!(scene.messages[0].tick, 0);
        assert!(scene.key_requests.is_empty());
    }

    #[test]
    fn json_uses_same_schema() {
        let json = r#"{
            "title": "pair",
            "nodes": [
                {"id": "A1", "kind": "quantum_adapter"},
                {"id": "Q1", "kind": "quantum_repeater"}
            ],
            "links": [{"a": "A1", "b": "Q1", "domain": "quantum", "error_probability": 0.1}],
            "simulation": {"seed": 9, "qkd": {"qubit_count": 128}}
        }"#;
        let scene = SceneData::parse(json, SceneFormat::Json, Path::new("pair.json")).unwrap();
        assert_eq!(scene.nodes[0].kind, NodeKind::QuantumAdapter);
        assert_eq!(scene.links[0].domain, LinkDomain::Quantum);
        assert_eq!(scene.simulation.seed, 9);
        let config = scene.simulation.qkd.to_config().unwrap();
        assert_eq!(config.qubit_count, 128);
        assert_eq!(config.max_attempts, QkdConfig::default().max_attempts);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let err = SceneData::parse("(title: ", SceneFormat::Ron, Path::new("broken.ron")).unwrap_err();
        match err {
            SceneError::Parse { file, .. } => assert_eq!(file, Path::new("broken.ron")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(SceneFormat::from_path(Path::new("a.ron")), Some(SceneFormat::Ron));
        assert_eq!(SceneFormat::from_path(Path::new("a.json")), Some(SceneFormat::Json));
        assert_eq!(SceneFormat::from_path(Path::new("a.toml")), None);
    }

    #[test]
    fn nan_rejected() {
        assert!(matches!(
            to_fixed("error_probability", f64::NAN),
            Err(SceneError::InvalidNumber { .. })
        ));
        assert_eq!(to_fixed("x", 0.5).unwrap(), Fixed64::from_num(0.5));
    }
}
