use std::path::Path;

use anyhow::Context;
use media_encoder::PipelineConfig;
use serde::{Deserialize, Serialize};

/// Everything one recording run needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub pipeline: PipelineConfig,
    pub seconds: u32,
    /// Frequency of the generated test tone.
    pub tone_hz: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            seconds: 5,
            tone_hz: 440.0,
        }
    }
}

impl RecorderConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}
