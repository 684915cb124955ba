//! Tool configuration.
//!
//! Every tool runs with defaults that reproduce the calibrated constants. A
//! JSON file can override any subset of them; fields it leaves out keep
//! their defaults.

use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    device::DEFAULT_QUEUE_SIZE,
    markers::MarkerDictionary,
    pipeline::StereoDepthConfig,
    source::SensorBindings,
    tracking::TrackerConfig,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub tracker: TrackerConfig,
    pub dictionary: MarkerDictionary,
    pub stereo: StereoDepthConfig,
    pub queue_depth: usize,
    /// Sleep before the stereo saver starts capturing.
    pub warmup_ms: u64,
    pub sensors: SensorBindings,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            tracker: TrackerConfig::default(),
            dictionary: MarkerDictionary::default(),
            stereo: StereoDepthConfig::default(),
            queue_depth: DEFAULT_QUEUE_SIZE,
            warmup_ms: 5000,
            sensors: SensorBindings::default(),
        }
    }
}

impl ToolConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening config file {path:?}"))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config file {path:?}"))
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
