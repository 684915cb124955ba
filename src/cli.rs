use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::{config::ToolConfig, pipeline::BoardSocket, source::SourceSpec};

/// Options shared by every tool.
#[derive(Debug, Args)]
pub struct CommonArgs {
    /// JSON file overriding the default tuning and sensor bindings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Source of the left mono sensor (device index, /dev/videoN, video file or image directory)
    #[arg(long)]
    pub left: Option<SourceSpec>,

    /// Source of the right mono sensor
    #[arg(long)]
    pub right: Option<SourceSpec>,

    /// Source of the color sensor
    #[arg(long)]
    pub rgb: Option<SourceSpec>,

    /// Do not open any windows
    #[arg(long)]
    pub headless: bool,
}

impl CommonArgs {
    /// Load the config file, then apply the sensor overrides given on the
    /// command line.
    pub fn tool_config(&self) -> Result<ToolConfig> {
        let mut config = ToolConfig::load_or_default(self.config.as_deref())?;

        for (socket, spec) in [
            (BoardSocket::Left, &self.left),
            (BoardSocket::Right, &self.right),
            (BoardSocket::Rgb, &self.rgb),
        ] {
            if let Some(spec) = spec {
                config.sensors.bind(socket, spec.clone());
            }
        }

        Ok(config)
    }
}

/// Initialize `env_logger` at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn no_arguments_uses_defaults() {
        let cli = TestCli::try_parse_from(["tool"]).unwrap();
        let config = cli.common.tool_config().unwrap();

        assert!(!cli.common.headless);
        assert_eq!(config, ToolConfig::default());
    }

    #[test]
    fn sensor_overrides_replace_bindings() {
        let cli = TestCli::try_parse_from(["tool", "--left", "/dev/video7", "--headless"]).unwrap();
        let config = cli.common.tool_config().unwrap();

        assert!(cli.common.headless);
        assert_eq!(
            config.sensors.get(BoardSocket::Left),
            Some(&SourceSpec::Device(7))
        );
        assert_eq!(
            config.sensors.get(BoardSocket::Rgb),
            Some(&SourceSpec::Device(0))
        );
    }
}
