/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{error::ConfigResult, stream::StreamDirection};
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "AMDTP_ENGINE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "amdtp-engine".to_owned(),
            instance: InstanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    pub period_size: usize,
    pub nb_buffers: usize,
    pub sample_rate: u32,
    pub rt_priority: u8,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            period_size: 1024,
            nb_buffers: 3,
            sample_rate: 48_000,
            rt_priority: 70,
        }
    }
}

/// One stream the loopback binary should set up.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub name: String,
    pub channel: u8,
    pub direction: StreamDirection,
    pub audio_channels: usize,
    #[serde(default)]
    pub midi_ports: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub streams: Vec<StreamEntry>,
}

impl Config {
    #[instrument]
    pub fn load() -> ConfigResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let config = Config::load_from_file(args.config.as_deref())?;

        Ok(config)
    }

    #[instrument]
    pub fn load_from_file(path: Option<&Path>) -> ConfigResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.yaml";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/amdtp-engine/config.yaml";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path) {
                    Ok(it) => {
                        let config = serde_yaml::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_streaming_parameters() {
        let config = Config::default();
        assert_eq!(config.streaming.period_size, 1024);
        assert_eq!(config.streaming.nb_buffers, 3);
        assert_eq!(config.streaming.sample_rate, 48_000);
    }

    #[test]
    fn yaml_roundtrip() {
        let yaml = r#"
app:
  name: amdtp-engine
  instance:
    name: test-rig
streaming:
  periodSize: 512
  nbBuffers: 2
  sampleRate: 96000
  rtPriority: 60
streams:
  - name: capture
    channel: 0
    direction: receive
    audioChannels: 8
    midiPorts: 1
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("yaml parses");
        assert_eq!(config.streaming.period_size, 512);
        assert_eq!(config.streaming.sample_rate, 96_000);
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].audio_channels, 8);
        assert_eq!(config.streams[0].direction, StreamDirection::Receive);
        assert_eq!(config.instance_name(), "amdtp-engine/test-rig");
    }
}
