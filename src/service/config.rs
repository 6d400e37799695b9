// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::network::{EngineConfig, FRAME_OVERHEAD};

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// directory of the rolling log files
    pub log_dir: String,
    /// size in bytes of the variable region exposed to remote tools
    pub region_size: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_dir: "logs".to_string(),
            region_size: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub transport: TransportKind,
    /// interval between two engine polls
    pub poll_interval_ms: u64,
    /// upper bound of frames handled in a single tick
    pub max_drain_per_tick: usize,
    /// interval of the session occupancy report, 0 disables it
    pub report_interval_secs: u64,
    /// how long a tcp send waits for socket buffer space
    pub send_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 3344,
            transport: TransportKind::Tcp,
            poll_interval_ms: 10,
            max_drain_per_tick: 64,
            report_interval_secs: 60,
            send_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
}

impl AgentConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AgentConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("TELEMUX").separator("__"))
            .build()?;

        let agent_config: AgentConfig = config.try_deserialize()?;
        agent_config.validate()?;

        Ok(agent_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let engine = &self.engine;
        if engine.max_sessions == 0 {
            return Err(AppError::InvalidValue(
                "engine.max_sessions must be at least 1".to_string(),
            ));
        }
        if engine.max_frame_size <= FRAME_OVERHEAD || engine.max_frame_size > u16::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "engine.max_frame_size {} out of range {}..={}",
                engine.max_frame_size,
                FRAME_OVERHEAD + 1,
                u16::MAX
            )));
        }
        if self.network.poll_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "network.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.transport, TransportKind::Tcp);
    }

    #[test]
    fn test_reject_tiny_frame() {
        let mut config = AgentConfig::default();
        config.engine.max_frame_size = FRAME_OVERHEAD;
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn test_reject_zero_sessions() {
        let mut config = AgentConfig::default();
        config.engine.max_sessions = 0;
        assert!(config.validate().is_err());
    }
}
