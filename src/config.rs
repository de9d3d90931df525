use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::Word;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub breakpoints: BreakpointConfig,
    pub ports: PortConfig,
    pub memory: MemoryConfig,
    pub profiler: ProfilerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.breakpoints.software_breakpoint.is_empty() {
            return Err(ConfigError::Invalid("software breakpoint instruction is empty"));
        }
        if self.memory.page_size == 0 || !self.memory.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid("page size must be a power of two"));
        }
        if self.memory.user_base >= self.memory.user_top {
            return Err(ConfigError::Invalid("user address range is empty"));
        }
        if self.ports.nub_port_capacity == 0
            || self.ports.debugger_port_capacity == 0
            || self.ports.thread_port_capacity == 0
        {
            return Err(ConfigError::Invalid("port capacity must be non-zero"));
        }
        if self.profiler.max_stack_depth == 0 {
            return Err(ConfigError::Invalid("profiler stack depth must be non-zero"));
        }
        if self.profiler.flush_threshold_percent == 0 || self.profiler.flush_threshold_percent > 100 {
            return Err(ConfigError::Invalid("flush threshold must be within 1..=100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointConfig {
    pub max_breakpoints: usize,
    pub hardware_breakpoints: usize,
    pub hardware_watchpoints: usize,
    pub shared_slots: bool,
    pub software_breakpoint: Vec<u8>,
}

impl Default for BreakpointConfig {
    fn default() -> Self {
        Self {
            max_breakpoints: 10240,
            hardware_breakpoints: 4,
            hardware_watchpoints: 4,
            shared_slots: true,
            software_breakpoint: vec![0xcc],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub debugger_port_capacity: usize,
    pub nub_port_capacity: usize,
    pub thread_port_capacity: usize,
    pub write_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl PortConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            debugger_port_capacity: 64,
            nub_port_capacity: 16,
            thread_port_capacity: 8,
            write_timeout_ms: 2000,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub page_size: usize,
    pub user_base: Word,
    pub user_top: Word,
    pub max_read_write_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            user_base: 0x1000,
            user_top: 0x8000_0000,
            max_read_write_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub min_interval_us: u64,
    pub max_stack_depth: u32,
    pub flush_threshold_percent: u32,
}

impl ProfilerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_micros(self.min_interval_us)
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            min_interval_us: 1000,
            max_stack_depth: 64,
            flush_threshold_percent: 70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "debug_nub=info".to_string(),
        }
    }
}
