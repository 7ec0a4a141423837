//! Named collections of device executors

use crate::error::{DeviceError, Result};
use crate::executor::StreamExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default per-device memory capacity (1 GiB).
pub const DEFAULT_MEMORY_PER_DEVICE: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    pub device_count: usize,
    pub memory_per_device: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            device_count: 1,
            memory_per_device: DEFAULT_MEMORY_PER_DEVICE,
        }
    }
}

impl PlatformConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_device_count(mut self, device_count: usize) -> Self {
        self.device_count = device_count;
        self
    }

    pub fn with_memory_per_device(mut self, bytes: usize) -> Self {
        self.memory_per_device = bytes;
        self
    }
}

#[derive(Debug)]
pub struct Platform {
    name: String,
    executors: Vec<Arc<StreamExecutor>>,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> Self {
        let executors = (0..config.device_count)
            .map(|ordinal| Arc::new(StreamExecutor::new(ordinal, config.name.clone(), config.memory_per_device)))
            .collect();
        tracing::debug!(
            platform = %config.name,
            device_count = config.device_count,
            memory_per_device = config.memory_per_device,
            "platform_created"
        );
        Self {
            name: config.name,
            executors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visible_device_count(&self) -> usize {
        self.executors.len()
    }

    pub fn executor(&self, ordinal: usize) -> Result<&Arc<StreamExecutor>> {
        self.executors.get(ordinal).ok_or(DeviceError::InvalidDeviceOrdinal {
            ordinal,
            device_count: self.executors.len(),
        })
    }

    pub fn executors(&self) -> &[Arc<StreamExecutor>] {
        &self.executors
    }
}
