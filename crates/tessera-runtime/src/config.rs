//! Client configuration
//!
//! Everything a [`LocalClient`](crate::LocalClient) needs is injected here at
//! construction; nothing is cached process-wide.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tessera_device::platform::DEFAULT_MEMORY_PER_DEVICE;
use tessera_device::PlatformConfig;

/// How long a failed replicated launch waits for the surviving replicas.
pub const DEFAULT_REPLICA_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether each device gets dedicated transfer and callback streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Compute, host-to-device, device-to-host and callback roles share one stream.
    Single,
    /// One stream per role.
    Multi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub platform_name: String,
    pub device_count: usize,
    pub device_memory_bytes: usize,
    /// When false, launches first wait for the compute stream to drain.
    pub asynchronous: bool,
    /// `None` picks the platform default: multi-stream only on `"tpu"`.
    pub stream_mode: Option<StreamMode>,
    pub replica_timeout: Duration,
    /// Host-to-device pool size; defaults to the device count.
    pub transfer_threads: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            platform_name: "host".to_string(),
            device_count: 1,
            device_memory_bytes: DEFAULT_MEMORY_PER_DEVICE,
            asynchronous: true,
            stream_mode: None,
            replica_timeout: DEFAULT_REPLICA_TIMEOUT,
            transfer_threads: None,
        }
    }
}

impl ClientConfig {
    pub fn new(platform_name: impl Into<String>) -> Self {
        Self {
            platform_name: platform_name.into(),
            ..Self::default()
        }
    }

    pub fn with_device_count(mut self, device_count: usize) -> Self {
        self.device_count = device_count;
        self
    }

    pub fn with_device_memory_bytes(mut self, bytes: usize) -> Self {
        self.device_memory_bytes = bytes;
        self
    }

    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = Some(mode);
        self
    }

    pub fn with_replica_timeout(mut self, timeout: Duration) -> Self {
        self.replica_timeout = timeout;
        self
    }

    pub fn with_transfer_threads(mut self, threads: usize) -> Self {
        self.transfer_threads = Some(threads);
        self
    }

    pub fn multi_stream(&self) -> bool {
        match self.stream_mode {
            Some(mode) => mode == StreamMode::Multi,
            None => self.platform_name == "tpu",
        }
    }

    /// Memory is released only after device work is known complete unless
    /// separate streams let the allocator track it.
    pub fn synchronous_deallocation(&self) -> bool {
        !self.multi_stream()
    }

    pub fn transfer_threads(&self) -> usize {
        self.transfer_threads.unwrap_or(self.device_count).max(1)
    }

    pub fn platform_config(&self) -> PlatformConfig {
        PlatformConfig::new(self.platform_name.clone())
            .with_device_count(self.device_count)
            .with_memory_per_device(self.device_memory_bytes)
    }

    /// Build a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TESSERA_PLATFORM` - platform name (`host`, `tpu`, ...)
    /// - `TESSERA_DEVICE_COUNT` - number of devices
    /// - `TESSERA_DEVICE_MEMORY_BYTES` - memory capacity per device
    /// - `TESSERA_ASYNC` - `true`/`1`/`yes` for asynchronous launches
    /// - `TESSERA_MULTI_STREAM` - force multi-stream (`true`) or single-stream (`false`)
    /// - `TESSERA_REPLICA_TIMEOUT_MS` - replica straggler timeout
    /// - `TESSERA_TRANSFER_THREADS` - host-to-device pool size
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(platform) = env::var("TESSERA_PLATFORM") {
            if !platform.trim().is_empty() {
                config.platform_name = platform.trim().to_string();
            }
        }
        if let Some(count) = parse_env::<usize>("TESSERA_DEVICE_COUNT") {
            config.device_count = count;
        }
        if let Some(bytes) = parse_env::<usize>("TESSERA_DEVICE_MEMORY_BYTES") {
            config.device_memory_bytes = bytes;
        }
        if let Some(asynchronous) = bool_env("TESSERA_ASYNC") {
            config.asynchronous = asynchronous;
        }
        if let Some(multi) = bool_env("TESSERA_MULTI_STREAM") {
            config.stream_mode = Some(if multi { StreamMode::Multi } else { StreamMode::Single });
        }
        if let Some(ms) = parse_env::<u64>("TESSERA_REPLICA_TIMEOUT_MS") {
            config.replica_timeout = Duration::from_millis(ms);
        }
        if let Some(threads) = parse_env::<usize>("TESSERA_TRANSFER_THREADS") {
            config.transfer_threads = Some(threads);
        }

        config
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = key, value = %value, "ignoring unparsable configuration value");
            None
        }
    }
}

fn bool_env(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => {
            tracing::warn!(variable = key, value = %value, "ignoring unparsable configuration value");
            None
        }
    }
}
