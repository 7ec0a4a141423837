//! Process-local client
//!
//! A [`LocalClient`] ties a platform to the runtime: one [`Device`] per
//! executor, the allocator and compiler the buffers and executables use, a
//! thread pool for issuing host-to-device transfers and the host reference
//! manager.

use crate::config::ClientConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::host_refs::HostRefManager;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tessera_device::{
    Compiler, HostCompiler, MemoryUsage, Platform, SharedAllocator, StreamExecutorAllocator, TransferManager,
};

pub struct LocalClient {
    devices: Vec<Device>,
    platform: Arc<Platform>,
    allocator: SharedAllocator,
    transfer_manager: TransferManager,
    compiler: Arc<dyn Compiler>,
    h2d_transfer_pool: ThreadPool,
    host_ref_manager: HostRefManager,
    config: ClientConfig,
}

impl LocalClient {
    /// Build a client on a fresh platform described by `config`.
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        let platform = Arc::new(Platform::new(config.platform_config()));
        let allocator: SharedAllocator = Arc::new(StreamExecutorAllocator::new(Arc::clone(&platform)));
        Self::with_platform(platform, allocator, Arc::new(HostCompiler::new()), config)
    }

    #[tracing::instrument(skip_all, fields(platform = %platform.name()))]
    pub fn with_platform(
        platform: Arc<Platform>,
        allocator: SharedAllocator,
        compiler: Arc<dyn Compiler>,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        if platform.visible_device_count() == 0 {
            return Err(Error::InvalidArgument(format!(
                "platform {} has no visible devices",
                platform.name()
            )));
        }

        let multi_stream = config.multi_stream();
        let synchronous_deallocation = config.synchronous_deallocation();
        let devices = platform
            .executors()
            .iter()
            .map(|executor| {
                Device::new(
                    Arc::clone(executor),
                    multi_stream,
                    synchronous_deallocation,
                    config.asynchronous,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let transfer_threads = config.transfer_threads();
        let h2d_transfer_pool = ThreadPoolBuilder::new()
            .num_threads(transfer_threads)
            .thread_name(|i| format!("tessera-h2d-{i}"))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build host-to-device transfer pool: {e}")))?;

        tracing::info!(
            device_count = devices.len(),
            multi_stream,
            asynchronous = config.asynchronous,
            transfer_threads,
            "local_client_created"
        );
        Ok(Arc::new(Self {
            devices,
            platform,
            allocator,
            transfer_manager: TransferManager::new(),
            compiler,
            h2d_transfer_pool,
            host_ref_manager: HostRefManager::new(),
            config,
        }))
    }

    pub fn device(&self, ordinal: usize) -> Result<&Device> {
        self.devices.get(ordinal).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "device ordinal {ordinal} out of range; the client has {} device(s)",
                self.devices.len()
            ))
        })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn platform_name(&self) -> &str {
        self.platform.name()
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    pub fn transfer_manager(&self) -> &TransferManager {
        &self.transfer_manager
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    pub fn h2d_transfer_pool(&self) -> &ThreadPool {
        &self.h2d_transfer_pool
    }

    pub fn host_ref_manager(&self) -> &HostRefManager {
        &self.host_ref_manager
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Memory accounting for every device, by ordinal.
    pub fn memory_usage(&self) -> Vec<MemoryUsage> {
        self.devices.iter().map(|d| d.executor().memory_usage()).collect()
    }
}

impl std::fmt::Debug for LocalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClient")
            .field("platform", &self.platform.name())
            .field("devices", &self.devices)
            .field("config", &self.config)
            .finish()
    }
}
