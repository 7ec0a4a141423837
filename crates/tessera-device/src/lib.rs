//! Device platform layer for the tessera runtime
//!
//! This crate provides:
//! - **Shapes and literals**: array/tuple shapes, layouts and host values
//! - **Device memory**: handles, owning wrappers and the allocator interface
//! - **Streams and events**: in-order device queues and cross-stream events
//! - **Transfer manager**: host↔device copies of whole literals
//! - **Executables**: compiler/executable seams plus a host-backed reference backend
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    tessera-runtime                       │
//! │     (buffers, definition events, replicated launch)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  TransferManager · Compiler/Executable · Allocator       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//!   ┌──────────┐  ┌──────────┐  ┌──────────┐
//!   │ Executor │  │ Executor │  │ Executor │   one per device ordinal
//!   │ streams  │  │ streams  │  │ streams  │
//!   └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::{mpsc, Arc};
//! use tessera_device::{
//!     Literal, Platform, PlatformConfig, SharedAllocator, Stream, StreamExecutorAllocator, TransferManager,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let platform = Arc::new(Platform::new(PlatformConfig::default()));
//! let allocator: SharedAllocator = Arc::new(StreamExecutorAllocator::new(platform.clone()));
//! let stream = Stream::new(platform.executor(0)?)?;
//! let tm = TransferManager::new();
//!
//! let literal = Literal::vector(&[1.0f32, 2.0, 3.0]);
//! let buffer = tm.allocate_scoped_shaped_buffer(&literal.shape(), &allocator, 0)?;
//! tm.transfer_literal_to_device_async(&stream, &literal, buffer.as_shaped_buffer())?;
//!
//! let (tx, rx) = mpsc::channel();
//! tm.transfer_literal_from_device(&stream, buffer.as_shaped_buffer(), move |r| {
//!     let _ = tx.send(r);
//! })?;
//! assert_eq!(rx.recv()??, literal);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod executable;
pub mod executor;
pub mod literal;
pub mod memory;
pub mod platform;
pub mod shape;
pub mod shaped_buffer;
pub mod stream;
pub mod transfer;

pub use error::{DeviceError, Result};
pub use event::{Event, EventStatus};
pub use executable::{
    BuildOptions, Compiler, Computation, ComputationPlacer, DeviceAssignment, Executable, HostBody, HostCompiler,
    HostExecutable, ReplicaContext, RunOptions,
};
pub use executor::{MemoryUsage, StreamExecutor};
pub use literal::{Literal, NativeType};
pub use memory::{DeviceMemory, DeviceMemoryAllocator, OwningDeviceMemory, SharedAllocator, StreamExecutorAllocator};
pub use platform::{Platform, PlatformConfig};
pub use shape::{ArrayShape, Layout, PrimitiveType, ProgramShape, Shape, ShapeIndex};
pub use shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};
pub use stream::{Stream, StreamId};
pub use transfer::{TransferManager, POINTER_SIZE};
