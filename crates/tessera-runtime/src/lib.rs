//! Tessera runtime
//!
//! Host-side runtime that drives asynchronous execution of compiled programs
//! on one or more accelerator devices. It owns device memory, issues
//! host↔device transfers on dedicated streams and coordinates replicated
//! launches without blocking the caller unless a host value is requested.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   host values ───► │  LocalBuffer   LocalExecutable│ ◄─── Computation
//!                    └──────┬──────────────┬────────┘
//!                           │              │
//!                           ▼              ▼
//!                 SharedDeviceBuffer   DeviceAssignment
//!                 (+ definition events)    │
//!                           │              │
//!                           ▼              ▼
//!                    ┌──────────────────────────────┐
//!                    │ Device: compute / h2d / d2h / │
//!                    │ callback streams + worker     │  one per ordinal
//!                    └──────────────────────────────┘
//! ```
//!
//! Streams are in-order queues. Work on different streams is ordered only
//! by [`BufferDefinitionEvent`]s: a buffer's producer records one, and every
//! stream that reads the buffer waits on it first.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_device::{BuildOptions, Computation, Literal, PrimitiveType, ProgramShape, Shape};
//! use tessera_runtime::{ClientConfig, LocalBuffer, LocalClient, LocalExecutable};
//!
//! # fn main() -> tessera_runtime::Result<()> {
//! let client = LocalClient::new(ClientConfig::default())?;
//!
//! let vector = Shape::array(PrimitiveType::F32, vec![3]);
//! let double = Computation::new("double", ProgramShape::new(vec![vector.clone()], vector.clone()), |args, _| {
//!     let values: Vec<f32> = args[0].to_vec()?;
//!     Ok(Literal::vector(&values.iter().map(|v| v * 2.0).collect::<Vec<_>>()))
//! });
//! let executable = LocalExecutable::compile(&double, vec![vector], BuildOptions::new(), Arc::clone(&client))?;
//!
//! let input = LocalBuffer::from_host(&vec![1.0f32, 2.0, 3.0], &client, 0)?;
//! let output = executable.execute(&[&input])?;
//! assert_eq!(output.to_host::<Vec<f32>>()?, vec![2.0, 4.0, 6.0]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod device;
pub mod device_buffer;
pub mod error;
pub mod event;
pub mod executable;
pub mod host_refs;
pub mod marshal;
pub mod worker;

pub use buffer::{BufferInfo, LocalBuffer};
pub use client::LocalClient;
pub use config::{ClientConfig, StreamMode, DEFAULT_REPLICA_TIMEOUT};
pub use device::Device;
pub use device_buffer::{DefinitionEventSet, SharedDeviceBuffer};
pub use error::{Error, ErrorKind, Result};
pub use event::BufferDefinitionEvent;
pub use executable::LocalExecutable;
pub use host_refs::{HostObject, HostRefManager, ManagedHostRefs};
pub use marshal::{HostBufferTree, Marshal};
pub use worker::{WorkerHandle, WorkerThread};
