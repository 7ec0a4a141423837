//! Compiled executables, compilers and replica placement
//!
//! [`Executable`] and [`Compiler`] are the seams a real accelerator backend
//! plugs into. [`HostCompiler`] is the reference backend: a [`Computation`]
//! carries a host closure that the resulting [`HostExecutable`] runs as
//! device work on the launch stream, reading its arguments from and writing
//! its result to device memory.

use crate::error::{DeviceError, Result};
use crate::literal::Literal;
use crate::memory::{MemoryRegion, SharedAllocator};
use crate::shape::{ArrayShape, ProgramShape, Shape};
use crate::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};
use crate::stream::Stream;
use crate::transfer::TransferManager;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Replica × computation → device ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    replica_count: usize,
    computation_count: usize,
    ordinals: Vec<usize>,
}

impl DeviceAssignment {
    pub fn new(replica_count: usize, computation_count: usize) -> Self {
        Self {
            replica_count,
            computation_count,
            ordinals: vec![0; replica_count * computation_count],
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn computation_count(&self) -> usize {
        self.computation_count
    }

    /// Panics if `replica` or `computation` is out of range.
    pub fn get(&self, replica: usize, computation: usize) -> usize {
        assert!(replica < self.replica_count && computation < self.computation_count);
        self.ordinals[replica * self.computation_count + computation]
    }

    pub fn set(&mut self, replica: usize, computation: usize, ordinal: usize) {
        assert!(replica < self.replica_count && computation < self.computation_count);
        self.ordinals[replica * self.computation_count + computation] = ordinal;
    }
}

impl fmt::Display for DeviceAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for replica in 0..self.replica_count {
            write!(f, "[")?;
            for computation in 0..self.computation_count {
                if computation > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", self.get(replica, computation))?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Default placement of replicas and computations onto devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputationPlacer;

impl ComputationPlacer {
    /// Replica `r` of computation `c` runs on device `c * replica_count + r`.
    pub fn assign_devices(replica_count: usize, computation_count: usize, device_count: usize) -> Result<DeviceAssignment> {
        if replica_count == 0 || computation_count == 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "cannot place {replica_count} replica(s) of {computation_count} computation(s)"
            )));
        }
        let needed = replica_count * computation_count;
        if needed > device_count {
            return Err(DeviceError::InvalidArgument(format!(
                "requested device count ({needed}) exceeds the number of available devices ({device_count})"
            )));
        }
        let mut assignment = DeviceAssignment::new(replica_count, computation_count);
        for replica in 0..replica_count {
            for computation in 0..computation_count {
                assignment.set(replica, computation, computation * replica_count + replica);
            }
        }
        Ok(assignment)
    }
}

/// Launch parameters for one replica.
#[derive(Clone)]
pub struct RunOptions {
    pub stream: Arc<Stream>,
    pub host_to_device_stream: Option<Arc<Stream>>,
    pub allocator: SharedAllocator,
    pub device_assignment: Option<DeviceAssignment>,
    pub replica: usize,
}

/// A program ready to launch on a device.
pub trait Executable: Send + Sync {
    /// Enqueue the program on `options.stream`; the result is allocated but
    /// may not be populated until the stream reaches the launch.
    fn run_async(&self, arguments: &[&ShapedBuffer], options: &RunOptions) -> Result<ScopedShapedBuffer>;

    fn result_shape(&self) -> &Shape;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub result_layout: Option<Shape>,
    pub num_replicas: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildOptions {
    pub fn new() -> Self {
        Self {
            result_layout: None,
            num_replicas: 1,
        }
    }

    pub fn with_result_layout(mut self, layout: Shape) -> Self {
        self.result_layout = Some(layout);
        self
    }

    pub fn with_num_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }
}

pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        computation: &Computation,
        argument_layouts: &[Shape],
        options: &BuildOptions,
    ) -> Result<Arc<dyn Executable>>;
}

/// Where a replica runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaContext {
    pub replica: usize,
    pub device_ordinal: usize,
}

pub type HostBody = Arc<dyn Fn(&[Literal], &ReplicaContext) -> Result<Literal> + Send + Sync>;

/// A named program with a host-side body.
#[derive(Clone)]
pub struct Computation {
    name: String,
    program_shape: ProgramShape,
    body: HostBody,
}

impl Computation {
    pub fn new<F>(name: impl Into<String>, program_shape: ProgramShape, body: F) -> Self
    where
        F: Fn(&[Literal], &ReplicaContext) -> Result<Literal> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            program_shape,
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program_shape(&self) -> &ProgramShape {
        &self.program_shape
    }

    pub fn body(&self) -> &HostBody {
        &self.body
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("name", &self.name)
            .field("program_shape", &self.program_shape.to_string())
            .finish()
    }
}

/// Compiles [`Computation`]s into [`HostExecutable`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCompiler {
    transfer_manager: TransferManager,
}

impl HostCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Compiler for HostCompiler {
    fn compile(
        &self,
        computation: &Computation,
        argument_layouts: &[Shape],
        options: &BuildOptions,
    ) -> Result<Arc<dyn Executable>> {
        let parameters = &computation.program_shape().parameters;
        if argument_layouts.len() != parameters.len() {
            return Err(DeviceError::InvalidArgument(format!(
                "computation {} takes {} parameter(s), {} argument layout(s) supplied",
                computation.name(),
                parameters.len(),
                argument_layouts.len()
            )));
        }
        for (layout, parameter) in argument_layouts.iter().zip(parameters) {
            if !layout.compatible(parameter) {
                return Err(DeviceError::shape_mismatch(parameter, layout));
            }
        }

        let program_result = &computation.program_shape().result;
        let result_shape = match &options.result_layout {
            Some(layout) if !layout.compatible(program_result) => {
                return Err(DeviceError::shape_mismatch(program_result, layout));
            }
            Some(layout) => layout.clone(),
            None => program_result.with_default_layouts(),
        };

        tracing::debug!(
            computation = computation.name(),
            program_shape = %computation.program_shape(),
            "host_computation_compiled"
        );
        Ok(Arc::new(HostExecutable {
            name: computation.name().to_string(),
            parameter_shapes: argument_layouts.to_vec(),
            result_shape,
            body: Arc::clone(computation.body()),
            transfer_manager: self.transfer_manager,
        }))
    }
}

pub struct HostExecutable {
    name: String,
    parameter_shapes: Vec<Shape>,
    result_shape: Shape,
    body: HostBody,
    transfer_manager: TransferManager,
}

type ResolvedLeaves = Vec<(ArrayShape, MemoryRegion)>;

impl HostExecutable {
    pub fn parameter_shapes(&self) -> &[Shape] {
        &self.parameter_shapes
    }

    fn resolve_leaves(&self, stream: &Stream, host_shape: &Shape, buffer: &ShapedBuffer) -> Result<ResolvedLeaves> {
        host_shape
            .leaf_shapes()
            .into_iter()
            .zip(buffer.leaf_buffers())
            .map(|(shape, memory)| Ok((shape.clone(), stream.executor().resolve(memory)?)))
            .collect()
    }
}

impl Executable for HostExecutable {
    fn run_async(&self, arguments: &[&ShapedBuffer], options: &RunOptions) -> Result<ScopedShapedBuffer> {
        let stream = &options.stream;
        let ordinal = stream.device_ordinal();
        if arguments.len() != self.parameter_shapes.len() {
            return Err(DeviceError::InvalidArgument(format!(
                "{} expects {} argument(s), got {}",
                self.name,
                self.parameter_shapes.len(),
                arguments.len()
            )));
        }

        let mut inputs = Vec::with_capacity(arguments.len());
        for (i, (argument, parameter)) in arguments.iter().zip(&self.parameter_shapes).enumerate() {
            if argument.device_ordinal() != ordinal {
                return Err(DeviceError::InvalidArgument(format!(
                    "argument {i} of {} is on device {} but the launch stream is on device {ordinal}",
                    self.name,
                    argument.device_ordinal()
                )));
            }
            if !argument.on_host_shape().compatible(parameter) {
                return Err(DeviceError::shape_mismatch(parameter, argument.on_host_shape()));
            }
            let host_shape = argument.on_host_shape().clone();
            let leaves = self.resolve_leaves(stream, &host_shape, argument)?;
            inputs.push((host_shape, leaves));
        }

        let result = self
            .transfer_manager
            .allocate_scoped_shaped_buffer(&self.result_shape, &options.allocator, ordinal)?;
        self.transfer_manager
            .write_tuple_index_tables_async(stream, result.as_shaped_buffer())?;
        let outputs = self.resolve_leaves(stream, &self.result_shape, result.as_shaped_buffer())?;

        let body = Arc::clone(&self.body);
        let result_shape = self.result_shape.clone();
        let context = ReplicaContext {
            replica: options.replica,
            device_ordinal: ordinal,
        };
        stream.then_execute(self.name.clone(), move || {
            let arguments = inputs
                .into_iter()
                .map(|(shape, leaves)| {
                    let leaves = leaves
                        .into_iter()
                        .map(|(leaf, region)| Literal::from_bytes(leaf, region.read().clone()))
                        .collect::<Result<Vec<_>>>()?;
                    Literal::from_leaves(&shape, leaves)
                })
                .collect::<Result<Vec<_>>>()?;

            let output = body(&arguments, &context)?;
            if !output.shape().compatible(&result_shape) {
                return Err(DeviceError::Execution(format!(
                    "computation produced {}, expected {result_shape}",
                    output.shape()
                )));
            }
            for (leaf, (_, region)) in output.leaves().into_iter().zip(outputs) {
                if let Some(data) = leaf.data() {
                    region.write().copy_from_slice(data);
                }
            }
            Ok(())
        });

        tracing::trace!(executable = %self.name, replica = options.replica, device_ordinal = ordinal, "launch_enqueued");
        Ok(result)
    }

    fn result_shape(&self) -> &Shape {
        &self.result_shape
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StreamExecutorAllocator;
    use crate::platform::{Platform, PlatformConfig};
    use crate::shape::PrimitiveType;
    use std::sync::mpsc;

    fn add_computation() -> Computation {
        let vec3 = Shape::array(PrimitiveType::F32, [3]);
        Computation::new(
            "add",
            ProgramShape::new(vec![vec3.clone(), vec3.clone()], vec3),
            |args, _| {
                let a = args[0].to_vec::<f32>()?;
                let b = args[1].to_vec::<f32>()?;
                let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
                Ok(Literal::vector(&sum))
            },
        )
    }

    fn upload(
        tm: &TransferManager,
        stream: &Stream,
        allocator: &SharedAllocator,
        literal: &Literal,
    ) -> ScopedShapedBuffer {
        let scoped = tm.allocate_scoped_shaped_buffer(&literal.shape(), allocator, 0).unwrap();
        tm.transfer_literal_to_device_async(stream, literal, scoped.as_shaped_buffer())
            .unwrap();
        scoped
    }

    #[test]
    fn test_placer_assigns_replica_per_device() {
        let assignment = ComputationPlacer::assign_devices(3, 1, 4).unwrap();
        assert_eq!((0..3).map(|r| assignment.get(r, 0)).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(assignment.to_string(), "[0][1][2]");
        assert!(ComputationPlacer::assign_devices(5, 1, 4).is_err());
        assert!(ComputationPlacer::assign_devices(0, 1, 4).is_err());
    }

    #[test]
    fn test_compile_checks_argument_layouts() {
        let compiler = HostCompiler::new();
        let computation = add_computation();
        let wrong = vec![Shape::array(PrimitiveType::F32, [3])];
        assert!(compiler.compile(&computation, &wrong, &BuildOptions::new()).is_err());

        let layouts = computation.program_shape().parameters.clone();
        let bad_result = BuildOptions::new().with_result_layout(Shape::array(PrimitiveType::S32, [3]));
        assert!(matches!(
            compiler.compile(&computation, &layouts, &bad_result),
            Err(DeviceError::ShapeMismatch { .. })
        ));

        let executable = compiler.compile(&computation, &layouts, &BuildOptions::new()).unwrap();
        assert_eq!(executable.name(), "add");
        assert!(executable.result_shape().has_layout());
    }

    #[test]
    fn test_host_executable_runs_on_stream() {
        let platform = Arc::new(Platform::new(PlatformConfig::default()));
        let allocator: SharedAllocator = Arc::new(StreamExecutorAllocator::new(Arc::clone(&platform)));
        let stream = Stream::new(platform.executor(0).unwrap()).unwrap();
        let tm = TransferManager::new();

        let computation = add_computation();
        let executable = HostCompiler::new()
            .compile(&computation, &computation.program_shape().parameters, &BuildOptions::new())
            .unwrap();

        let a = upload(&tm, &stream, &allocator, &Literal::vector(&[1.0f32, 2.0, 3.0]));
        let b = upload(&tm, &stream, &allocator, &Literal::vector(&[10.0f32, 20.0, 30.0]));
        let options = RunOptions {
            stream: Arc::clone(&stream),
            host_to_device_stream: None,
            allocator: Arc::clone(&allocator),
            device_assignment: None,
            replica: 0,
        };
        let result = executable
            .run_async(&[a.as_shaped_buffer(), b.as_shaped_buffer()], &options)
            .unwrap();

        let (sender, receiver) = mpsc::channel();
        tm.transfer_literal_from_device(&stream, result.as_shaped_buffer(), move |r| sender.send(r).unwrap())
            .unwrap();
        let sum = receiver.recv().unwrap().unwrap();
        assert_eq!(sum.to_vec::<f32>().unwrap(), vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_wrong_result_shape_fails_stream() {
        let platform = Arc::new(Platform::new(PlatformConfig::default()));
        let allocator: SharedAllocator = Arc::new(StreamExecutorAllocator::new(Arc::clone(&platform)));
        let stream = Stream::new(platform.executor(0).unwrap()).unwrap();
        let computation = Computation::new(
            "liar",
            ProgramShape::new(vec![], Shape::scalar(PrimitiveType::F32)),
            |_, _| Ok(Literal::scalar(1i32)),
        );
        let executable = HostCompiler::new()
            .compile(&computation, &[], &BuildOptions::new())
            .unwrap();
        let options = RunOptions {
            stream: Arc::clone(&stream),
            host_to_device_stream: None,
            allocator,
            device_assignment: None,
            replica: 0,
        };
        let _result = executable.run_async(&[], &options).unwrap();
        assert!(matches!(stream.block_host_until_done(), Err(DeviceError::Execution(_))));
    }
}
