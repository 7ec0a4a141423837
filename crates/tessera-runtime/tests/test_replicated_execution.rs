//! Integration tests for replicated launches
//!
//! Replica placement checks, failure annotation and the abort path taken
//! when surviving replicas never finish.

use std::sync::Arc;
use std::time::Duration;
use tessera_device::{
    BuildOptions, Compiler, Computation, DeviceError, Executable, HostCompiler, Literal, Platform,
    PrimitiveType, ProgramShape, RunOptions, ScopedShapedBuffer, Shape, ShapedBuffer, SharedAllocator,
    StreamExecutorAllocator,
};
use tessera_runtime::{ClientConfig, ErrorKind, LocalBuffer, LocalClient, LocalExecutable, StreamMode};

const ABORT_CHILD_ENV: &str = "TESSERA_TEST_REPLICA_ABORT_CHILD";

/// Fault injection around a real executable.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    fail_replica: Option<usize>,
    hang_replica: Option<usize>,
    panic_replica: Option<usize>,
}

struct FaultyExecutable {
    inner: Arc<dyn Executable>,
    faults: Faults,
}

impl Executable for FaultyExecutable {
    fn run_async(&self, arguments: &[&ShapedBuffer], options: &RunOptions) -> tessera_device::Result<ScopedShapedBuffer> {
        if self.faults.hang_replica == Some(options.replica) {
            loop {
                std::thread::park();
            }
        }
        if self.faults.panic_replica == Some(options.replica) {
            panic!("executable crashed on replica {}", options.replica);
        }
        if self.faults.fail_replica == Some(options.replica) {
            return Err(DeviceError::Execution(format!("injected fault on replica {}", options.replica)));
        }
        self.inner.run_async(arguments, options)
    }

    fn result_shape(&self) -> &Shape {
        self.inner.result_shape()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

struct FaultyCompiler {
    faults: Faults,
}

impl Compiler for FaultyCompiler {
    fn compile(
        &self,
        computation: &Computation,
        argument_layouts: &[Shape],
        options: &BuildOptions,
    ) -> tessera_device::Result<Arc<dyn Executable>> {
        let inner = HostCompiler::new().compile(computation, argument_layouts, options)?;
        Ok(Arc::new(FaultyExecutable {
            inner,
            faults: self.faults,
        }))
    }
}

fn faulty_client(devices: usize, faults: Faults, timeout: Duration) -> tessera_runtime::Result<Arc<LocalClient>> {
    tessera_tracing::init_test_tracing();
    let config = ClientConfig::new("host")
        .with_device_count(devices)
        .with_device_memory_bytes(1 << 20)
        .with_stream_mode(StreamMode::Multi)
        .with_replica_timeout(timeout);
    let platform = Arc::new(Platform::new(config.platform_config()));
    let allocator: SharedAllocator = Arc::new(StreamExecutorAllocator::new(Arc::clone(&platform)));
    LocalClient::with_platform(platform, allocator, Arc::new(FaultyCompiler { faults }), config)
}

fn scale_by_replica() -> Computation {
    let scalar = Shape::scalar(PrimitiveType::F32);
    Computation::new(
        "scale_by_replica",
        ProgramShape::new(vec![scalar.clone()], scalar),
        |args, ctx| Ok(Literal::scalar(args[0].get_scalar::<f32>()? * (ctx.replica + 1) as f32)),
    )
}

fn compile(client: &Arc<LocalClient>, replicas: usize) -> tessera_runtime::Result<LocalExecutable> {
    LocalExecutable::compile(
        &scale_by_replica(),
        vec![Shape::scalar(PrimitiveType::F32)],
        BuildOptions::new().with_num_replicas(replicas),
        Arc::clone(client),
    )
}

fn per_replica_inputs(client: &Arc<LocalClient>, replicas: usize) -> tessera_runtime::Result<Vec<LocalBuffer>> {
    (0..replicas).map(|r| LocalBuffer::from_host(&2.0f32, client, r)).collect()
}

#[test]
fn test_replicated_results_land_on_assigned_devices() -> tessera_runtime::Result<()> {
    let client = faulty_client(3, Faults::default(), Duration::from_secs(5))?;
    let executable = compile(&client, 3)?;
    let inputs = per_replica_inputs(&client, 3)?;
    let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();

    let outputs = executable.execute_per_replica(&arguments)?;
    let values = outputs.iter().map(|b| b.to_host::<f32>()).collect::<Result<Vec<_>, _>>()?;
    assert_eq!(values, vec![2.0, 4.0, 6.0]);
    let ordinals: Vec<usize> = outputs.iter().map(LocalBuffer::device_ordinal).collect();
    assert_eq!(ordinals, executable.device_ordinals());
    Ok(())
}

#[test]
fn test_argument_on_wrong_device_is_invalid() -> tessera_runtime::Result<()> {
    let client = faulty_client(2, Faults::default(), Duration::from_secs(5))?;
    let executable = compile(&client, 2)?;
    let on_device_zero = LocalBuffer::from_host(&1.0f32, &client, 0)?;

    let err = executable.execute_helper(&[&on_device_zero], 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("assigned to device 1"));

    let err = executable
        .execute_per_replica(&[vec![&on_device_zero], vec![&on_device_zero]])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.replica(), Some(1));
    Ok(())
}

#[test]
fn test_single_replica_execute_on_replicated_executable() -> tessera_runtime::Result<()> {
    let client = faulty_client(2, Faults::default(), Duration::from_secs(5))?;
    let executable = compile(&client, 2)?;
    let input = LocalBuffer::from_host(&1.0f32, &client, 0)?;
    input.block_host_until_ready()?;

    let compute = Arc::clone(client.device(0)?.compute_stream());
    let before = compute.operations_enqueued();
    let err = executable.execute(&[&input]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(compute.operations_enqueued(), before);
    Ok(())
}

#[test]
fn test_failed_replica_is_annotated_and_others_finish() -> tessera_runtime::Result<()> {
    let faults = Faults {
        fail_replica: Some(1),
        ..Faults::default()
    };
    let client = faulty_client(3, faults, Duration::from_secs(5))?;
    let executable = compile(&client, 3)?;
    let inputs = per_replica_inputs(&client, 3)?;
    let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();

    let err = executable.execute_per_replica(&arguments).unwrap_err();
    assert_eq!(err.replica(), Some(1));
    assert_eq!(err.kind(), ErrorKind::Execution);
    let message = err.to_string();
    assert!(message.contains("injected fault on replica 1"));
    assert!(message.contains("while running replica 1"));

    // The surviving replicas launched and their devices are healthy.
    for ordinal in [0, 2] {
        let device = client.device(ordinal)?;
        assert!(device.compute_stream().operations_enqueued() > 0);
        device.compute_stream().block_host_until_done()?;
    }
    Ok(())
}

#[test]
fn test_device_side_failure_surfaces_on_read() -> tessera_runtime::Result<()> {
    let client = LocalClient::new(ClientConfig::new("host"))?;
    let scalar = Shape::scalar(PrimitiveType::S32);
    let failing = Computation::new(
        "always_fails",
        ProgramShape::new(vec![scalar.clone()], scalar.clone()),
        |_, _| Err(DeviceError::Execution("kernel trapped".to_string())),
    );
    let executable = LocalExecutable::compile(&failing, vec![scalar], BuildOptions::new(), Arc::clone(&client))?;
    let input = LocalBuffer::from_host(&1i32, &client, 0)?;

    let output = executable.execute(&[&input])?;
    let err = output.to_host::<i32>().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    Ok(())
}

#[test]
fn test_panicking_replica_is_reported_as_failure() -> tessera_runtime::Result<()> {
    let faults = Faults {
        panic_replica: Some(1),
        ..Faults::default()
    };
    let client = faulty_client(3, faults, Duration::from_millis(200))?;
    let executable = compile(&client, 3)?;
    let inputs = per_replica_inputs(&client, 3)?;

    let (sender, receiver) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();
        let _ = sender.send(executable.execute_per_replica(&arguments).map(|outputs| outputs.len()));
    });

    let result = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("execute_per_replica should return after a replica panics");
    let err = result.unwrap_err();
    assert_eq!(err.replica(), Some(1));
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("replica 1 panicked"));
    Ok(())
}

/// Replica 1 fails while replica 2 never returns; the caller must abort.
fn run_stuck_launch() -> tessera_runtime::Result<()> {
    let faults = Faults {
        fail_replica: Some(1),
        hang_replica: Some(2),
        panic_replica: None,
    };
    let client = faulty_client(3, faults, Duration::from_millis(200))?;
    let executable = compile(&client, 3)?;
    let inputs = per_replica_inputs(&client, 3)?;
    let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();
    let _ = executable.execute_per_replica(&arguments);
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_stuck_replicas_abort_the_process() {
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};

    if std::env::var_os(ABORT_CHILD_ENV).is_some() {
        // Reaching the end means the launch returned instead of aborting.
        let _ = run_stuck_launch();
        return;
    }

    let status = Command::new(std::env::current_exe().unwrap())
        .args(["test_stuck_replicas_abort_the_process", "--exact", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();

    assert!(!status.success());
    assert_eq!(status.signal(), Some(6), "child should die from SIGABRT, got {status:?}");
}
