//! Integration tests for host-facing buffers
//!
//! Round trips through device memory, tuple construction and destructuring,
//! definition-event bookkeeping and the lifetime of shared allocations.

use proptest::prelude::*;
use std::sync::mpsc;
use std::sync::Arc;
use tessera_device::{Literal, PrimitiveType, Shape};
use tessera_runtime::{ClientConfig, LocalBuffer, LocalClient, StreamMode};

fn client(devices: usize, mode: StreamMode) -> tessera_runtime::Result<Arc<LocalClient>> {
    tessera_tracing::init_test_tracing();
    LocalClient::new(
        ClientConfig::new("host")
            .with_device_count(devices)
            .with_device_memory_bytes(1 << 20)
            .with_stream_mode(mode),
    )
}

/// Wait for every stream on `ordinal` and for the jobs they handed to the worker.
fn quiesce(client: &LocalClient, ordinal: usize) -> tessera_runtime::Result<()> {
    let device = client.device(ordinal)?;
    device.executor().synchronize_all_activity();
    let (tx, rx) = mpsc::channel();
    device.execute_on_worker_thread(move || {
        let _ = tx.send(());
    });
    rx.recv().map_err(|e| tessera_runtime::Error::Internal(e.to_string()))
}

#[test]
fn test_make_tuple_then_destructure_shares_allocations() -> tessera_runtime::Result<()> {
    for mode in [StreamMode::Single, StreamMode::Multi] {
        let client = client(1, mode)?;
        let a = LocalBuffer::from_host(&vec![1i32, 2, 3], &client, 0)?;
        let b = LocalBuffer::from_host(&2.5f64, &client, 0)?;

        let tuple = LocalBuffer::make_tuple(&[a.clone(), b.clone()], &client, 0)?;
        assert_eq!(
            tuple.on_host_shape(),
            &Shape::tuple(vec![
                Shape::array(PrimitiveType::S32, vec![3]),
                Shape::scalar(PrimitiveType::F64),
            ])
        );

        let parts = tuple.destructure_tuple()?;
        assert_eq!(parts.len(), 2);
        for (part, original) in parts.iter().zip([&a, &b]) {
            let shared = part.device_buffer()?;
            assert!(Arc::ptr_eq(shared, original.device_buffer()?));
            assert_eq!(shared.device_memory().memory(), original.device_buffer()?.device_memory().memory());
            assert_eq!(part.on_host_shape(), original.on_host_shape());
        }

        assert_eq!(parts[0].to_host::<Vec<i32>>()?, vec![1, 2, 3]);
        assert_eq!(parts[1].to_host::<f64>()?, 2.5);
        assert_eq!(
            tuple.to_literal()?,
            Literal::tuple(vec![Literal::vector(&[1i32, 2, 3]), Literal::scalar(2.5f64)])
        );
    }
    Ok(())
}

#[test]
fn test_tuple_index_table_points_at_children() -> tessera_runtime::Result<()> {
    let client = client(1, StreamMode::Single)?;
    let a = LocalBuffer::from_host(&vec![7u8; 5], &client, 0)?;
    let b = LocalBuffer::from_host(&vec![9u16; 2], &client, 0)?;
    let tuple = LocalBuffer::make_tuple(&[a.clone(), b.clone()], &client, 0)?;

    let device = client.device(0)?;
    let table_memory = tuple.device_buffer()?.device_memory().memory();
    let table = client
        .transfer_manager()
        .read_device_memory(device.compute_stream(), table_memory)?;
    let ids: Vec<u64> = table
        .chunks_exact(8)
        .map(|entry| u64::from_le_bytes(entry.try_into().unwrap_or_default()))
        .collect();
    assert_eq!(
        ids,
        vec![
            a.device_buffer()?.device_memory().memory().id(),
            b.device_buffer()?.device_memory().memory().id(),
        ]
    );
    Ok(())
}

#[test]
fn test_definition_event_waits_are_idempotent_per_stream() -> tessera_runtime::Result<()> {
    let client = client(1, StreamMode::Multi)?;
    let buffer = LocalBuffer::from_host(&vec![0.5f32; 8], &client, 0)?;
    let d2h = Arc::clone(client.device(0)?.device_to_host_stream());

    let before = d2h.waits_enqueued();
    buffer.to_literal()?;
    buffer.to_literal()?;
    buffer.block_host_until_ready()?;
    assert_eq!(d2h.waits_enqueued() - before, 1);

    let event = buffer.device_buffer()?.definition_event().cloned();
    let event = event.ok_or_else(|| tessera_runtime::Error::Internal("missing definition event".into()))?;
    assert!(event.is_defined_on(&d2h));
    assert_eq!(event.streams_defined_on().len(), 2);
    Ok(())
}

#[test]
fn test_shared_tree_released_after_last_handle() -> tessera_runtime::Result<()> {
    let client = client(1, StreamMode::Single)?;
    let first = LocalBuffer::from_host(&vec![3u32; 16], &client, 0)?;
    let second = first.clone();
    let memory = first.device_buffer()?.device_memory().memory();
    let executor = Arc::clone(client.device(0)?.executor());

    quiesce(&client, 0)?;
    assert_eq!(Arc::strong_count(first.device_buffer()?), 2);

    drop(first);
    assert!(executor.is_allocated(memory));
    assert_eq!(second.to_host::<Vec<u32>>()?, vec![3; 16]);

    drop(second);
    assert!(!executor.is_allocated(memory));
    Ok(())
}

#[test]
fn test_deleting_one_handle_keeps_the_other_valid() -> tessera_runtime::Result<()> {
    let client = client(1, StreamMode::Multi)?;
    let mut doomed = LocalBuffer::from_host(&vec![1i64, 2], &client, 0)?;
    let survivor = doomed.clone();
    doomed.delete();
    assert!(doomed.is_deleted());
    assert!(!survivor.is_deleted());
    assert_eq!(survivor.to_host::<Vec<i64>>()?, vec![1, 2]);
    Ok(())
}

#[test]
fn test_from_host_values_across_devices() -> tessera_runtime::Result<()> {
    let client = client(2, StreamMode::Multi)?;
    let values: Vec<(Vec<f32>, usize)> = (0..8).map(|i| (vec![i as f32; i + 1], i % 2)).collect();
    let buffers = LocalBuffer::from_host_values(&values, &client)?;
    assert_eq!(buffers.len(), values.len());
    for (buffer, (value, ordinal)) in buffers.iter().zip(&values) {
        assert_eq!(buffer.device_ordinal(), *ordinal);
        assert_eq!(&buffer.to_host::<Vec<f32>>()?, value);
    }
    Ok(())
}

#[test]
fn test_failed_upload_releases_its_allocations() -> tessera_runtime::Result<()> {
    let client = LocalClient::new(ClientConfig::new("host").with_device_memory_bytes(64))?;
    let value = Literal::tuple(vec![Literal::vector(&[0u8; 32]), Literal::vector(&[0u8; 32])]);
    let err = LocalBuffer::from_host(&value, &client, 0).unwrap_err();
    assert_eq!(err.kind(), tessera_runtime::ErrorKind::Allocation);
    quiesce(&client, 0)?;
    assert_eq!(client.memory_usage()[0].in_use, 0);
    Ok(())
}

fn leaf_strategy() -> impl Strategy<Value = Literal> {
    prop_oneof![
        prop::collection::vec(any::<i32>(), 0..24).prop_map(|v| Literal::vector(&v)),
        prop::collection::vec(-1.0e6f64..1.0e6, 0..12).prop_map(|v| Literal::vector(&v)),
        any::<u8>().prop_map(Literal::scalar),
    ]
}

fn literal_strategy() -> impl Strategy<Value = Literal> {
    leaf_strategy().prop_recursive(2, 12, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Literal::tuple)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn host_values_roundtrip_through_device(literal in literal_strategy(), multi in any::<bool>()) {
        let mode = if multi { StreamMode::Multi } else { StreamMode::Single };
        let client = client(1, mode).unwrap();
        let buffer = LocalBuffer::from_host(&literal, &client, 0).unwrap();
        prop_assert_eq!(buffer.to_literal().unwrap(), literal);
    }
}
