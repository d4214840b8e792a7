//! Integration tests for Caller execution, memory budgeting and device claims.

use std::sync::Arc;

use basecall_runtime::{
    Caller, CallerConfig, CallerError, DecodedChunk, DeviceManager, ModelConfig, ModelRunner,
};

const CHUNK: usize = 1000;

fn model_config() -> Arc<ModelConfig> {
    Arc::new(ModelConfig {
        name: "test_fast".to_string(),
        chunk_size: CHUNK,
        stride: 5,
        channels: 1,
        num_states: 5,
        batch_shapes: Vec::new(),
        batch_timeout_ms: 100,
        seed: 42,
    })
}

fn devices(memory: u64) -> Arc<DeviceManager> {
    Arc::new(DeviceManager::detect(memory))
}

fn caller(batch_size: usize) -> Arc<Caller> {
    let config = CallerConfig { batch_size, chunk_size: CHUNK, ..Default::default() };
    Caller::with_reference_model(model_config(), config, &devices(256 << 20)).unwrap()
}

/// Deterministic pseudo-signal for chunk `seed`.
fn signal(seed: u64) -> Vec<f32> {
    (0..CHUNK)
        .map(|i| (((i as u64 + 1) * (seed + 3)) % 97) as f32 / 48.5 - 1.0)
        .collect()
}

fn call(runner: &mut ModelRunner, chunks: &[Vec<f32>]) -> Vec<DecodedChunk> {
    for (slot, chunk) in chunks.iter().enumerate() {
        runner.accept_chunk(slot, chunk).unwrap();
    }
    runner.call_chunks(chunks.len()).unwrap()
}

// === Scenarios ===

#[test]
fn four_zero_chunks_decode_identically_across_runs() {
    let caller = caller(4);
    let mut runner = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let zeros = vec![vec![0.0f32; CHUNK]; 4];

    let first = call(&mut runner, &zeros);
    assert_eq!(first.len(), 4);
    assert!(first.iter().all(|c| c == &first[0]));
    assert_eq!(first[0].moves.len(), CHUNK / 5);

    for _ in 0..3 {
        assert_eq!(call(&mut runner, &zeros), first);
    }
}

#[test]
fn partial_batch_returns_only_valid_chunks() {
    let caller = caller(4);
    let mut runner = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let results = call(&mut runner, &[signal(1), signal(2)]);
    assert_eq!(results.len(), 2);
    assert_eq!(caller.sample_stats()["chunks_executed"], 2.0);
}

#[test]
fn empty_call_returns_no_results() {
    let caller = caller(4);
    let mut runner = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    assert!(runner.call_chunks(0).unwrap().is_empty());
    assert_eq!(caller.sample_stats()["batches_executed"], 0.0);
}

// === Determinism and isolation ===

#[test]
fn result_depends_only_on_own_chunk() {
    let caller = caller(4);
    let mut runner = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let target = signal(7);

    let alone = call(&mut runner, &[target.clone()]);
    let batched = call(&mut runner, &[signal(1), signal(2), signal(3), target.clone()]);
    let reordered = call(&mut runner, &[target, signal(9)]);

    assert_eq!(batched[3], alone[0]);
    assert_eq!(reordered[0], alone[0]);
}

#[test]
fn slots_beyond_valid_count_do_not_contaminate() {
    let caller = caller(4);
    let mut clean = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let mut poisoned = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let valid = [signal(11), signal(12)];

    let expected = call(&mut clean, &valid);

    poisoned.accept_chunk(2, &vec![f32::NAN; CHUNK]).unwrap();
    poisoned.accept_chunk(3, &vec![1.0e30; CHUNK]).unwrap();
    let actual = call(&mut poisoned, &valid);

    assert_eq!(actual, expected);
}

#[test]
fn same_signal_gives_same_result_on_different_runners() {
    let caller = caller(2);
    let mut a = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let mut b = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    assert_eq!(call(&mut a, &[signal(5)]), call(&mut b, &[signal(5)]));
}

// === Input validation ===

#[test]
fn wrong_chunk_length_is_invalid_input() {
    let caller = caller(4);
    let mut runner = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let err = runner.accept_chunk(0, &[0.0; 10]).unwrap_err();
    assert!(matches!(err, CallerError::InvalidInput { .. }));
    assert!(err.is_fatal());
    assert_eq!(err.device(), "cpu");
}

#[test]
fn slot_out_of_range_is_invalid_input() {
    let caller = caller(4);
    let mut runner = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let err = runner.accept_chunk(4, &signal(0)).unwrap_err();
    assert!(matches!(err, CallerError::InvalidInput { .. }));
}

#[test]
fn too_many_chunks_is_invalid_input() {
    let caller = caller(4);
    let mut runner = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let err = runner.call_chunks(5).unwrap_err();
    assert!(matches!(err, CallerError::InvalidInput { .. }));
    assert_eq!(caller.sample_stats()["batches_executed"], 0.0);
}

// === Memory budget ===

// batch 4 × 1000 samples: input 16_000 B, output 8_000 B, workspace 16_000 B.
const BUDGET_DEVICE_MEMORY: u64 = 54_000;

fn small_caller() -> Arc<Caller> {
    let config = CallerConfig { batch_size: 4, chunk_size: CHUNK, memory_limit_fraction: 1.0, ..Default::default() };
    Caller::with_reference_model(model_config(), config, &devices(BUDGET_DEVICE_MEMORY)).unwrap()
}

#[test]
fn buffer_allocation_beyond_budget_is_resource_exhausted() {
    let caller = small_caller();
    assert_eq!(caller.memory_budget(), 54_000);

    let _a = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let _b = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let err = ModelRunner::new(Arc::clone(&caller), 0).unwrap_err();

    match err {
        CallerError::ResourceExhausted { device, requested, available } => {
            assert_eq!(device, "cpu");
            assert_eq!(requested, 16_000);
            assert!(available < requested);
        }
        other => panic!("expected ResourceExhausted, got {other:?}"),
    }
}

#[test]
fn workspace_exhaustion_is_retryable_and_recovers() {
    let caller = small_caller();
    let mut a = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let b = ModelRunner::new(Arc::clone(&caller), 0).unwrap();

    a.accept_chunk(0, &signal(1)).unwrap();
    let err = a.call_chunks(4).unwrap_err();
    assert!(err.is_retryable());

    // A single chunk needs only 4_000 B of workspace.
    assert_eq!(a.call_chunks(1).unwrap().len(), 1);

    drop(b);
    assert_eq!(a.call_chunks(4).unwrap().len(), 4);
}

#[test]
fn auto_batch_size_fits_budget() {
    let config = CallerConfig { chunk_size: CHUNK, expected_runners: 2, ..Default::default() };
    let caller = Caller::with_reference_model(model_config(), config, &devices(8 << 20)).unwrap();
    let batch = caller.batch_dims()[0].batch_size;
    assert!(batch > 0 && batch % basecall_runtime::caller::BATCH_GRANULARITY == 0);

    let _a = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    let mut b = ModelRunner::new(Arc::clone(&caller), 0).unwrap();
    for slot in 0..batch {
        b.accept_chunk(slot, &signal(slot as u64)).unwrap();
    }
    assert_eq!(b.call_chunks(batch).unwrap().len(), batch);
}

// === Device claims ===

#[test]
fn exclusive_caller_blocks_other_callers() {
    let devices = devices(256 << 20);
    let exclusive = CallerConfig { batch_size: 4, exclusive_gpu_access: true, ..Default::default() };
    let shared = CallerConfig { batch_size: 4, ..Default::default() };

    let first = Caller::with_reference_model(model_config(), exclusive.clone(), &devices).unwrap();
    assert!(first.is_exclusive());
    let err = Caller::with_reference_model(model_config(), shared.clone(), &devices).unwrap_err();
    assert!(matches!(err, CallerError::Config { .. }));

    drop(first);
    let second = Caller::with_reference_model(model_config(), shared, &devices).unwrap();
    let err = Caller::with_reference_model(model_config(), exclusive, &devices).unwrap_err();
    assert!(matches!(err, CallerError::Config { .. }));
    drop(second);
}

#[test]
fn shared_callers_coexist() {
    let devices = devices(256 << 20);
    let config = CallerConfig { batch_size: 2, ..Default::default() };
    let a = Caller::with_reference_model(model_config(), config.clone(), &devices).unwrap();
    let b = Caller::with_reference_model(model_config(), config, &devices).unwrap();
    assert_eq!(devices.holders(&a.device().id), 2);

    let mut ra = ModelRunner::new(Arc::clone(&a), 0).unwrap();
    let mut rb = ModelRunner::new(Arc::clone(&b), 0).unwrap();
    assert_eq!(call(&mut ra, &[signal(3)]), call(&mut rb, &[signal(3)]));
}

#[test]
fn errors_name_their_device() {
    let config = CallerConfig { device: "metal".to_string(), ..Default::default() };
    let err = Caller::with_reference_model(model_config(), config, &devices(1 << 20)).unwrap_err();
    assert!(matches!(err, CallerError::Config { .. }));
    assert_eq!(err.device(), "metal");
}
