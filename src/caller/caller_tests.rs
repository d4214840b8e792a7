//! Unit tests for caller construction and call validation.

use super::*;
use crate::device::{DeviceId, DeviceInfo};

fn model_config(shapes: Vec<BatchDims>) -> Arc<ModelConfig> {
    Arc::new(ModelConfig {
        name: "unit".into(),
        chunk_size: 100,
        stride: 5,
        channels: 1,
        num_states: 5,
        batch_shapes: shapes,
        batch_timeout_ms: 100,
        seed: 7,
    })
}

fn devices(memory: u64) -> Arc<DeviceManager> {
    Arc::new(DeviceManager::new(vec![DeviceInfo::cpu(memory)]))
}

fn caller_with(shapes: Vec<BatchDims>, config: CallerConfig) -> Result<Arc<Caller>, CallerError> {
    Caller::with_reference_model(model_config(shapes), config, &devices(64 << 20))
}

fn fixed(batch_size: usize) -> CallerConfig {
    CallerConfig { batch_size, ..Default::default() }
}

#[test]
fn extra_shapes_are_deduplicated_and_inherit_batch_size() {
    let shapes = vec![BatchDims::new(0, 100), BatchDims::new(0, 50), BatchDims::new(8, 50)];
    let caller = caller_with(shapes, fixed(4)).unwrap();
    assert_eq!(
        caller.batch_dims(),
        &[BatchDims::new(4, 100), BatchDims::new(4, 50), BatchDims::new(8, 50)]
    );
}

#[test]
fn extra_shape_with_bad_chunk_is_config_error() {
    // Caught by ModelConfig::validate before shape expansion.
    let err = caller_with(vec![BatchDims::new(0, 52)], fixed(4)).err().unwrap();
    assert!(matches!(err, CallerError::Config { .. }));
}

#[test]
fn zero_chunk_size_uses_model_default() {
    let caller = caller_with(vec![], fixed(2)).unwrap();
    assert_eq!(caller.batch_dims()[0].chunk_size, 100);
}

#[test]
fn explicit_chunk_size_must_match_stride() {
    let config = CallerConfig { chunk_size: 103, ..fixed(2) };
    assert!(matches!(caller_with(vec![], config), Err(CallerError::Config { .. })));
}

#[test]
fn auto_batch_size_is_granule_multiple() {
    let caller = caller_with(vec![], CallerConfig::default()).unwrap();
    let batch = caller.batch_dims()[0].batch_size;
    assert!(batch >= BATCH_GRANULARITY);
    assert_eq!(batch % BATCH_GRANULARITY, 0);
    assert!(batch <= MAX_AUTO_BATCH_SIZE);
}

#[test]
fn auto_batch_size_fails_when_budget_too_small() {
    let result = Caller::with_reference_model(model_config(vec![]), CallerConfig::default(), &devices(4096));
    assert!(matches!(result, Err(CallerError::ResourceExhausted { .. })));
}

#[test]
fn memory_fraction_must_be_in_unit_interval() {
    for fraction in [0.0, -0.5, 1.5, f32::NAN] {
        let config = CallerConfig { memory_limit_fraction: fraction, ..fixed(2) };
        assert!(
            matches!(caller_with(vec![], config), Err(CallerError::Config { .. })),
            "fraction {fraction} accepted"
        );
    }
}

#[test]
fn unknown_device_is_config_error() {
    let config = CallerConfig { device: "cuda:3".into(), ..fixed(2) };
    let err = caller_with(vec![], config).err().unwrap();
    assert!(matches!(err, CallerError::Config { .. }));
    assert_eq!(err.device(), "cuda:3");
}

#[test]
fn buffer_index_out_of_range_is_invalid_input() {
    let caller = caller_with(vec![], fixed(2)).unwrap();
    assert!(matches!(caller.create_input_buffer(1), Err(CallerError::InvalidInput { .. })));
    assert!(matches!(caller.create_output_buffer(5), Err(CallerError::InvalidInput { .. })));
}

#[test]
fn context_from_another_device_is_rejected() {
    let caller = caller_with(vec![], fixed(2)).unwrap();
    let mut input = caller.create_input_buffer(0).unwrap();
    let mut output = caller.create_output_buffer(0).unwrap();
    let foreign = ExecutionContext::new(99, DeviceId::cuda(0));
    let err = caller.call_chunks(&mut input, &mut output, 1, &foreign).unwrap_err();
    assert!(matches!(err, CallerError::InvalidInput { .. }));
}

#[test]
fn detached_storage_is_rejected() {
    let caller = caller_with(vec![], fixed(2)).unwrap();
    let ctx = caller.create_execution_context();
    let mut input = caller.create_input_buffer(0).unwrap();
    let mut output = caller.create_output_buffer(0).unwrap();
    let _ = input.take_samples();
    let err = caller.call_chunks(&mut input, &mut output, 1, &ctx).unwrap_err();
    assert!(matches!(err, CallerError::InvalidInput { .. }));
}

#[test]
fn mismatched_output_shape_is_rejected() {
    let shapes = vec![BatchDims::new(0, 50)];
    let caller = caller_with(shapes, fixed(2)).unwrap();
    let ctx = caller.create_execution_context();
    let mut input = caller.create_input_buffer(0).unwrap();
    let mut output = caller.create_output_buffer(1).unwrap();
    let err = caller.call_chunks(&mut input, &mut output, 1, &ctx).unwrap_err();
    assert!(matches!(err, CallerError::InvalidInput { .. }));
}

#[test]
fn context_ids_are_unique() {
    let caller = caller_with(vec![], fixed(2)).unwrap();
    let a = caller.create_execution_context();
    let b = caller.create_execution_context();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.device(), &caller.device().id);
}

#[test]
fn stats_include_memory_and_state() {
    let caller = caller_with(vec![], fixed(2)).unwrap();
    let stats = caller.sample_stats();
    assert_eq!(stats["running"], 1.0);
    assert_eq!(stats["queue_depth"], 0.0);
    assert!(stats["memory_reserved_bytes"] > 0.0);
    assert!(stats["memory_peak_bytes"] >= stats["memory_reserved_bytes"]);
    assert_eq!(stats["memory_budget_bytes"], caller.memory_budget() as f64);

    caller.terminate();
    assert_eq!(caller.sample_stats()["running"], 0.0);
}
