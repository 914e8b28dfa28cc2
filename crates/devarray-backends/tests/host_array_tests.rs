//! Device array behavior against the host-emulated backend.
//! Run with: cargo test -p devarray-backends -- --nocapture

use std::sync::Arc;

use devarray_backends::host::{HostArray, HostContext, HostOp};
use devarray_backends::host::memory::{ILLEGAL_ADDRESS, OUT_OF_MEMORY};
use devarray_backends::BackendConfig;
use devarray_core::{ArrayError, ArrayExt, ArrayInterface, ComputeContext, ContextSelector, ErrorKind};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn int_bytes(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_ne_bytes()).collect()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_fresh_allocation_is_readable() {
    init_tracing();
    let ctx = HostContext::new(0);
    for &(size, element_size) in &[(1usize, 1usize), (3, 4), (100, 8), (17, 12)] {
        let array = HostArray::with_context(&ctx, size, element_size, "fresh").unwrap();
        let mut out = vec![0u8; size * element_size];
        array.download(&mut out, true).unwrap();
        assert_eq!(out.len(), size * element_size);
    }
    assert_eq!(ctx.live_allocations(), 0);
}

#[test]
fn test_double_initialize_keeps_first_allocation() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "first").unwrap();
    let err = array.initialize(&ctx, 8, 4, "second").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);

    array.upload_slice(&[1i32, 2, 3, 4], true).unwrap();
    assert_eq!(array.download_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(ctx.stats().allocations, 1);
}

#[test]
fn test_out_of_memory_reports_name_and_code() {
    let ctx = HostContext::with_capacity(0, Some(64));
    let _small = HostArray::with_context(&ctx, 8, 4, "small").unwrap();
    let mut big = HostArray::new();
    let err = big.initialize(&ctx, 16, 4, "big").unwrap_err();
    match &err {
        ArrayError::Allocation { name, error } => {
            assert_eq!(name, "big");
            assert_eq!(error.code, OUT_OF_MEMORY);
            assert_eq!(error.description, "out of memory");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!big.is_initialized());
    assert_eq!(ctx.used_bytes(), 32);
}

#[test]
fn test_resize_discards_contents_and_keeps_shape_metadata() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "grow").unwrap();
    array.upload_slice(&[9i32; 4], true).unwrap();
    array.resize(6).unwrap();
    assert_eq!(array.size(), 6);
    assert_eq!(array.element_size(), 4);
    assert_eq!(array.name(), "grow");
    assert_eq!(array.download_vec::<i32>().unwrap(), vec![0; 6]);
    assert_eq!(ctx.used_bytes(), 24);
    assert_eq!(ctx.stats().frees, 1);
}

#[test]
fn test_resize_of_borrowed_array_is_refused() {
    let ctx = HostContext::new(0);
    let owner = HostArray::with_context(&ctx, 4, 4, "owner").unwrap();
    let mut view = unsafe {
        HostArray::from_raw_parts(Arc::clone(&ctx), owner.device_pointer(), 4, 4, "view")
    };
    let err = view.resize(2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BorrowedArray);
    assert_eq!(view.size(), 4);
    assert_eq!(view.device_pointer(), owner.device_pointer());
    assert_eq!(ctx.stats().frees, 0);
    assert_eq!(ctx.live_allocations(), 1);
}

#[test]
fn test_deallocation_failure_during_resize() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "sticky").unwrap();
    ctx.inject_failure(HostOp::Free, ILLEGAL_ADDRESS);
    let err = array.resize(8).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deallocation);
    assert_eq!(err.driver_error().unwrap().code, ILLEGAL_ADDRESS);
    assert!(array.is_initialized());
    assert_eq!(array.size(), 4);
}

#[test]
fn test_drop_after_context_teardown_makes_no_free_call() {
    let ctx = HostContext::new(0);
    let array = HostArray::with_context(&ctx, 16, 4, "orphan").unwrap();
    ctx.invalidate();
    drop(array);
    assert_eq!(ctx.stats().frees, 0);
    assert_eq!(ctx.live_allocations(), 0);
}

#[test]
#[should_panic(expected = "error deleting array 'corrupt'")]
fn test_free_failure_on_drop_is_fatal() {
    let ctx = HostContext::new(0);
    let array = HostArray::with_context(&ctx, 4, 4, "corrupt").unwrap();
    ctx.inject_failure(HostOp::Free, ILLEGAL_ADDRESS);
    drop(array);
}

// ============================================================================
// Transfers
// ============================================================================

#[test]
fn test_upload_prefix_then_download() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 10, 4, "prefix").unwrap();
    let data = int_bytes(100..106);
    array.upload_sub_array(&data, 0, 6, true).unwrap();
    let mut out = vec![0u8; 40];
    array.download(&mut out, true).unwrap();
    assert_eq!(&out[..24], &data[..]);
}

#[test]
fn test_upload_out_of_range_mutates_nothing() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "bounded").unwrap();
    array.upload_slice(&[1i32, 2, 3, 4], true).unwrap();
    let before = ctx.stats();

    for (offset, count) in [(0usize, 5usize), (3, 2), (4, 1), (usize::MAX, 1)] {
        let err = array
            .upload_sub_array(&int_bytes(0..8), offset, count, true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Range, "offset {offset} count {count}");
    }

    assert_eq!(ctx.stats(), before);
    assert_eq!(array.download_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_non_blocking_transfers_go_through_stream() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "async").unwrap();
    array.upload_sub_array(&int_bytes([5, 6]), 1, 2, false).unwrap();
    let mut out = vec![0u8; 16];
    array.download(&mut out, false).unwrap();
    ctx.synchronize().unwrap();
    assert_eq!(out, int_bytes([0, 5, 6, 0]));
    assert_eq!(ctx.stats().async_calls, 2);
}

#[test]
fn test_upload_transfer_error() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "flaky").unwrap();
    ctx.inject_failure(HostOp::Upload, ILLEGAL_ADDRESS);
    let err = array.upload(&int_bytes(0..4), true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert_eq!(
        err.to_string(),
        "error uploading array 'flaky': an illegal memory access was encountered (700)"
    );
}

#[test]
fn test_typed_helpers_check_element_size() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 3, 8, "doubles").unwrap();
    let err = array.upload_slice(&[1.0f32, 2.0, 3.0], true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ElementSizeMismatch);
    let err = array.upload_slice(&[1.0f64, 2.0], true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleArray);

    array.upload_slice(&[1.5f64, 2.5, 3.5], true).unwrap();
    assert_eq!(array.download_vec::<f64>().unwrap(), vec![1.5, 2.5, 3.5]);
    assert!(array.download_vec::<u32>().is_err());
}

// ============================================================================
// Device-to-device copies
// ============================================================================

#[test]
fn test_copy_then_resize_scenario() {
    init_tracing();
    let ctx = HostContext::new(0);
    let mut a = HostArray::with_context(&ctx, 100, 4, "A").unwrap();
    let values: Vec<i32> = (0..100).collect();
    a.upload_slice(&values, true).unwrap();

    let mut b = HostArray::with_context(&ctx, 100, 4, "B").unwrap();
    a.copy_to(&mut b).unwrap();
    ctx.synchronize().unwrap();
    assert_eq!(b.download_vec::<i32>().unwrap(), values);

    a.resize(50).unwrap();
    let err = a.copy_to(&mut b).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleArray);
    assert_eq!(b.download_vec::<i32>().unwrap(), values);
}

#[test]
fn test_copy_after_independent_resize() {
    let ctx = HostContext::new(0);
    let a = HostArray::with_context(&ctx, 8, 4, "a").unwrap();
    let mut b = HostArray::with_context(&ctx, 8, 4, "b").unwrap();
    a.copy_to(&mut b).unwrap();
    b.resize(9).unwrap();
    let before = ctx.stats().device_copies;
    assert_eq!(a.copy_to(&mut b).unwrap_err().kind(), ErrorKind::IncompatibleArray);
    assert_eq!(ctx.stats().device_copies, before);
}

#[test]
fn test_copy_into_uninitialized_destination() {
    let ctx = HostContext::new(0);
    let a = HostArray::with_context(&ctx, 0, 4, "a").unwrap();
    let mut b = HostArray::new();
    assert_eq!(a.copy_to(&mut b).unwrap_err().kind(), ErrorKind::NotInitialized);
}

#[test]
fn test_copy_through_interface_objects() {
    let config = BackendConfig::host();
    let ctx = config.open().unwrap();

    let mut src: Box<dyn ArrayInterface> = Box::new(HostArray::new());
    let mut dst: Box<dyn ArrayInterface> = Box::new(HostArray::new());
    src.initialize(&ctx, 3, 2, "src").unwrap();
    dst.initialize(&ctx, 3, 2, "dst").unwrap();

    src.upload_slice(&[7u16, 8, 9], true).unwrap();
    src.copy_to(dst.as_mut()).unwrap();
    assert_eq!(dst.download_vec::<u16>().unwrap(), vec![7, 8, 9]);
    assert!(dst.downcast_ref::<HostArray>().is_some());
}

/// An array of some other backend, as another subsystem might hold.
struct ForeignArray;

impl ArrayInterface for ForeignArray {
    fn size(&self) -> usize {
        4
    }
    fn element_size(&self) -> usize {
        4
    }
    fn name(&self) -> &str {
        "foreign"
    }
    fn is_initialized(&self) -> bool {
        true
    }
    fn backend_name(&self) -> &'static str {
        "opencl"
    }
    fn initialize(
        &mut self,
        _: &Arc<dyn ComputeContext>,
        _: usize,
        _: usize,
        _: &str,
    ) -> devarray_core::Result<()> {
        unreachable!()
    }
    fn resize(&mut self, _: usize) -> devarray_core::Result<()> {
        unreachable!()
    }
    fn upload_sub_array(&mut self, _: &[u8], _: usize, _: usize, _: bool) -> devarray_core::Result<()> {
        unreachable!()
    }
    fn download(&self, _: &mut [u8], _: bool) -> devarray_core::Result<()> {
        unreachable!()
    }
    fn copy_to(&self, _: &mut dyn ArrayInterface) -> devarray_core::Result<()> {
        unreachable!()
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[test]
fn test_copy_to_other_backend_fails_fast() {
    let ctx = HostContext::new(0);
    let a = HostArray::with_context(&ctx, 4, 4, "a").unwrap();
    let mut foreign = ForeignArray;
    let err = a.copy_to(&mut foreign).unwrap_err();
    assert!(matches!(
        err,
        ArrayError::BackendMismatch { expected: "host", found: "opencl", what: "array" }
    ));
    assert_eq!(ctx.stats().device_copies, 0);
}

#[test]
fn test_copy_across_contexts_is_refused() {
    let first = HostContext::new(0);
    let second = HostContext::new(1);
    let mut a = HostArray::with_context(&first, 4, 4, "a").unwrap();
    let mut bystander = HostArray::with_context(&first, 4, 4, "bystander").unwrap();
    let mut b = HostArray::with_context(&second, 4, 4, "b").unwrap();
    let _neighbor = HostArray::with_context(&second, 4, 4, "neighbor").unwrap();

    a.upload_slice(&[1i32, 2, 3, 4], true).unwrap();
    bystander.upload_slice(&[9i32; 4], true).unwrap();
    b.upload_slice(&[7i32; 4], true).unwrap();

    let err = a.copy_to(&mut b).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextMismatch);
    assert_eq!(
        err.to_string(),
        "error copying array 'a' to 'b': the arrays belong to different contexts"
    );
    assert_eq!(first.stats().device_copies, 0);
    assert_eq!(second.stats().device_copies, 0);
    assert_eq!(b.download_vec::<i32>().unwrap(), vec![7; 4]);
    assert_eq!(bystander.download_vec::<i32>().unwrap(), vec![9; 4]);
}

#[test]
fn test_device_addresses_unique_across_contexts() {
    let first = HostContext::new(0);
    let second = HostContext::new(1);
    let a = HostArray::with_context(&first, 4, 4, "a").unwrap();
    let b = HostArray::with_context(&second, 4, 4, "b").unwrap();
    assert_ne!(a.device_pointer(), b.device_pointer());
}

#[test]
fn test_long_resize_loop_keeps_valid_allocations() {
    let ctx = HostContext::new(0);
    let keeper = HostArray::with_context(&ctx, 2, 4, "keeper").unwrap();
    let mut churn = HostArray::with_context(&ctx, 1, 4, "churn").unwrap();
    for step in 0..5_000 {
        churn.resize(1 + step % 7).unwrap();
        assert!(churn.is_initialized());
        assert_ne!(churn.device_pointer(), keeper.device_pointer());
    }
    assert_eq!(ctx.live_allocations(), 2);
}

// ============================================================================
// Context discipline
// ============================================================================

#[test]
fn test_operations_restore_ambient_context() {
    let ambient = HostContext::new(0);
    let other = HostContext::new(1);
    let _selector = ContextSelector::new(&*ambient).unwrap();

    let mut array = HostArray::with_context(&other, 4, 4, "elsewhere").unwrap();
    assert!(ambient.is_current());
    array.upload_slice(&[1i32, 2, 3, 4], true).unwrap();
    assert!(ambient.is_current());

    let err = array.upload_sub_array(&[], 0, 1, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Range);
    assert!(ambient.is_current());

    other.inject_failure(HostOp::Download, ILLEGAL_ADDRESS);
    assert!(array.download_vec::<i32>().is_err());
    assert!(ambient.is_current());
}

#[test]
fn test_operations_after_teardown_fail_with_activation_error() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "late").unwrap();
    ctx.invalidate();
    let err = array.upload_slice(&[0i32; 4], true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextActivation);
}

#[test]
fn test_arrays_move_across_threads() {
    let ctx = HostContext::new(0);
    let mut array = HostArray::with_context(&ctx, 4, 4, "sent").unwrap();
    let handle = std::thread::spawn(move || {
        array.upload_slice(&[4i32, 3, 2, 1], true).unwrap();
        array
    });
    let array = handle.join().unwrap();
    assert_eq!(array.download_vec::<i32>().unwrap(), vec![4, 3, 2, 1]);
    assert_eq!(HostContext::current_id(), None);
}
