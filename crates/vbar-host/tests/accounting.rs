//! Host allocation accounting properties

use proptest::prelude::*;
use std::sync::Arc;
use vbar_core::{EngineConfig, EngineRegistry};
use vbar_driver::{align_up, DeviceId, DevicePtr, MockDeviceConfig, MockDriver, StreamHandle};
use vbar_host::HostAllocator;

const GRANULE: usize = 2 << 20;

#[derive(Clone, Debug)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..(48 << 20)).prop_map(Op::Alloc),
        (0usize..16).prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn usage_matches_live_granules(ops in proptest::collection::vec(op(), 1..60)) {
        let driver = Arc::new(MockDriver::new(MockDeviceConfig::with_memory(256 << 20)));
        let config = EngineConfig { host_headroom: 0, ..EngineConfig::default() };
        let registry = Arc::new(EngineRegistry::new(driver, config).unwrap());
        let allocator = HostAllocator::new(registry, DeviceId(0));
        let stream = StreamHandle::default_stream();

        let mut live: Vec<(DevicePtr, usize)> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(ptr) = allocator.alloc(size, stream) {
                        live.push((ptr, size));
                    }
                }
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (ptr, _) = live.swap_remove(pick % live.len());
                        allocator.free(ptr, stream).unwrap();
                    }
                }
            }
            let expected: usize = live.iter().map(|&(_, size)| align_up(size, GRANULE)).sum();
            prop_assert_eq!(allocator.total_usage(), expected);
            prop_assert_eq!(allocator.live_allocations(), live.len());
            prop_assert!(expected <= 256 << 20);
        }
    }
}
