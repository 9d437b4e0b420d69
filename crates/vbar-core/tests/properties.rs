//! Property tests for the residency engine
//!
//! Random sequences of faults, unpins, priority changes and reclaims are
//! replayed against the mock driver; after every step the watermark, pin,
//! generation and pool invariants must hold.

use proptest::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use vbar_core::page::PageSpan;
use vbar_core::{DeviceEngine, EngineConfig, FaultOutcome, Signature, VbarId};
use vbar_driver::{DeviceId, MockDeviceConfig, MockDriver};

const PAGE: usize = 2 << 20;
const PAGES: usize = 12;

#[derive(Clone, Debug)]
enum Op {
    Fault { buf: usize, first: usize, pages: usize },
    Unpin { buf: usize, first: usize, pages: usize },
    Prioritize(usize),
    Deprioritize(usize),
    FreeMemory { buf: usize, pages: usize },
    Reclaim(usize),
}

fn range() -> impl Strategy<Value = (usize, usize, usize)> {
    (0..2usize, 0..PAGES, 1..4usize).prop_map(|(buf, first, pages)| (buf, first, pages.min(PAGES - first)))
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => range().prop_map(|(buf, first, pages)| Op::Fault { buf, first, pages }),
        3 => range().prop_map(|(buf, first, pages)| Op::Unpin { buf, first, pages }),
        1 => (0..2usize).prop_map(Op::Prioritize),
        1 => (0..2usize).prop_map(Op::Deprioritize),
        1 => (0..2usize, 1..4usize).prop_map(|(buf, pages)| Op::FreeMemory { buf, pages }),
        1 => (1..6usize).prop_map(Op::Reclaim),
    ]
}

struct Harness {
    driver: Arc<MockDriver>,
    engine: DeviceEngine,
    bufs: [VbarId; 2],
    limits: [usize; 2],
    pins: FxHashMap<(usize, usize), u32>,
    generations: FxHashMap<(usize, usize), u32>,
}

impl Harness {
    fn new(budget_pages: usize, limits: [usize; 2]) -> Self {
        let driver = Arc::new(MockDriver::new(MockDeviceConfig::with_memory(1 << 30)));
        let config = EngineConfig {
            page_size: PAGE,
            physical_budget: budget_pages * PAGE,
            ..EngineConfig::default()
        };
        let engine = DeviceEngine::new(driver.clone(), DeviceId(0), config).unwrap();
        let bufs = [
            engine.create(PAGES * PAGE).unwrap(),
            engine.create(PAGES * PAGE).unwrap(),
        ];
        for (id, limit) in bufs.iter().zip(limits) {
            engine.set_watermark_limit(*id, limit * PAGE).unwrap();
        }
        Self {
            driver,
            engine,
            bufs,
            limits,
            pins: FxHashMap::default(),
            generations: FxHashMap::default(),
        }
    }

    fn apply(&mut self, op: &Op) -> Result<(), TestCaseError> {
        match *op {
            Op::Fault { buf, first, pages } => {
                let outcome = self
                    .engine
                    .fault(self.bufs[buf], first * PAGE, pages * PAGE)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if let FaultOutcome::Resident(sig) = outcome {
                    self.check_generations(buf, &sig)?;
                    for page in first..first + pages {
                        *self.pins.entry((buf, page)).or_default() += 1;
                    }
                }
            }
            Op::Unpin { buf, first, pages } => {
                self.engine
                    .unpin(self.bufs[buf], first * PAGE, pages * PAGE)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                for page in first..first + pages {
                    let pins = self.pins.entry((buf, page)).or_default();
                    *pins = pins.saturating_sub(1);
                }
            }
            Op::Prioritize(buf) => self.engine.prioritize(self.bufs[buf]).unwrap(),
            Op::Deprioritize(buf) => self.engine.deprioritize(self.bufs[buf]).unwrap(),
            Op::FreeMemory { buf, pages } => {
                let freed = self.engine.free_memory(self.bufs[buf], pages * PAGE).unwrap();
                prop_assert_eq!(freed % PAGE, 0);
            }
            Op::Reclaim(pages) => {
                self.engine.reclaim(pages * PAGE).unwrap();
            }
        }
        self.check_invariants()
    }

    fn check_generations(&mut self, buf: usize, sig: &Signature) -> Result<(), TestCaseError> {
        for (i, &generation) in sig.generations().iter().enumerate() {
            let key = (buf, sig.first_page() + i);
            let last = self.generations.entry(key).or_default();
            prop_assert!(generation >= *last, "generation went backwards on {:?}", key);
            *last = generation;
        }
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), TestCaseError> {
        if let Err(msg) = self.engine.verify_consistency() {
            return Err(TestCaseError::fail(msg));
        }
        for (buf, &id) in self.bufs.iter().enumerate() {
            let loaded = self.engine.loaded_size(id).unwrap();
            if self.limits[buf] != 0 {
                prop_assert!(loaded <= self.limits[buf] * PAGE);
            }
            let base = self.engine.base(id).unwrap();
            for page in 0..PAGES {
                if self.pins.get(&(buf, page)).copied().unwrap_or(0) > 0 {
                    prop_assert!(
                        self.driver.is_mapped(base.offset(page * PAGE)),
                        "pinned page {} of buffer {} is not mapped",
                        page,
                        buf
                    );
                }
            }
        }
        let budget = self.engine.config().physical_budget;
        prop_assert!(self.engine.pool_stats().committed_bytes <= budget);
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn residency_invariants_hold(
        budget in 2..10usize,
        limits in (0..6usize, 0..6usize),
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let mut harness = Harness::new(budget, [limits.0, limits.1]);
        for op in &ops {
            harness.apply(op)?;
        }
    }

    #[test]
    fn alloc_ranges_never_overlap(sizes in prop::collection::vec(0..(3 * PAGE), 1..40)) {
        let driver = Arc::new(MockDriver::new(MockDeviceConfig::with_memory(1 << 30)));
        let config = EngineConfig { page_size: PAGE, ..EngineConfig::default() };
        let engine = DeviceEngine::new(driver, DeviceId(0), config).unwrap();
        let id = engine.create(16 * PAGE).unwrap();

        let mut previous_end = 0;
        for size in sizes {
            match engine.alloc(id, size) {
                Ok(a) => {
                    prop_assert_eq!(a.offset % 512, 0);
                    prop_assert!(a.offset >= previous_end);
                    prop_assert!(a.end() <= 16 * PAGE);
                    previous_end = a.end();
                }
                Err(_) => prop_assert!(previous_end.next_multiple_of(512) + size > 16 * PAGE),
            }
        }
    }

    #[test]
    fn signature_slots_cover_any_range(offset in 0..(64 * PAGE), size in 0..(16 * PAGE)) {
        let span = PageSpan::covering(offset, size, PAGE);
        prop_assert!(span.len() <= Signature::slots_for(size, PAGE));
    }
}
