//! Conservative mark-sweep collector.
//!
//! Roots are memory regions, not values: the stack windows of every thread
//! context registered with the domain and the member blocks of its root
//! objects. Every word in a region that equals the address of a live cell
//! keeps that cell alive. Marking is exact from there on and walks composite
//! payloads through a worklist.
use std::time::{Duration, Instant};

use crate::{
    DomainSettings, HeapValue, Storage, Value, ValueStore, Visitable,
    scan::{self, ScanRegion},
};

/// Supplies the regions scanned for roots.
pub trait RootProvider {
    fn visit_regions(&self, visitor: &mut dyn FnMut(ScanRegion));
}

/// Result of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub before: usize,
    pub survivors: usize,
    pub freed: usize,
    /// Words read from root regions.
    pub root_words: usize,
    pub duration: Duration,
    /// Allocation count that triggers the next collection.
    pub next_threshold: usize,
}

/// Survivor count clamped to the configured window.
#[inline]
pub fn next_threshold(survivors: usize, min: usize, max: usize) -> usize {
    survivors.clamp(min, max)
}

/// Runs one full collection over `store`.
///
/// Every region `roots` yields must stay readable until this returns.
pub fn collect<S: Storage>(
    store: &mut ValueStore<S>,
    roots: &impl RootProvider,
    settings: &DomainSettings,
) -> CollectionStats {
    let threshold = |survivors| {
        next_threshold(
            survivors,
            settings.min_collect_threshold,
            settings.max_collect_threshold,
        )
    };

    if store.is_empty() {
        return CollectionStats {
            next_threshold: threshold(0),
            ..Default::default()
        };
    }

    let start = Instant::now();
    let root_words = mark(store, roots);
    let outcome = store.sweep();
    let duration = start.elapsed();

    let stats = CollectionStats {
        before: outcome.before,
        survivors: outcome.survivors,
        freed: outcome.freed,
        root_words,
        duration,
        next_threshold: threshold(outcome.survivors),
    };
    log::debug!(
        "gc: {} -> {} values ({} freed, {} root words) in {:?}",
        stats.before,
        stats.survivors,
        stats.freed,
        stats.root_words,
        stats.duration
    );
    stats
}

fn mark<S: Storage>(store: &ValueStore<S>, roots: &impl RootProvider) -> usize {
    let mut worklist: Vec<&HeapValue> = Vec::new();
    let mut root_words = 0;

    roots.visit_regions(&mut |region| {
        // SAFETY: the provider guarantees the region is readable for the
        // duration of the collection
        let words = unsafe {
            scan::scan_words(region, |word| {
                if let Some(value) = store.resolve(word) {
                    if store.mark(value) {
                        worklist.push(value);
                    }
                }
            })
        };
        log::trace!("gc: scanned {words} words of {region:?}");
        root_words += words;
    });

    // Drain worklist
    while let Some(value) = worklist.pop() {
        value.visit_edges(&mut |edge: Value| {
            if let Some(target) = store.resolve(edge.raw()) {
                if store.mark(target) {
                    worklist.push(target);
                }
            }
        });
    }

    root_words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DenseStorage, KeyedStorage, Payload, ValueRef, WORD_SIZE};

    /// Roots held in plain buffers, scanned exactly like root objects.
    #[derive(Default)]
    struct TestRoots {
        blocks: Vec<Vec<usize>>,
    }

    impl TestRoots {
        fn push(&mut self, values: Vec<Value>) {
            self.push_words(values.into_iter().map(Value::raw).collect());
        }

        fn push_words(&mut self, words: Vec<usize>) {
            self.blocks.push(words);
        }
    }

    impl RootProvider for TestRoots {
        fn visit_regions(&self, visitor: &mut dyn FnMut(ScanRegion)) {
            for block in &self.blocks {
                visitor(ScanRegion::Block {
                    start: block.as_ptr() as usize,
                    len: block.len() * WORD_SIZE,
                });
            }
        }
    }

    fn settings() -> DomainSettings {
        DomainSettings::default()
    }

    fn array<S: Storage>(store: &mut ValueStore<S>, items: Vec<Value>) -> ValueRef {
        store.allocate(Payload::Array(items))
    }

    fn string<S: Storage>(store: &mut ValueStore<S>, s: &str) -> ValueRef {
        store.allocate(Payload::String(s.to_owned()))
    }

    fn nested_composites_survive<S: Storage>() {
        let mut store = ValueStore::<S>::new();
        let leaf = string(&mut store, "leaf");
        let key = string(&mut store, "key");
        let map = store.allocate(Payload::Mapping(vec![(key.as_value(), leaf.as_value())]));
        let inner = array(&mut store, vec![map.as_value(), Value::from_fixnum(1)]);
        let outer = array(&mut store, vec![inner.as_value()]);
        let garbage = string(&mut store, "garbage");

        let mut roots = TestRoots::default();
        roots.push(vec![outer.as_value()]);

        let stats = collect(&mut store, &roots, &settings());
        assert_eq!(stats.before, 6);
        assert_eq!(stats.survivors, 5);
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.root_words, 1);
        for r in [leaf, key, map, inner, outer] {
            assert!(store.contains(r));
        }
        assert!(!store.contains(garbage));
    }

    fn unreachable_value_is_reclaimed<S: Storage>() {
        let mut store = ValueStore::<S>::new();
        let kept = string(&mut store, "kept");
        let lost = string(&mut store, "lost");

        let mut roots = TestRoots::default();
        roots.push(vec![kept.as_value(), Value::from_fixnum(3), Value::nil()]);

        let stats = collect(&mut store, &roots, &settings());
        assert_eq!(stats.freed, 1);
        assert!(store.contains(kept));
        assert!(!store.contains(lost));
    }

    fn collection_is_idempotent<S: Storage>() {
        let mut store = ValueStore::<S>::new();
        let kept = array(&mut store, vec![Value::nil()]);
        for i in 0..10 {
            string(&mut store, &i.to_string());
        }
        let mut roots = TestRoots::default();
        roots.push(vec![kept.as_value()]);

        let first = collect(&mut store, &roots, &settings());
        assert_eq!(first.survivors, 1);
        let second = collect(&mut store, &roots, &settings());
        assert_eq!(second.before, 1);
        assert_eq!(second.survivors, 1);
        assert_eq!(second.freed, 0);
        let value = store.get(kept).unwrap();
        assert!(!store.is_marked(value), "marks are cleared after a sweep");
    }

    fn cycles_are_collected<S: Storage>() {
        let mut store = ValueStore::<S>::new();
        let a = array(&mut store, vec![Value::nil()]);
        let b = array(&mut store, vec![a.as_value()]);
        store.get_mut(a).unwrap().as_array_mut().unwrap()[0] = b.as_value();

        let mut roots = TestRoots::default();
        roots.push(vec![a.as_value()]);
        let stats = collect(&mut store, &roots, &settings());
        assert_eq!(stats.survivors, 2, "rooted cycle must terminate and survive");

        let stats = collect(&mut store, &TestRoots::default(), &settings());
        assert_eq!(stats.freed, 2, "unrooted cycle is garbage");
        assert!(store.is_empty());
        assert_eq!(store.bounds(), None);
    }

    fn interior_and_stale_words_keep_nothing<S: Storage>() {
        let mut store = ValueStore::<S>::new();
        let a = string(&mut store, "a");
        let b = string(&mut store, "b");

        let mut roots = TestRoots::default();
        roots.push(vec![
            Value::from_fixnum(a.addr() as i64),
            Value::from_fixnum(b.addr() as i64),
        ]);
        // interior words, never a cell address
        roots.push_words(vec![a.addr() + 1, b.addr() + WORD_SIZE]);

        let stats = collect(&mut store, &roots, &settings());
        assert_eq!(stats.survivors, 0);
    }

    #[test]
    fn dense_nested_composites_survive() {
        nested_composites_survive::<DenseStorage>();
    }

    #[test]
    fn keyed_nested_composites_survive() {
        nested_composites_survive::<KeyedStorage>();
    }

    #[test]
    fn dense_unreachable_value_is_reclaimed() {
        unreachable_value_is_reclaimed::<DenseStorage>();
    }

    #[test]
    fn keyed_unreachable_value_is_reclaimed() {
        unreachable_value_is_reclaimed::<KeyedStorage>();
    }

    #[test]
    fn dense_collection_is_idempotent() {
        collection_is_idempotent::<DenseStorage>();
    }

    #[test]
    fn keyed_collection_is_idempotent() {
        collection_is_idempotent::<KeyedStorage>();
    }

    #[test]
    fn dense_cycles_are_collected() {
        cycles_are_collected::<DenseStorage>();
    }

    #[test]
    fn keyed_cycles_are_collected() {
        cycles_are_collected::<KeyedStorage>();
    }

    #[test]
    fn dense_interior_and_stale_words_keep_nothing() {
        interior_and_stale_words_keep_nothing::<DenseStorage>();
    }

    #[test]
    fn keyed_interior_and_stale_words_keep_nothing() {
        interior_and_stale_words_keep_nothing::<KeyedStorage>();
    }

    #[test]
    fn empty_store_is_a_noop() {
        let mut store = ValueStore::<DenseStorage>::new();
        let stats = collect(&mut store, &TestRoots::default(), &settings());
        assert_eq!(stats.before, 0);
        assert_eq!(stats.root_words, 0);
        assert_eq!(stats.next_threshold, 1024);
    }

    #[test]
    fn threshold_is_clamped() {
        let s = settings();
        let clamp = |n| next_threshold(n, s.min_collect_threshold, s.max_collect_threshold);
        assert_eq!(clamp(0), 1024);
        assert_eq!(clamp(50_000), 50_000);
        assert_eq!(clamp(10_000_000), 4_194_304);
    }

    #[test]
    fn survivors_drive_next_threshold() {
        let mut store = ValueStore::<DenseStorage>::new();
        let kept: Vec<Value> = (0..2000)
            .map(|i| string(&mut store, &i.to_string()).as_value())
            .collect();
        let mut roots = TestRoots::default();
        roots.push(kept);

        let stats = collect(&mut store, &roots, &settings());
        assert_eq!(stats.survivors, 2000);
        assert_eq!(stats.next_threshold, 2000);
    }
}
