//! Domains: isolated heaps with a single-runner gate.
//!
//! A [`Domain`] owns a [`ValueStore`], a set of root objects and the thread
//! contexts currently executing in it. The heap is only reachable through a
//! [`DomainGuard`], which exists while the calling thread holds the domain's
//! [`RunGate`].
use std::{
    cell::UnsafeCell,
    collections::HashMap,
    fmt,
    marker::PhantomData,
    ptr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    CollectionStats, DomainId, DomainSettings, HeapValue, ObjectId, Payload, Program,
    RootObject, RootProvider, RunGate, Value, ValueRef, ValueStore, collector,
    scan::{self, ScanRegion},
    threads::{self, ThreadContext},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DomainKind {
    Normal,
    /// Created with the registry, only removed by shutdown.
    Default,
}

#[derive(Debug)]
struct DomainHeap {
    store: ValueStore,
    objects: HashMap<ObjectId, RootObject, ahash::RandomState>,
    allocated_since: usize,
    last_collection: Option<CollectionStats>,
}

// Published copies of heap numbers, readable without the gate.
#[derive(Debug, Default)]
struct Counters {
    values: AtomicUsize,
    objects: AtomicUsize,
    threshold: AtomicUsize,
    collections: AtomicU64,
}

pub struct Domain {
    id: DomainId,
    name: String,
    kind: DomainKind,
    settings: DomainSettings,
    gate: RunGate,
    heap: UnsafeCell<DomainHeap>,
    contexts: Mutex<Vec<Arc<ThreadContext>>>,
    counters: Counters,
}

// SAFETY: `heap` is only accessed through a DomainGuard, and at most one
// guard exists at a time because creating one requires holding `gate`
unsafe impl Sync for Domain {}

/// Longest prefix of `name` that fits `max` bytes without splitting a char.
fn truncate_name(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

impl Domain {
    pub(crate) fn new(
        id: DomainId,
        name: Option<&str>,
        kind: DomainKind,
        settings: DomainSettings,
    ) -> Self {
        let name = match name {
            Some(name) => truncate_name(name, settings.max_name_len).to_owned(),
            None => {
                let generated = format!("Domain-{id}");
                truncate_name(&generated, settings.max_name_len).to_owned()
            }
        };
        let counters = Counters::default();
        counters
            .threshold
            .store(settings.first_collection_after, Ordering::Relaxed);

        Self {
            id,
            name,
            kind,
            gate: RunGate::new(),
            heap: UnsafeCell::new(DomainHeap {
                store: ValueStore::new(),
                objects: HashMap::default(),
                allocated_since: 0,
                last_collection: None,
            }),
            contexts: Mutex::new(Vec::new()),
            counters,
            settings,
        }
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    #[inline]
    pub fn settings(&self) -> &DomainSettings {
        &self.settings
    }

    #[inline]
    pub fn gate(&self) -> &RunGate {
        &self.gate
    }

    /// Thread contexts currently registered with this domain.
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Takes the gate without registering a thread context.
    ///
    /// The calling thread's stack is not a root while it holds the domain
    /// this way, use [`Domain::run`] for that.
    pub fn enter(&self) -> DomainGuard<'_> {
        self.gate.enter();
        DomainGuard {
            domain: self,
            _not_send: PhantomData,
        }
    }

    /// Executes `f` inside this domain with the calling thread's stack as a
    /// root.
    ///
    /// # Panics
    /// if the calling thread already executes inside a domain, switch with
    /// [`DomainGuard::switch_to`] instead.
    pub fn run<R>(&self, f: impl FnOnce(&mut DomainGuard<'_>) -> R) -> R {
        if let Some(current) = threads::active_domain() {
            panic!(
                "thread already runs in domain {current}, use switch_to to enter {}",
                self.id
            );
        }
        self.run_nested(f)
    }

    fn run_nested<R>(&self, f: impl FnOnce(&mut DomainGuard<'_>) -> R) -> R {
        let anchor = 0usize;
        let start_sp = scan::stack_anchor(&anchor);

        let mut guard = self.enter();
        let context = Arc::new(ThreadContext::new(start_sp));
        self.contexts.lock().push(context.clone());
        threads::push_active(self.id, context);
        // dropped before the guard, the context leaves while the gate is held
        let _stay = Stay { domain: self };

        call(f, &mut guard)
    }

    fn deregister(&self) {
        let context = threads::pop_active(self.id);
        let mut contexts = self.contexts.lock();
        let index = contexts
            .iter()
            .position(|c| Arc::ptr_eq(c, &context))
            .unwrap_or_else(|| panic!("thread context missing from domain {}", self.id));
        contexts.swap_remove(index);
    }

    /// Releases everything this domain owns. Called by the registry only.
    pub(crate) fn teardown(&self) {
        let mut guard = self.enter();
        let contexts = self.context_count();
        assert_eq!(
            contexts, 0,
            "domain {} destroyed with {contexts} active thread contexts",
            self.id
        );

        let ids: Vec<ObjectId> = guard.heap().objects.keys().copied().collect();
        let objects = ids.len();
        for id in ids {
            if guard.leave_object(id).is_none() {
                panic!("root object {id} vanished during teardown of domain {}", self.id);
            }
        }
        assert_eq!(
            self.counters.objects.load(Ordering::Relaxed),
            0,
            "root objects survived teardown of domain {}",
            self.id
        );

        if cfg!(debug_assertions) {
            let stats = guard.collect();
            assert_eq!(
                stats.survivors, 0,
                "unreachable values survived teardown of domain {}",
                self.id
            );
        }

        let released = guard.heap_mut().store.clear();
        self.counters.values.store(0, Ordering::Relaxed);
        log::debug!(
            "domain {} '{}' torn down ({objects} objects, {released} values released)",
            self.id,
            self.name
        );
    }

    pub fn snapshot(&self) -> DomainSnapshot {
        DomainSnapshot {
            kind: self.kind,
            id: self.id,
            name: self.name.clone(),
            running: self.gate.is_running(),
            waiters: self.gate.waiters(),
            holder: self.gate.holder(),
            contended: self.gate.contended(),
            contexts: self.context_count(),
            values: self.counters.values.load(Ordering::Relaxed),
            objects: self.counters.objects.load(Ordering::Relaxed),
            threshold: self.counters.threshold.load(Ordering::Relaxed),
            collections: self.counters.collections.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

// keeps `f`'s locals in a frame below the caller's stack anchor
#[inline(never)]
fn call<'d, R>(f: impl FnOnce(&mut DomainGuard<'d>) -> R, guard: &mut DomainGuard<'d>) -> R {
    f(guard)
}

struct Stay<'d> {
    domain: &'d Domain,
}

impl Drop for Stay<'_> {
    fn drop(&mut self) {
        self.domain.deregister();
    }
}

struct Reenter<'d> {
    gate: &'d RunGate,
}

impl Drop for Reenter<'_> {
    fn drop(&mut self) {
        self.gate.enter();
    }
}

struct DomainRoots<'a> {
    contexts: &'a [Arc<ThreadContext>],
    objects: &'a HashMap<ObjectId, RootObject, ahash::RandomState>,
}

impl RootProvider for DomainRoots<'_> {
    fn visit_regions(&self, visitor: &mut dyn FnMut(ScanRegion)) {
        for context in self.contexts {
            visitor(context.window());
        }
        for object in self.objects.values() {
            visitor(object.region());
        }
    }
}

/// Exclusive access to a domain's heap, the gate is released on drop.
pub struct DomainGuard<'d> {
    domain: &'d Domain,
    // the gate belongs to the thread that took it
    _not_send: PhantomData<*const ()>,
}

impl<'d> DomainGuard<'d> {
    #[inline]
    pub fn domain(&self) -> &'d Domain {
        self.domain
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.domain.id
    }

    #[inline]
    fn heap(&self) -> &DomainHeap {
        // SAFETY: this guard holds the gate
        unsafe { &*self.domain.heap.get() }
    }

    #[inline]
    fn heap_mut(&mut self) -> &mut DomainHeap {
        // SAFETY: this guard holds the gate and is borrowed mutably
        unsafe { &mut *self.domain.heap.get() }
    }

    /// Releases the domain.
    pub fn leave(self) {}

    // ── Values ────────────────────────────────────────────────────────

    pub fn alloc(&mut self, payload: Payload) -> ValueRef {
        let heap = self.heap_mut();
        let r = heap.store.allocate(payload);
        heap.allocated_since += 1;
        let values = heap.store.len();
        self.domain.counters.values.store(values, Ordering::Relaxed);
        r
    }

    pub fn alloc_string(&mut self, s: impl Into<String>) -> ValueRef {
        self.alloc(Payload::String(s.into()))
    }

    pub fn alloc_buffer(&mut self, bytes: impl Into<Vec<u8>>) -> ValueRef {
        self.alloc(Payload::Buffer(bytes.into()))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> ValueRef {
        self.alloc(Payload::Array(items))
    }

    pub fn alloc_mapping(&mut self, pairs: Vec<(Value, Value)>) -> ValueRef {
        self.alloc(Payload::Mapping(pairs))
    }

    /// The value behind `r`, `None` if it is not a live value of this domain.
    #[inline]
    pub fn get(&self, r: ValueRef) -> Option<&HeapValue> {
        self.heap().store.get(r)
    }

    #[inline]
    pub fn get_mut(&mut self, r: ValueRef) -> Option<&mut HeapValue> {
        self.heap_mut().store.get_mut(r)
    }

    /// Handle for a word read from a payload or root object.
    #[inline]
    pub fn reference(&self, value: Value) -> Option<ValueRef> {
        self.heap().store.reference(value)
    }

    #[inline]
    pub fn value_count(&self) -> usize {
        self.heap().store.len()
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Allocation count that triggers the next collection at a safepoint.
    #[inline]
    pub fn threshold(&self) -> usize {
        self.domain.counters.threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn allocated_since_collection(&self) -> usize {
        self.heap().allocated_since
    }

    pub fn last_collection(&self) -> Option<CollectionStats> {
        self.heap().last_collection
    }

    /// Runs a full collection of this domain's heap.
    ///
    /// Callee-saved registers of the calling frames are spilled first, so a
    /// value held only in a register is seen by the stack scan.
    pub fn collect(&mut self) -> CollectionStats {
        scan::with_spilled_registers(|| self.collect_spilled())
    }

    fn collect_spilled(&mut self) -> CollectionStats {
        threads::refresh_current_context(self.domain.id);

        let domain = self.domain;
        let contexts = domain.contexts.lock();
        let heap = self.heap_mut();
        let roots = DomainRoots {
            contexts: &contexts,
            objects: &heap.objects,
        };
        let stats = collector::collect(&mut heap.store, &roots, &domain.settings);
        drop(contexts);

        heap.allocated_since = 0;
        heap.last_collection = Some(stats);
        let counters = &domain.counters;
        counters.values.store(stats.survivors, Ordering::Relaxed);
        counters.threshold.store(stats.next_threshold, Ordering::Relaxed);
        counters.collections.fetch_add(1, Ordering::Relaxed);
        stats
    }

    /// Collects if enough allocations happened since the last collection.
    pub fn safepoint(&mut self) -> Option<CollectionStats> {
        if self.heap().allocated_since < self.threshold() {
            return None;
        }
        Some(self.collect())
    }

    // ── Root objects ──────────────────────────────────────────────────

    /// Adds `object` to the root set.
    ///
    /// # Panics
    /// if `object` was created for another domain.
    pub fn join_object(&mut self, object: RootObject) -> ObjectId {
        assert_eq!(
            object.owning_domain(),
            self.domain.id,
            "object {} joined a foreign domain",
            object.id()
        );
        let id = object.id();
        let heap = self.heap_mut();
        heap.objects.insert(id, object);
        let objects = heap.objects.len();
        self.domain.counters.objects.store(objects, Ordering::Relaxed);
        id
    }

    /// Removes an object from the root set and hands it back.
    pub fn leave_object(&mut self, id: ObjectId) -> Option<RootObject> {
        let heap = self.heap_mut();
        let object = heap.objects.remove(&id);
        let objects = heap.objects.len();
        self.domain.counters.objects.store(objects, Ordering::Relaxed);
        object
    }

    pub fn instantiate(&mut self, program: Arc<Program>) -> ObjectId {
        let object = RootObject::new(self.domain.id, program);
        self.join_object(object)
    }

    #[inline]
    pub fn object(&self, id: ObjectId) -> Option<&RootObject> {
        self.heap().objects.get(&id)
    }

    #[inline]
    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut RootObject> {
        self.heap_mut().objects.get_mut(&id)
    }

    #[inline]
    pub fn object_count(&self) -> usize {
        self.heap().objects.len()
    }

    // ── Switching ─────────────────────────────────────────────────────

    /// Runs `f` inside `other`, releasing this domain meanwhile.
    ///
    /// The calling thread's stack up to this call stays a root of this
    /// domain, so values referenced from it survive collections other
    /// threads run here while `f` executes.
    pub fn switch_to<R>(
        &mut self,
        other: &Domain,
        f: impl FnOnce(&mut DomainGuard<'_>) -> R,
    ) -> R {
        assert!(
            !ptr::eq(self.domain, other),
            "switch to domain {} which is already held",
            other.id
        );
        let domain = self.domain;
        scan::with_spilled_registers(move || {
            threads::refresh_current_context(domain.id);
            domain.gate.leave();
            let _reenter = Reenter { gate: &domain.gate };
            other.run_nested(f)
        })
    }
}

impl Drop for DomainGuard<'_> {
    fn drop(&mut self) {
        self.domain.gate.leave();
    }
}

impl fmt::Debug for DomainGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainGuard")
            .field("domain", &self.domain.id)
            .finish()
    }
}

/// Point in time view of a domain, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSnapshot {
    pub kind: DomainKind,
    pub id: DomainId,
    pub name: String,
    pub running: bool,
    pub waiters: usize,
    pub holder: Option<u64>,
    pub contended: u64,
    pub contexts: usize,
    pub values: usize,
    pub objects: usize,
    pub threshold: usize,
    pub collections: u64,
}

impl fmt::Display for DomainSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DomainKind::Normal => "",
            DomainKind::Default => " (default)",
        };
        write!(f, "{} '{}'{kind}: ", self.id, self.name)?;
        match self.holder {
            Some(holder) => write!(f, "running on thread {holder}")?,
            None => f.write_str("idle")?,
        }
        write!(
            f,
            ", {} waiting, {} contended, {} contexts, {} values, {} objects, threshold {}, {} collections",
            self.waiters,
            self.contended,
            self.contexts,
            self.values,
            self.objects,
            self.threshold,
            self.collections
        )
    }
}
