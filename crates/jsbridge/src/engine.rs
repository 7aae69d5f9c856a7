//! Engine Manager
//!
//! Owns isolate creation and disposal, the per-thread entered stack that
//! enforces isolate affinity, and the process-wide engine lifecycle.
//!
//! An [`Engine`] is `!Send`: it and everything built on it stay on the
//! thread that created it. Separate engines on separate threads run
//! independently; the only state they share is the process lifecycle
//! counter behind [`PROCESS`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rquickjs::Runtime;
use rquickjs::allocator::{Allocator, RustAllocator};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::ContextInner;
use crate::debug::{DebugAction, DebugEvent, DebugListener};
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Process-unique isolate identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(pub(crate) u64);

impl IsolateId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for IsolateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "isolate-{}", self.0)
    }
}

/// Process-unique context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_context_id() -> ContextId {
    ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
}

// ─────────────────────────────────────────────────────────────────────────────
// Process lifecycle
// ─────────────────────────────────────────────────────────────────────────────

struct ProcessState {
    live_isolates: usize,
    next_isolate: u64,
    /// Incremented on every init, so restarts are visible in logs.
    generation: u64,
}

/// Reference-counted process-wide engine state. The first isolate
/// initializes it, the last one to drop tears it down.
static PROCESS: Mutex<ProcessState> = parking_lot::const_mutex(ProcessState {
    live_isolates: 0,
    next_isolate: 1,
    generation: 0,
});

fn acquire_process() -> IsolateId {
    let mut state = PROCESS.lock();
    if state.live_isolates == 0 {
        state.generation += 1;
        info!(
            target: "jsbridge::engine",
            generation = state.generation,
            "guest runtime initialized"
        );
    }
    state.live_isolates += 1;
    let id = IsolateId(state.next_isolate);
    state.next_isolate += 1;
    id
}

fn release_process() {
    let mut state = PROCESS.lock();
    state.live_isolates = state.live_isolates.saturating_sub(1);
    if state.live_isolates == 0 {
        info!(
            target: "jsbridge::engine",
            generation = state.generation,
            "guest runtime torn down"
        );
    }
}

/// Number of isolates alive in this process.
pub fn live_isolates() -> usize {
    PROCESS.lock().live_isolates
}

/// Whether process-wide engine state is currently initialized.
pub fn is_initialized() -> bool {
    live_isolates() > 0
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread affinity
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct StackEntry {
    pub(crate) isolate: IsolateId,
    pub(crate) context: ContextId,
    pub(crate) handle: Weak<ContextInner>,
}

thread_local! {
    static ENTERED: RefCell<Vec<StackEntry>> = const { RefCell::new(Vec::new()) };
}

/// Push a context on this thread's entered stack. Fails if a context of a
/// different isolate is already entered here.
pub(crate) fn push_entered(
    isolate: IsolateId,
    context: ContextId,
    handle: Weak<ContextInner>,
) -> Result<()> {
    ENTERED.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(top) = stack.last() {
            if top.isolate != isolate {
                return Err(Error::WrongIsolateThread {
                    entered: top.isolate.0,
                    requested: isolate.0,
                });
            }
        }
        stack.push(StackEntry {
            isolate,
            context,
            handle,
        });
        Ok(())
    })
}

/// Pop a context. It must be the innermost entry.
pub(crate) fn pop_entered(context: ContextId) -> Result<()> {
    ENTERED.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last() {
            Some(top) if top.context == context => {
                stack.pop();
                Ok(())
            }
            Some(top) => Err(Error::context_stack(format!(
                "cannot leave {context} while {} is the innermost entered context",
                top.context
            ))),
            None => Err(Error::context_stack(format!(
                "cannot leave {context}: no context is entered on this thread"
            ))),
        }
    })
}

/// Remove the innermost entry for `context` wherever it is. Used by drop
/// guards, which cannot report ordering errors.
pub(crate) fn remove_entered(context: ContextId) {
    ENTERED.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(index) = stack.iter().rposition(|entry| entry.context == context) {
            if index + 1 != stack.len() {
                warn!(
                    target: "jsbridge::context",
                    %context,
                    "context left out of order"
                );
            }
            stack.remove(index);
        }
    })
}

pub(crate) fn innermost_entered() -> Option<Weak<ContextInner>> {
    ENTERED.with(|stack| stack.borrow().last().map(|entry| entry.handle.clone()))
}

pub(crate) fn outermost_entered() -> Option<Weak<ContextInner>> {
    ENTERED.with(|stack| stack.borrow().first().map(|entry| entry.handle.clone()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Termination
// ─────────────────────────────────────────────────────────────────────────────

struct TerminationState {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Thread-safe handle for forcibly terminating guest execution.
///
/// Termination takes effect at the next interrupt poll of the running
/// guest code and surfaces as [`Error::Fatal`] from the outermost call.
#[derive(Clone)]
pub struct TerminationHandle(Arc<TerminationState>);

impl TerminationHandle {
    fn new() -> Self {
        Self(Arc::new(TerminationState {
            requested: AtomicBool::new(false),
            reason: Mutex::new(None),
        }))
    }

    pub fn terminate(&self) {
        self.terminate_with("terminated by host");
    }

    pub fn terminate_with(&self, reason: impl Into<String>) {
        let mut slot = self.0.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.0.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_terminating(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    /// Clear a pending termination and return its reason.
    fn take(&self) -> Option<String> {
        if !self.0.requested.swap(false, Ordering::SeqCst) {
            return None;
        }
        Some(
            self.0
                .reason
                .lock()
                .take()
                .unwrap_or_else(|| "terminated".to_string()),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heap budget
// ─────────────────────────────────────────────────────────────────────────────

/// Guest heap accounting for an isolate with a memory limit.
///
/// Once an allocation would cross the limit the budget is exhausted: the
/// isolate is flagged for termination and every further allocation is
/// refused until the outermost guest call returns. A guest `catch` block
/// therefore cannot make progress past the limit; the pending interrupt
/// unwinds it and the call reports [`Error::Fatal`].
pub(crate) struct HeapBudget {
    limit: usize,
    used: AtomicUsize,
    exhausted: AtomicBool,
}

impl HeapBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.exhausted.store(false, Ordering::Relaxed);
    }
}

/// Rust global allocator metered against a [`HeapBudget`]
struct MeteredAllocator {
    budget: Arc<HeapBudget>,
    termination: TerminationHandle,
}

impl MeteredAllocator {
    /// Whether growing the heap by `requested` bytes, after `released`
    /// bytes are given back, stays within the budget.
    fn admit(&self, released: usize, requested: usize) -> bool {
        if self.budget.is_exhausted() {
            return false;
        }
        let used = self.budget.used().saturating_sub(released);
        if used.saturating_add(requested) > self.budget.limit {
            self.budget.exhausted.store(true, Ordering::Relaxed);
            self.termination.terminate_with("out of memory");
            return false;
        }
        true
    }

    fn account(&self, ptr: *mut u8) -> *mut u8 {
        if !ptr.is_null() {
            // SAFETY: `ptr` was just returned by `RustAllocator`.
            let size = unsafe { RustAllocator::usable_size(ptr) };
            self.budget.used.fetch_add(size, Ordering::Relaxed);
        }
        ptr
    }
}

unsafe impl Allocator for MeteredAllocator {
    fn alloc(&mut self, size: usize) -> *mut u8 {
        if !self.admit(0, size) {
            return std::ptr::null_mut();
        }
        self.account(RustAllocator.alloc(size))
    }

    fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        match count.checked_mul(size) {
            Some(total) if self.admit(0, total) => self.account(RustAllocator.calloc(count, size)),
            _ => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        // SAFETY: QuickJS only frees pointers this allocator handed out.
        unsafe {
            self.budget
                .used
                .fetch_sub(RustAllocator::usable_size(ptr), Ordering::Relaxed);
            RustAllocator.dealloc(ptr);
        }
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        // SAFETY: `ptr` is a live allocation of this allocator.
        let old = unsafe { RustAllocator::usable_size(ptr) };
        if new_size > old && !self.admit(old, new_size) {
            return std::ptr::null_mut();
        }
        // SAFETY: as above; on failure the old block stays valid.
        let grown = unsafe { RustAllocator.realloc(ptr, new_size) };
        if !grown.is_null() {
            self.budget.used.fetch_sub(old, Ordering::Relaxed);
            self.account(grown);
        }
        grown
    }

    unsafe fn usable_size(ptr: *mut u8) -> usize {
        // SAFETY: forwarded contract.
        unsafe { RustAllocator::usable_size(ptr) }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interrupts
// ─────────────────────────────────────────────────────────────────────────────

/// State polled by the QuickJS interrupt handler while guest code runs
pub(crate) struct InterruptState {
    termination: TerminationHandle,
    deadline: Cell<Option<Instant>>,
    ticks: Cell<u64>,
    listener: RefCell<Option<Rc<dyn DebugListener>>>,
    in_listener: Cell<bool>,
    heap: Option<Arc<HeapBudget>>,
}

impl InterruptState {
    fn new(heap: Option<Arc<HeapBudget>>) -> Self {
        Self {
            termination: TerminationHandle::new(),
            deadline: Cell::new(None),
            ticks: Cell::new(0),
            listener: RefCell::new(None),
            in_listener: Cell::new(false),
            heap,
        }
    }

    /// Returns `true` to make QuickJS raise its uncatchable interrupt.
    fn poll(&self) -> bool {
        if self.termination.is_terminating() {
            return true;
        }
        if let Some(deadline) = self.deadline.get() {
            if Instant::now() >= deadline {
                self.termination
                    .terminate_with("execution timeout exceeded");
                return true;
            }
        }

        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            let ticks = self.ticks.get() + 1;
            self.ticks.set(ticks);
            if self.notify(&*listener, &DebugEvent::Step { ticks }) == DebugAction::Terminate {
                self.termination
                    .terminate_with("terminated by debug listener");
                return true;
            }
        }
        false
    }

    /// Poll from host-side loops that do not run guest bytecode and so
    /// never reach the interrupt handler.
    pub(crate) fn check(&self) -> Result<()> {
        if let Some(deadline) = self.deadline.get() {
            if Instant::now() >= deadline {
                self.termination
                    .terminate_with("execution timeout exceeded");
            }
        }
        if self.termination.is_terminating() {
            return Err(Error::fatal("execution terminated"));
        }
        Ok(())
    }

    /// Run a debug listener with bridge re-entry blocked.
    pub(crate) fn notify(&self, listener: &dyn DebugListener, event: &DebugEvent<'_>) -> DebugAction {
        self.in_listener.set(true);
        let action = listener.on_event(event);
        self.in_listener.set(false);
        action
    }

    pub(crate) fn in_listener(&self) -> bool {
        self.in_listener.get()
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.termination.is_terminating()
    }

    pub(crate) fn terminate_with(&self, reason: impl Into<String>) {
        self.termination.terminate_with(reason);
    }

    /// Swap the step listener, returning the previous one.
    pub(crate) fn swap_listener(
        &self,
        listener: Option<Rc<dyn DebugListener>>,
    ) -> Option<Rc<dyn DebugListener>> {
        self.listener.replace(listener)
    }

    /// Start an outermost guest call.
    fn begin(&self, timeout: Option<Duration>) {
        self.deadline.set(timeout.map(|t| Instant::now() + t));
        self.ticks.set(0);
    }

    /// Finish an outermost guest call; a pending termination is consumed
    /// and returned.
    fn finish(&self) -> Option<String> {
        self.deadline.set(None);
        let reason = self.termination.take();
        if let Some(heap) = &self.heap {
            heap.reset();
        }
        reason
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Isolate
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct IsolateInner {
    pub(crate) id: IsolateId,
    pub(crate) config: EngineConfig,
    pub(crate) interrupt: Rc<InterruptState>,
    contexts: RefCell<Vec<Weak<ContextInner>>>,
    /// Depth of `rquickjs::Context::with` on this runtime. QuickJS locks
    /// the runtime for the outermost call only.
    lock_depth: Cell<usize>,
    /// Contexts released while the runtime was locked; freed on unlock.
    retired: RefCell<Vec<rquickjs::Context>>,
    disposed: Cell<bool>,
    pub(crate) runtime: Runtime,
}

impl IsolateInner {
    fn new(config: EngineConfig) -> Result<Self> {
        let heap = config.memory_limit.map(|limit| Arc::new(HeapBudget::new(limit)));
        let interrupt = Rc::new(InterruptState::new(heap.clone()));

        let runtime = match heap {
            Some(budget) => Runtime::new_with_alloc(MeteredAllocator {
                budget,
                termination: interrupt.termination.clone(),
            }),
            None => Runtime::new(),
        }
        .map_err(|e| Error::fatal(format!("failed to create runtime: {e}")))?;

        if let Some(limit) = config.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let poller = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || poller.poll())));

        let id = acquire_process();
        debug!(target: "jsbridge::engine", isolate = %id, "isolate created");

        Ok(Self {
            id,
            config,
            interrupt,
            contexts: RefCell::new(Vec::new()),
            lock_depth: Cell::new(0),
            retired: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
            runtime,
        })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock_depth.get() > 0
    }

    pub(crate) fn register_context(&self, context: Weak<ContextInner>) {
        let mut contexts = self.contexts.borrow_mut();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.push(context);
    }

    fn live_contexts(&self) -> Vec<Rc<ContextInner>> {
        self.contexts
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Free a QuickJS context, or park it until the runtime is unlocked.
    pub(crate) fn retire(&self, raw: rquickjs::Context) {
        if self.is_locked() {
            self.retired.borrow_mut().push(raw);
        } else {
            drop(raw);
        }
    }

    /// Mark the start of an outermost `with`. The returned guard ends it.
    pub(crate) fn lock(self: &Rc<Self>) -> RuntimeLock {
        self.lock_depth.set(self.lock_depth.get() + 1);
        if self.lock_depth.get() == 1 {
            self.interrupt.begin(self.config.execution_timeout());
        }
        RuntimeLock {
            isolate: self.clone(),
        }
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        debug!(target: "jsbridge::engine", isolate = %self.id, "isolate dropped");
        release_process();
    }
}

/// Guard for an outermost runtime lock
pub(crate) struct RuntimeLock {
    isolate: Rc<IsolateInner>,
}

impl RuntimeLock {
    /// Release the lock. A termination requested during the call is
    /// returned so the caller can report it as fatal.
    pub(crate) fn finish(self) -> Option<String> {
        if self.isolate.lock_depth.get() == 1 {
            self.isolate.interrupt.finish()
        } else {
            None
        }
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        let depth = self.isolate.lock_depth.get();
        self.isolate.lock_depth.set(depth.saturating_sub(1));
        if depth == 1 {
            self.isolate.interrupt.finish();
            let retired = std::mem::take(&mut *self.isolate.retired.borrow_mut());
            drop(retired);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Heap statistics for one isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub malloc_size: i64,
    pub malloc_limit: i64,
    pub memory_used_size: i64,
    pub object_count: i64,
    pub string_count: i64,
    pub function_count: i64,
    pub array_count: i64,
}

/// One guest engine isolate
pub struct Engine {
    inner: Rc<IsolateInner>,
}

impl Engine {
    /// Create an isolate with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            inner: Rc::new(IsolateInner::new(config)?),
        })
    }

    pub fn id(&self) -> IsolateId {
        self.inner.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &Rc<IsolateInner> {
        &self.inner
    }

    /// Handle that can terminate running guest code from any thread.
    pub fn termination_handle(&self) -> TerminationHandle {
        self.inner.interrupt.termination.clone()
    }

    /// Number of live contexts on this isolate.
    pub fn context_count(&self) -> usize {
        self.inner.live_contexts().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Run a full garbage collection cycle.
    pub fn collect_garbage(&self) -> Result<()> {
        if self.inner.is_locked() {
            return Err(Error::context_stack(
                "cannot collect garbage while guest code is running",
            ));
        }
        self.inner.runtime.run_gc();
        Ok(())
    }

    pub fn memory_usage(&self) -> Result<MemoryStats> {
        if self.inner.is_locked() {
            return Err(Error::context_stack(
                "memory usage is unavailable while guest code is running",
            ));
        }
        let usage = self.inner.runtime.memory_usage();
        let malloc_limit = match self.inner.config.memory_limit {
            Some(limit) => i64::try_from(limit).unwrap_or(i64::MAX),
            None => usage.malloc_limit,
        };
        Ok(MemoryStats {
            malloc_size: usage.malloc_size,
            malloc_limit,
            memory_used_size: usage.memory_used_size,
            object_count: usage.obj_count,
            string_count: usage.str_count,
            function_count: usage.js_func_count + usage.c_func_count,
            array_count: usage.array_count,
        })
    }

    /// Dispose every context on this isolate.
    ///
    /// Refused with [`Error::DisposeRefused`] while any context is entered
    /// or still has live guest object wrappers; nothing is disposed in that
    /// case. The runtime itself is freed once the last `Context` handle and
    /// this `Engine` are dropped.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.is_disposed() {
            return Ok(());
        }

        let contexts = self.inner.live_contexts();
        for context in &contexts {
            if context.is_entered() {
                warn!(target: "jsbridge::engine", isolate = %self.inner.id, context = %context.id, "dispose refused: context entered");
                return Err(Error::DisposeRefused {
                    reason: format!("{} is entered", context.id),
                });
            }
            let wrappers = context.live_wrappers();
            if wrappers > 0 {
                warn!(target: "jsbridge::engine", isolate = %self.inner.id, context = %context.id, wrappers, "dispose refused: live wrappers");
                return Err(Error::DisposeRefused {
                    reason: format!("{} has {wrappers} live wrappers", context.id),
                });
            }
        }

        for context in contexts {
            context.dispose_inner()?;
        }
        self.inner.disposed.set(true);
        info!(target: "jsbridge::engine", isolate = %self.inner.id, "isolate disposed");
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}
