//! Context Manager
//!
//! A [`Context`] is one guest global scope on an [`Engine`]. Contexts nest
//! on a per-thread stack: every bridge operation enters its context for its
//! duration, and callers may also enter explicitly with [`Context::enter`]
//! or [`Context::scope`]. Leaving is strictly LIFO.
//!
//! Everything the context hands out (guest object proxies, exposure slots,
//! host errors thrown into the guest) is tracked in its [`BridgeState`] and
//! released together on dispose.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use rquickjs::context::EvalOptions;
use rquickjs::{Ctx, Object, Persistent, Value as JsValue};
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::arena::{Arena, ArenaKey, Released};
use crate::convert::Converter;
use crate::debug::{DebugEvent, DebugHook, DebugListener};
use crate::engine::{self, ContextId, Engine, IsolateId, IsolateInner};
use crate::error::{Error, Result};
use crate::exception;
use crate::value::{HostObject, Value};
use crate::wrapper::{self, Helpers, JsObject, JsObjectInner};

/// Origin used when none is given.
pub const DEFAULT_ORIGIN: &str = "<eval>";

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Uninitialized,
    Created,
    Entered,
    Left,
    Disposed,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge state
// ─────────────────────────────────────────────────────────────────────────────

/// Per-context registry of everything that crossed the boundary
pub(crate) struct BridgeState {
    /// Pinned guest values held by the host
    pub(crate) arena: Arena<Persistent<JsValue<'static>>>,
    /// Live `JsObject` proxies by arena key
    pub(crate) wrappers: HashMap<ArenaKey, Weak<JsObjectInner>>,
    /// Host value identity -> slot of its current guest object
    pub(crate) exposed: HashMap<usize, u32>,
    /// Exposed host values, addressed by slot from the guest. The guest
    /// holds its objects weakly and releases the slot once they are
    /// collected.
    pub(crate) slots: HashMap<u32, Exposure>,
    next_slot: u32,
    /// Host errors thrown into the guest, by tag; released with the guest
    /// error object.
    pub(crate) host_errors: HashMap<u32, Error>,
    next_error_tag: u32,
    helpers: Persistent<Object<'static>>,
}

/// A host value exposed to the guest
pub(crate) struct Exposure {
    pub(crate) identity: usize,
    pub(crate) value: Value,
}

impl BridgeState {
    fn new(helpers: Persistent<Object<'static>>) -> Self {
        Self {
            arena: Arena::new(),
            wrappers: HashMap::new(),
            exposed: HashMap::new(),
            slots: HashMap::new(),
            next_slot: 1,
            host_errors: HashMap::new(),
            next_error_tag: 1,
            helpers,
        }
    }

    pub(crate) fn add_exposure(&mut self, identity: usize, value: Value) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(slot, Exposure { identity, value });
        self.exposed.insert(identity, slot);
        slot
    }

    /// Forget a slot whose guest object was collected. The value is handed
    /// back so it can be dropped outside the bridge borrow.
    pub(crate) fn release_exposure(&mut self, slot: u32) -> Option<Value> {
        let exposure = self.slots.remove(&slot)?;
        if self.exposed.get(&exposure.identity) == Some(&slot) {
            self.exposed.remove(&exposure.identity);
        }
        Some(exposure.value)
    }

    pub(crate) fn add_host_error(&mut self, err: Error) -> u32 {
        let tag = self.next_error_tag;
        self.next_error_tag += 1;
        self.host_errors.insert(tag, err);
        tag
    }

    fn release(&mut self, key: ArenaKey) -> Option<Persistent<JsValue<'static>>> {
        match self.arena.release(key) {
            Released::Freed(handle) => {
                self.wrappers.remove(&key);
                Some(handle)
            }
            Released::Retained | Released::Unknown => None,
        }
    }

    fn live_wrappers(&self) -> usize {
        self.wrappers
            .values()
            .filter(|wrapper| wrapper.strong_count() > 0)
            .count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context internals
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct ContextInner {
    pub(crate) id: ContextId,
    pub(crate) debug: DebugHook,
    state: Cell<ContextState>,
    /// Entries of this context on the thread's entered stack
    depth: Cell<usize>,
    /// How many of those came from `Context::enter`
    explicit: Cell<usize>,
    security_token: RefCell<Option<String>>,
    bridge: RefCell<Option<BridgeState>>,
    /// Releases requested while the bridge state was borrowed
    pending_release: RefCell<Vec<ArenaKey>>,
    raw: RefCell<Option<rquickjs::Context>>,
    pub(crate) isolate: Rc<IsolateInner>,
}

impl ContextInner {
    fn create(engine: &Engine, global: Option<HostObject>) -> Result<Rc<Self>> {
        let isolate = engine.inner().clone();
        if isolate.is_disposed() {
            return Err(Error::InvalidatedHandle);
        }
        if isolate.is_locked() {
            return Err(Error::context_stack(
                "contexts cannot be created while guest code runs on this isolate",
            ));
        }

        let raw = rquickjs::Context::full(&isolate.runtime)
            .map_err(|e| Error::fatal(format!("failed to create context: {e}")))?;
        let inner = Rc::new(Self {
            id: engine::next_context_id(),
            debug: DebugHook::default(),
            state: Cell::new(ContextState::Uninitialized),
            depth: Cell::new(0),
            explicit: Cell::new(0),
            security_token: RefCell::new(None),
            bridge: RefCell::new(None),
            pending_release: RefCell::new(Vec::new()),
            raw: RefCell::new(Some(raw.clone())),
            isolate: isolate.clone(),
        });
        isolate.register_context(Rc::downgrade(&inner));

        let lock = isolate.lock();
        let weak = Rc::downgrade(&inner);
        let helpers = raw.with(|ctx| wrapper::install(&ctx, weak));
        drop(lock);
        drop(raw);
        let helpers = helpers
            .map_err(|e| Error::fatal(format!("failed to install bridge helpers: {e}")))?;
        *inner.bridge.borrow_mut() = Some(BridgeState::new(helpers));
        inner.state.set(ContextState::Created);

        if let Some(global) = global {
            inner.with_ctx(|ctx| {
                let proxy = Converter::new(ctx, &inner).to_guest(&Value::Object(global))?;
                inner
                    .helpers(ctx)?
                    .call::<_, ()>(ctx, &inner, "setGlobalPrototype", (proxy,))
            })?;
        }

        info!(target: "jsbridge::context", context = %inner.id, isolate = %isolate.id, "context created");
        Ok(inner)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.get() == ContextState::Disposed
    }

    pub(crate) fn is_entered(&self) -> bool {
        self.depth.get() > 0
    }

    pub(crate) fn security_token(&self) -> Option<String> {
        self.security_token.borrow().clone()
    }

    /// Push this context on the thread's entered stack until the guard
    /// drops.
    pub(crate) fn enter_scope(self: &Rc<Self>) -> Result<EnterGuard> {
        if self.is_disposed() {
            return Err(Error::InvalidatedHandle);
        }
        if self.isolate.interrupt.in_listener() {
            return Err(Error::DebugReentry);
        }
        engine::push_entered(self.isolate.id, self.id, Rc::downgrade(self))?;
        self.mark_entered();
        Ok(EnterGuard {
            context: self.clone(),
        })
    }

    fn mark_entered(&self) {
        self.depth.set(self.depth.get() + 1);
        self.state.set(ContextState::Entered);
        trace!(target: "jsbridge::context", context = %self.id, depth = self.depth.get(), "entered");
    }

    fn mark_left(&self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 && !self.is_disposed() {
            self.state.set(ContextState::Left);
        }
        trace!(target: "jsbridge::context", context = %self.id, depth, "left");
    }

    /// Run `f` with this context entered and a handle scope open.
    ///
    /// The outermost call on the isolate takes the runtime lock, runs any
    /// pending guest jobs after `f` succeeds, and reports a termination
    /// requested meanwhile as [`Error::Fatal`].
    pub(crate) fn with_ctx<R>(
        self: &Rc<Self>,
        f: impl for<'js> FnOnce(&Ctx<'js>) -> Result<R>,
    ) -> Result<R> {
        let _entered = self.enter_scope()?;
        let raw = self
            .raw
            .borrow()
            .clone()
            .ok_or(Error::InvalidatedHandle)?;

        if self.isolate.is_locked() {
            if self.isolate.interrupt.is_terminating() {
                return Err(Error::fatal("execution is terminating"));
            }
            // SAFETY: an outer `rquickjs::Context::with` on this runtime is
            // active further up this thread's stack, so the runtime lock is
            // held for the whole call. `from_raw` takes its own reference to
            // the context.
            let ctx = unsafe { Ctx::from_raw(raw.as_raw()) };
            return f(&ctx);
        }

        let lock = self.isolate.lock();
        let interrupt = &self.isolate.interrupt;
        let previous = interrupt.swap_listener(self.debug.listener());
        let result = raw.with(|ctx| {
            let result = f(&ctx)?;
            while !interrupt.is_terminating() && ctx.execute_pending_job() {}
            Ok(result)
        });
        interrupt.swap_listener(previous);
        let terminated = lock.finish();
        drop(raw);
        self.flush_pending();

        match terminated {
            Some(reason) => {
                debug!(target: "jsbridge::context", context = %self.id, reason = %reason, "call terminated");
                Err(Error::fatal(reason))
            }
            None => result,
        }
    }

    /// Borrow the bridge state. Fails once disposed.
    pub(crate) fn bridge<R>(&self, f: impl FnOnce(&mut BridgeState) -> R) -> Result<R> {
        let mut bridge = self
            .bridge
            .try_borrow_mut()
            .map_err(|_| Error::context_stack("bridge state is already borrowed"))?;
        match bridge.as_mut() {
            Some(bridge) => Ok(f(bridge)),
            None => Err(Error::InvalidatedHandle),
        }
    }

    pub(crate) fn helpers<'js>(&self, ctx: &Ctx<'js>) -> Result<Helpers<'js>> {
        let handle = self.bridge(|bridge| bridge.helpers.clone())?;
        let object = handle
            .restore(ctx)
            .map_err(|e| Error::conversion("context", e.to_string()))?;
        Ok(Helpers::new(object))
    }

    /// Drop one arena reference. Deferred if the bridge state is busy.
    pub(crate) fn release_key(&self, key: ArenaKey) {
        let freed = match self.bridge.try_borrow_mut() {
            Ok(mut bridge) => match bridge.as_mut() {
                Some(bridge) => bridge.release(key),
                None => None,
            },
            Err(_) => {
                self.pending_release.borrow_mut().push(key);
                None
            }
        };
        drop(freed);
    }

    fn flush_pending(&self) {
        let pending = std::mem::take(&mut *self.pending_release.borrow_mut());
        for key in pending {
            self.release_key(key);
        }
    }

    pub(crate) fn live_wrappers(&self) -> usize {
        self.bridge
            .try_borrow()
            .ok()
            .and_then(|bridge| bridge.as_ref().map(BridgeState::live_wrappers))
            .unwrap_or(0)
    }

    fn handle_count(&self) -> usize {
        self.peek(|bridge| bridge.arena.len())
    }

    fn peek(&self, f: impl FnOnce(&BridgeState) -> usize) -> usize {
        self.bridge
            .try_borrow()
            .ok()
            .and_then(|bridge| bridge.as_ref().map(f))
            .unwrap_or(0)
    }

    /// Release everything this context holds. Refused while entered.
    pub(crate) fn dispose_inner(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        if self.is_entered() {
            return Err(Error::DisposeRefused {
                reason: format!("{} is entered", self.id),
            });
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&self) {
        self.state.set(ContextState::Disposed);
        self.pending_release.borrow_mut().clear();
        let bridge = match self.bridge.try_borrow_mut() {
            Ok(mut bridge) => bridge.take(),
            Err(_) => None,
        };
        let raw = self.raw.borrow_mut().take();

        let handles = bridge.as_ref().map_or(0, |bridge| bridge.arena.len());
        drop(bridge);
        if let Some(raw) = raw {
            self.isolate.retire(raw);
        }
        info!(target: "jsbridge::context", context = %self.id, handles, "context disposed");
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for _ in 0..self.depth.get() {
            engine::remove_entered(self.id);
        }
        self.depth.set(0);
        if !self.is_disposed() {
            self.teardown();
        }
    }
}

/// Keeps a context on the thread's entered stack
pub(crate) struct EnterGuard {
    context: Rc<ContextInner>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        engine::remove_entered(self.context.id);
        self.context.mark_left();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// One guest global scope.
///
/// Clones share the same context. The context is disposed when
/// [`Context::dispose`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    pub fn new(engine: &Engine) -> Result<Self> {
        ContextInner::create(engine, None).map(Self::from_inner)
    }

    /// Create a context whose global object falls back to `global` for
    /// names it does not define itself.
    pub fn with_global(engine: &Engine, global: HostObject) -> Result<Self> {
        ContextInner::create(engine, Some(global)).map(Self::from_inner)
    }

    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.inner.isolate.id
    }

    pub fn state(&self) -> ContextState {
        self.inner.state.get()
    }

    pub fn is_entered(&self) -> bool {
        self.inner.is_entered()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Enter explicitly. Must be balanced by [`Context::leave`].
    pub fn enter(&self) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::context_stack(format!(
                "cannot enter disposed {}",
                self.inner.id
            )));
        }
        if self.inner.isolate.interrupt.in_listener() {
            return Err(Error::DebugReentry);
        }
        engine::push_entered(self.inner.isolate.id, self.inner.id, Rc::downgrade(&self.inner))?;
        self.inner.explicit.set(self.inner.explicit.get() + 1);
        self.inner.mark_entered();
        debug!(target: "jsbridge::context", context = %self.inner.id, "enter");
        Ok(())
    }

    /// Leave an explicit entry. Fails unless this context is the innermost
    /// entered context on this thread.
    pub fn leave(&self) -> Result<()> {
        if self.inner.explicit.get() == 0 {
            return Err(Error::context_stack(format!(
                "{} was not entered with enter()",
                self.inner.id
            )));
        }
        engine::pop_entered(self.inner.id)?;
        self.inner.explicit.set(self.inner.explicit.get() - 1);
        self.inner.mark_left();
        debug!(target: "jsbridge::context", context = %self.inner.id, "leave");
        Ok(())
    }

    /// Enter until the returned guard is dropped.
    pub fn scope(&self) -> Result<ContextScope> {
        let guard = self.inner.enter_scope()?;
        Ok(ContextScope {
            _guard: guard,
            context: self.clone(),
        })
    }

    pub fn evaluate(&self, source: &str) -> Result<Value> {
        self.evaluate_with_origin(source, DEFAULT_ORIGIN)
    }

    /// Compile and run non-strict global code, returning its completion
    /// value.
    pub fn evaluate_with_origin(&self, source: &str, origin: &str) -> Result<Value> {
        let inner = &self.inner;
        inner.with_ctx(|ctx| {
            check_syntax(ctx, inner, source, origin)?;
            run(ctx, inner, source, origin)
        })
    }

    /// Check `source` for syntax errors without running it.
    pub fn compile(&self, source: &str, origin: &str) -> Result<Script> {
        let inner = &self.inner;
        inner.with_ctx(|ctx| check_syntax(ctx, inner, source, origin))?;
        Ok(Script {
            source: Rc::from(source),
            origin: Rc::from(origin),
        })
    }

    /// Set a global variable.
    pub fn expose_global(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let inner = &self.inner;
        inner.with_ctx(|ctx| {
            let value = Converter::new(ctx, inner).to_guest(&value)?;
            ctx.globals()
                .set(name, value)
                .map_err(|e| exception::capture(ctx, inner, e))
        })
    }

    /// Proxy onto the guest global object.
    pub fn global(&self) -> Result<JsObject> {
        let inner = &self.inner;
        inner.with_ctx(|ctx| JsObject::from_guest(ctx, inner, ctx.globals().into_value()))
    }

    pub fn security_token(&self) -> Option<String> {
        self.inner.security_token()
    }

    /// Contexts on the same isolate sharing a non-empty token may pass
    /// guest objects to each other.
    pub fn set_security_token(&self, token: Option<&str>) {
        *self.inner.security_token.borrow_mut() = token.map(str::to_string);
    }

    pub fn set_debug_listener(&self, listener: Option<Rc<dyn DebugListener>>) {
        if self.inner.is_entered() && self.inner.isolate.is_locked() {
            self.inner.isolate.interrupt.swap_listener(listener.clone());
        }
        self.inner.debug.set_listener(listener);
    }

    pub fn has_debug_listener(&self) -> bool {
        self.inner.debug.is_attached()
    }

    /// Fire `Break` whenever a script with this origin is about to run.
    pub fn add_breakpoint(&self, origin: &str) -> bool {
        self.inner.debug.add_breakpoint(origin)
    }

    pub fn remove_breakpoint(&self, origin: &str) -> bool {
        self.inner.debug.remove_breakpoint(origin)
    }

    /// Breakpoint origins, sorted.
    pub fn breakpoints(&self) -> Vec<String> {
        self.inner.debug.breakpoints()
    }

    pub fn collect_garbage(&self) -> Result<()> {
        self.inner.with_ctx(|ctx| {
            ctx.run_gc();
            Ok(())
        })
    }

    /// Number of guest values currently pinned by the host.
    pub fn handle_count(&self) -> usize {
        self.inner.handle_count()
    }

    /// Number of live [`JsObject`] proxies from this context.
    pub fn wrapper_count(&self) -> usize {
        self.inner.live_wrappers()
    }

    /// Number of host values with a live guest object. Slots are released
    /// once the guest collects the object.
    pub fn exposure_count(&self) -> usize {
        self.inner.peek(|bridge| bridge.slots.len())
    }

    /// Number of host errors still reachable from guest error objects.
    pub fn host_error_count(&self) -> usize {
        self.inner.peek(|bridge| bridge.host_errors.len())
    }

    /// Dispose now. Every proxy from this context fails with
    /// [`Error::InvalidatedHandle`] afterwards.
    pub fn dispose(&self) -> Result<()> {
        self.inner.dispose_inner()
    }

    /// The outermost context entered on this thread.
    pub fn entered() -> Option<Context> {
        engine::outermost_entered()
            .and_then(|weak| weak.upgrade())
            .map(Self::from_inner)
    }

    /// The innermost context entered on this thread.
    pub fn current() -> Option<Context> {
        engine::innermost_entered()
            .and_then(|weak| weak.upgrade())
            .map(Self::from_inner)
    }

    pub fn in_context() -> bool {
        engine::innermost_entered().is_some()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn run_script(&self, script: &Script) -> Result<Value> {
        let inner = &self.inner;
        inner.with_ctx(|ctx| run(ctx, inner, &script.source, &script.origin))
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("isolate", &self.inner.isolate.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

fn check_syntax(ctx: &Ctx<'_>, inner: &Rc<ContextInner>, source: &str, origin: &str) -> Result<()> {
    let interrupt = &inner.isolate.interrupt;
    inner
        .debug
        .fire(interrupt, &DebugEvent::BeforeCompile { origin, source })?;
    let message: Option<String> = inner
        .helpers(ctx)?
        .call(ctx, inner, "checkSyntax", (source,))?;
    if let Some(message) = message {
        debug!(target: "jsbridge::context", origin, message = %message, "compile error");
        return Err(Error::Compile {
            origin: origin.to_string(),
            message,
        });
    }
    inner.debug.fire(interrupt, &DebugEvent::AfterCompile { origin })
}

fn run(ctx: &Ctx<'_>, inner: &Rc<ContextInner>, source: &str, origin: &str) -> Result<Value> {
    inner.debug.before_run(&inner.isolate.interrupt, origin)?;
    debug!(target: "jsbridge::context", context = %inner.id, origin, "run");

    let mut options = EvalOptions::default();
    options.strict = false;
    let value: JsValue = ctx
        .eval_with_options(source, options)
        .map_err(|e| exception::capture(ctx, inner, e))?;
    Converter::new(ctx, inner).to_host(value)
}

/// Guard returned by [`Context::scope`]
pub struct ContextScope {
    _guard: EnterGuard,
    context: Context,
}

impl ContextScope {
    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Checked source, runnable on any context of the same engine
#[derive(Debug, Clone)]
pub struct Script {
    source: Rc<str>,
    origin: Rc<str>,
}

impl Script {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn run(&self, context: &Context) -> Result<Value> {
        context.run_script(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;

    fn setup() -> (Engine, Context) {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        (engine, context)
    }

    #[test]
    fn test_state_machine() {
        let (_engine, context) = setup();
        assert_eq!(context.state(), ContextState::Created);
        context.enter().unwrap();
        assert_eq!(context.state(), ContextState::Entered);
        context.enter().unwrap();
        context.leave().unwrap();
        assert_eq!(context.state(), ContextState::Entered);
        context.leave().unwrap();
        assert_eq!(context.state(), ContextState::Left);
        context.evaluate("1").unwrap();
        assert_eq!(context.state(), ContextState::Left);
        context.dispose().unwrap();
        assert_eq!(context.state(), ContextState::Disposed);
    }

    #[test]
    fn test_leave_must_be_lifo() {
        let engine = Engine::new().unwrap();
        let a = Context::new(&engine).unwrap();
        let b = Context::new(&engine).unwrap();

        a.enter().unwrap();
        b.enter().unwrap();
        assert!(matches!(a.leave(), Err(Error::ContextStack { .. })));
        b.leave().unwrap();
        a.leave().unwrap();
        assert!(matches!(a.leave(), Err(Error::ContextStack { .. })));
    }

    #[test]
    fn test_entered_and_current() {
        let engine = Engine::new().unwrap();
        let a = Context::new(&engine).unwrap();
        let b = Context::new(&engine).unwrap();
        assert!(!Context::in_context());

        a.enter().unwrap();
        {
            let scope = b.scope().unwrap();
            assert_eq!(Context::entered().unwrap(), a);
            assert_eq!(Context::current().unwrap(), b);
            assert_eq!(scope.context(), &b);
        }
        assert_eq!(Context::current().unwrap(), a);
        a.leave().unwrap();
        assert!(!Context::in_context());
        assert!(Context::current().is_none());
    }

    #[test]
    fn test_scope_leaves_on_error_path() {
        let (_engine, context) = setup();
        let result: Result<()> = (|| {
            let _scope = context.scope()?;
            context.evaluate("throw 1")?;
            Ok(())
        })();
        assert!(result.is_err());
        assert!(!context.is_entered());
        assert_eq!(context.state(), ContextState::Left);
    }

    #[test]
    fn test_compile_error() {
        let (_engine, context) = setup();
        let err = context.compile("let = ;", "bad.js").unwrap_err();
        match err {
            Error::Compile { origin, .. } => assert_eq!(origin, "bad.js"),
            other => panic!("unexpected error: {other:?}"),
        }
        // nothing ran
        let err = context.evaluate("globalThis.ran = true; let = ;").unwrap_err();
        assert!(matches!(err, Error::Compile { .. }));
        assert_eq!(context.evaluate("typeof ran").unwrap(), Value::from("undefined"));
    }

    #[test]
    fn test_script_runs_repeatedly() {
        let (_engine, context) = setup();
        let script = context.compile("var n = (globalThis.n || 0) + 1; n", "counter.js").unwrap();
        assert_eq!(script.origin(), "counter.js");
        assert_eq!(script.run(&context).unwrap(), Value::Int(1));
        assert_eq!(script.run(&context).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_globals_persist_between_evaluations() {
        let (_engine, context) = setup();
        context.evaluate("var greeting = 'hi'; function twice(x) { return x * 2; }").unwrap();
        assert_eq!(context.evaluate("greeting").unwrap(), Value::from("hi"));
        assert_eq!(context.evaluate("twice(21)").unwrap(), Value::Int(42));

        let global = context.global().unwrap();
        assert_eq!(global.get("greeting").unwrap(), Value::from("hi"));
        global.set("answer", 42).unwrap();
        assert_eq!(context.evaluate("answer").unwrap(), Value::Int(42));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let engine = Engine::new().unwrap();
        let a = Context::new(&engine).unwrap();
        let b = Context::new(&engine).unwrap();
        a.evaluate("var only = 1").unwrap();
        assert_eq!(b.evaluate("typeof only").unwrap(), Value::from("undefined"));
    }

    #[test]
    fn test_with_global_falls_back_to_host() {
        let engine = Engine::new().unwrap();
        let host = HostObject::new(Record::new("Window").with("title", "main"));
        let context = Context::with_global(&engine, host).unwrap();
        assert_eq!(context.evaluate("title").unwrap(), Value::from("main"));
        context.evaluate("var local = 1").unwrap();
        assert_eq!(context.evaluate("local + 1").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_dispose_invalidates_proxies() {
        let (_engine, context) = setup();
        let function = context.evaluate("(function () { return 1; })").unwrap();
        let function = function.as_js().unwrap().clone();
        assert_eq!(context.wrapper_count(), 1);

        context.dispose().unwrap();
        assert!(matches!(function.call(&[]), Err(Error::InvalidatedHandle)));
        assert!(matches!(function.get("name"), Err(Error::InvalidatedHandle)));
        assert!(matches!(context.evaluate("1"), Err(Error::InvalidatedHandle)));
        assert!(matches!(context.enter(), Err(Error::ContextStack { .. })));
        assert!(!function.is_alive());
    }

    #[test]
    fn test_dispose_refused_while_entered() {
        let (_engine, context) = setup();
        context.enter().unwrap();
        assert!(matches!(context.dispose(), Err(Error::DisposeRefused { .. })));
        context.leave().unwrap();
        context.dispose().unwrap();
    }

    #[test]
    fn test_drop_disposes() {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        let function = context.evaluate("(() => 1)").unwrap();
        let function = function.as_js().unwrap().clone();
        assert_eq!(engine.context_count(), 1);
        drop(context);
        assert_eq!(engine.context_count(), 0);
        assert!(matches!(function.call(&[]), Err(Error::InvalidatedHandle)));
    }

    #[test]
    fn test_handles_released_with_proxies() {
        let (_engine, context) = setup();
        let before = context.handle_count();
        let object = context.evaluate("(function () {})").unwrap();
        assert_eq!(context.handle_count(), before + 1);
        drop(object);
        assert_eq!(context.handle_count(), before);
        context.collect_garbage().unwrap();
    }

    #[test]
    fn test_promise_jobs_run_before_return() {
        let (_engine, context) = setup();
        context
            .evaluate("var settled = false; Promise.resolve().then(() => { settled = true; })")
            .unwrap();
        assert_eq!(context.evaluate("settled").unwrap(), Value::Bool(true));
    }
}
