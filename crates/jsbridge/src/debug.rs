//! Debug Hook
//!
//! Optional per-context observer for guest execution. The listener sees
//! compile, break, step and exception events and may ask for the running
//! guest code to be terminated. While a listener runs, the bridge refuses
//! re-entry into guest code on that isolate.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::debug;

use crate::engine::InterruptState;
use crate::error::{Error, GuestException, Result};

/// An event delivered to a [`DebugListener`]
#[derive(Debug)]
pub enum DebugEvent<'a> {
    /// Source is about to be compiled.
    BeforeCompile { origin: &'a str, source: &'a str },
    /// Source compiled successfully.
    AfterCompile { origin: &'a str },
    /// A script whose origin carries a breakpoint is about to run.
    Break { origin: &'a str },
    /// Periodic tick while guest code runs.
    Step { ticks: u64 },
    /// A guest exception reached the host.
    Exception { exception: &'a GuestException },
}

impl DebugEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            DebugEvent::BeforeCompile { .. } => "before-compile",
            DebugEvent::AfterCompile { .. } => "after-compile",
            DebugEvent::Break { .. } => "break",
            DebugEvent::Step { .. } => "step",
            DebugEvent::Exception { .. } => "exception",
        }
    }
}

/// What the engine should do after a listener returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugAction {
    #[default]
    Continue,
    Terminate,
}

/// Receiver of debug events.
///
/// Listeners run synchronously on the thread executing guest code and
/// must not call back into the bridge; doing so fails with
/// [`Error::DebugReentry`].
pub trait DebugListener {
    fn on_event(&self, event: &DebugEvent<'_>) -> DebugAction;
}

impl<F> DebugListener for F
where
    F: Fn(&DebugEvent<'_>) -> DebugAction,
{
    fn on_event(&self, event: &DebugEvent<'_>) -> DebugAction {
        self(event)
    }
}

/// Listener and breakpoint state for one context
#[derive(Default)]
pub(crate) struct DebugHook {
    listener: RefCell<Option<Rc<dyn DebugListener>>>,
    breakpoints: RefCell<BTreeSet<String>>,
}

impl DebugHook {
    pub(crate) fn set_listener(
        &self,
        listener: Option<Rc<dyn DebugListener>>,
    ) -> Option<Rc<dyn DebugListener>> {
        self.listener.replace(listener)
    }

    pub(crate) fn listener(&self) -> Option<Rc<dyn DebugListener>> {
        self.listener.borrow().clone()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.listener.borrow().is_some()
    }

    pub(crate) fn add_breakpoint(&self, origin: impl Into<String>) -> bool {
        self.breakpoints.borrow_mut().insert(origin.into())
    }

    pub(crate) fn remove_breakpoint(&self, origin: &str) -> bool {
        self.breakpoints.borrow_mut().remove(origin)
    }

    pub(crate) fn breakpoints(&self) -> Vec<String> {
        self.breakpoints.borrow().iter().cloned().collect()
    }

    /// Deliver an event. A `Terminate` answer becomes a fatal error for
    /// the caller; nothing is flagged on the isolate because no guest code
    /// is running yet at these points.
    pub(crate) fn fire(&self, interrupt: &InterruptState, event: &DebugEvent<'_>) -> Result<()> {
        let Some(listener) = self.listener() else {
            return Ok(());
        };
        debug!(target: "jsbridge::context", event = event.name(), "debug event");
        match interrupt.notify(&*listener, event) {
            DebugAction::Continue => Ok(()),
            DebugAction::Terminate => Err(Error::fatal(format!(
                "terminated by debug listener on {}",
                event.name()
            ))),
        }
    }

    /// Deliver an event whose outcome cannot stop anything, such as an
    /// exception that is already propagating.
    pub(crate) fn notify(&self, interrupt: &InterruptState, event: &DebugEvent<'_>) {
        if let Some(listener) = self.listener() {
            if interrupt.notify(&*listener, event) == DebugAction::Terminate {
                interrupt.terminate_with("terminated by debug listener");
            }
        }
    }

    /// Fire `Break` if `origin` carries a breakpoint.
    pub(crate) fn before_run(&self, interrupt: &InterruptState, origin: &str) -> Result<()> {
        if !self.breakpoints.borrow().contains(origin) {
            return Ok(());
        }
        self.fire(interrupt, &DebugEvent::Break { origin })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::context::Context;
    use crate::engine::Engine;
    use crate::value::Value;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, Rc<dyn DebugListener>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let listener: Rc<dyn DebugListener> = Rc::new(move |event: &DebugEvent<'_>| {
            if !matches!(event, DebugEvent::Step { .. }) {
                sink.borrow_mut().push(event.name().to_string());
            }
            DebugAction::Continue
        });
        (events, listener)
    }

    #[test]
    fn test_breakpoints() {
        let hook = DebugHook::default();
        assert!(hook.add_breakpoint("a.js"));
        assert!(!hook.add_breakpoint("a.js"));
        hook.add_breakpoint("b.js");
        assert_eq!(hook.breakpoints(), vec!["a.js", "b.js"]);
        assert!(hook.remove_breakpoint("a.js"));
        assert!(!hook.remove_breakpoint("a.js"));
    }

    #[test]
    fn test_compile_and_break_events() {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        let (events, listener) = recorder();
        context.set_debug_listener(Some(listener));
        context.add_breakpoint("main.js");
        assert_eq!(context.breakpoints(), vec!["main.js"]);

        context.evaluate_with_origin("1 + 1", "main.js").unwrap();
        assert_eq!(
            *events.borrow(),
            vec!["before-compile", "after-compile", "break"]
        );

        assert!(context.remove_breakpoint("main.js"));
        assert!(context.breakpoints().is_empty());
        events.borrow_mut().clear();
        context.evaluate_with_origin("1 + 1", "main.js").unwrap();
        assert!(!events.borrow().contains(&"break".to_string()));
    }

    #[test]
    fn test_exception_event() {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        let (events, listener) = recorder();
        context.set_debug_listener(Some(listener));

        assert!(context.evaluate("throw new Error('x')").is_err());
        assert!(events.borrow().contains(&"exception".to_string()));
    }

    #[test]
    fn test_terminate_from_break() {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        context.set_debug_listener(Some(Rc::new(|event: &DebugEvent<'_>| match event {
            DebugEvent::Break { .. } => DebugAction::Terminate,
            _ => DebugAction::Continue,
        })));
        context.add_breakpoint("stop.js");

        let err = context.evaluate_with_origin("1", "stop.js").unwrap_err();
        assert!(err.is_fatal());
        // other origins still run
        assert_eq!(context.evaluate("2").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_step_listener_terminates_loop() {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        let steps = Rc::new(Cell::new(0u64));
        let seen = steps.clone();
        context.set_debug_listener(Some(Rc::new(move |event: &DebugEvent<'_>| match event {
            DebugEvent::Step { ticks } => {
                seen.set(*ticks);
                if *ticks >= 3 {
                    DebugAction::Terminate
                } else {
                    DebugAction::Continue
                }
            }
            _ => DebugAction::Continue,
        })));

        let err = context.evaluate("for (;;) {}").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(steps.get(), 3);
        // the context is usable again afterwards
        context.set_debug_listener(None);
        assert_eq!(context.evaluate("'ok'").unwrap(), Value::from("ok"));
    }

    #[test]
    fn test_listener_cannot_reenter() {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        let inner = context.clone();
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        context.set_debug_listener(Some(Rc::new(move |event: &DebugEvent<'_>| {
            if let DebugEvent::BeforeCompile { .. } = event {
                if slot.borrow().is_none() {
                    *slot.borrow_mut() = Some(inner.evaluate("1").map(|_| ()));
                }
            }
            DebugAction::Continue
        })));

        context.evaluate("0").unwrap();
        context.set_debug_listener(None);
        let result = result.borrow_mut().take().unwrap();
        assert!(matches!(result, Err(Error::DebugReentry)));
    }
}
