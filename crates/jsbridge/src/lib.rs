//! jsbridge - Rust <-> JavaScript object bridge
//!
//! This crate embeds QuickJS and lets host code and guest JavaScript call
//! into each other:
//! - Engine and context lifetime, with per-thread isolate affinity
//! - Value conversion in both directions, preserving identity and cycles
//! - Host objects and functions exposed to the guest as live proxies
//! - Guest objects held on the host as [`JsObject`] proxies
//! - Exceptions translated across the boundary, with termination kept apart
//!
//! ```ignore
//! use jsbridge::{Context, Engine, Value};
//!
//! let engine = Engine::new()?;
//! let context = Context::new(&engine)?;
//! context.expose_global("add", Value::function("add", |args| {
//!     let a = args.first().and_then(Value::as_int).unwrap_or(0);
//!     let b = args.get(1).and_then(Value::as_int).unwrap_or(0);
//!     Ok(Value::Int(a + b))
//! }))?;
//! assert_eq!(context.evaluate("add(2, 3)")?, Value::Int(5));
//! ```

// Handle arena
pub mod arena;

// Configuration
pub mod config;

// Context manager
pub mod context;

// Value converter
pub mod convert;

// Debug hook
pub mod debug;

// Engine manager
pub mod engine;

// Error taxonomy
pub mod error;

// Exception bridge
mod exception;

// Host value model
pub mod value;

// Object wrapper
pub mod wrapper;

pub use config::{EngineConfig, IntegerPolicy};
pub use context::{Context, ContextScope, ContextState, Script};
pub use debug::{DebugAction, DebugEvent, DebugListener};
pub use engine::{ContextId, Engine, IsolateId, MemoryStats, TerminationHandle};
pub use error::{Error, ErrorKind, GuestException, HostError, Result, StackFrame};
pub use value::{HostClass, HostFunction, HostObject, List, Map, Record, Value};
pub use wrapper::{Capabilities, JsIter, JsMethod, JsObject};
