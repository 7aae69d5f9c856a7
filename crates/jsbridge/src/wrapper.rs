//! Object Wrapper
//!
//! Host -> guest: host functions become named guest functions and host
//! objects become guest `Proxy` objects. Every trap funnels into a single
//! Rust function per context, addressed by the exposure slot of the host
//! value. Exposing the same host value twice yields the same guest object
//! for as long as the guest keeps it alive; the guest holds its objects
//! weakly and releases the slot when one is collected.
//!
//! Guest -> host: [`JsObject`] is a host proxy onto a guest object. It pins
//! the object through the context's handle arena and forwards property,
//! index, call and iteration operations into the guest.

use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexSet;
use rquickjs::function::{Args, IntoArgs, Opt};
use rquickjs::{Array, Ctx, Exception, FromJs, Function, Object, Persistent, Value as JsValue};
use tracing::trace;

use crate::arena::ArenaKey;
use crate::context::{Context, ContextInner};
use crate::convert::Converter;
use crate::engine::{ContextId, IsolateId};
use crate::error::{Error, Result};
use crate::exception;
use crate::value::Value;

const PRELUDE: &str = include_str!("prelude.js");

// ─────────────────────────────────────────────────────────────────────────────
// Bridge helpers
// ─────────────────────────────────────────────────────────────────────────────

/// The helper table returned by the prelude, restored into a handle scope
#[derive(Clone)]
pub(crate) struct Helpers<'js> {
    object: Object<'js>,
}

impl<'js> Helpers<'js> {
    pub(crate) fn new(object: Object<'js>) -> Self {
        Self { object }
    }

    /// Call a helper by name.
    pub(crate) fn call<A, R>(
        &self,
        ctx: &Ctx<'js>,
        context: &Rc<ContextInner>,
        name: &str,
        args: A,
    ) -> Result<R>
    where
        A: IntoArgs<'js>,
        R: FromJs<'js>,
    {
        let helper: Function<'js> = self
            .object
            .get(name)
            .map_err(|e| exception::capture(ctx, context, e))?;
        helper
            .call(args)
            .map_err(|e| exception::capture(ctx, context, e))
    }
}

/// Evaluate the prelude in a fresh context and return its helper table.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    context: Weak<ContextInner>,
) -> rquickjs::Result<Persistent<Object<'static>>> {
    let trap = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              slot: u32,
              op: String,
              key: Opt<JsValue<'js>>,
              payload: Opt<JsValue<'js>>|
              -> rquickjs::Result<JsValue<'js>> {
            dispatch(&ctx, &context, slot, &op, key.0, payload.0)
        },
    )?;

    let factory: Function = ctx.eval(PRELUDE)?;
    let helpers: Object = factory.call((trap,))?;
    Ok(Persistent::save(ctx, helpers))
}

// ─────────────────────────────────────────────────────────────────────────────
// Host -> guest
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for every guest operation on an exposed host value.
fn dispatch<'js>(
    ctx: &Ctx<'js>,
    context: &Weak<ContextInner>,
    slot: u32,
    op: &str,
    key: Option<JsValue<'js>>,
    payload: Option<JsValue<'js>>,
) -> rquickjs::Result<JsValue<'js>> {
    let Some(context) = context.upgrade() else {
        return Err(Exception::throw_internal(
            ctx,
            "host object used after its context was disposed",
        ));
    };

    let result = context.enter_scope().and_then(|_entered| {
        if context.isolate.interrupt.is_terminating() {
            return Err(Error::fatal("execution is terminating"));
        }
        service(ctx, &context, slot, op, key, payload)
    });
    result.map_err(|err| exception::throw_into_guest(ctx, &context, err))
}

fn service<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    slot: u32,
    op: &str,
    key: Option<JsValue<'js>>,
    payload: Option<JsValue<'js>>,
) -> Result<JsValue<'js>> {
    match op {
        "release" => {
            let released = context.bridge(|bridge| bridge.release_exposure(slot))?;
            trace!(target: "jsbridge::wrapper", slot, released = released.is_some(), "exposure collected");
            drop(released);
            return Ok(JsValue::new_undefined(ctx.clone()));
        }
        "releaseError" => {
            let released = context.bridge(|bridge| bridge.host_errors.remove(&slot))?;
            drop(released);
            return Ok(JsValue::new_undefined(ctx.clone()));
        }
        _ => {}
    }

    let target = context
        .bridge(|bridge| bridge.slots.get(&slot).map(|exposure| exposure.value.clone()))?
        .ok_or(Error::InvalidatedHandle)?;
    let mut converter = Converter::new(ctx, context);

    if op == "call" {
        let args = match payload {
            Some(args) => args_to_host(&mut converter, args)?,
            None => Vec::new(),
        };
        let result = match &target {
            Value::Function(function) => function.call(&args)?,
            Value::Object(object) => object.call(&args)?,
            other => {
                return Err(Error::type_error(format!("{} is not callable", other.kind())));
            }
        };
        return converter.to_guest(&result);
    }

    let Value::Object(object) = &target else {
        return Err(Error::type_error(format!(
            "unsupported operation '{op}' on host {}",
            target.kind()
        )));
    };

    match op {
        "get" => match object.get(&key_name(&mut converter, key)?)? {
            Some(value) => converter.to_guest(&value),
            None => Ok(JsValue::new_undefined(ctx.clone())),
        },
        "set" => {
            let name = key_name(&mut converter, key)?;
            let value = match payload {
                Some(value) => converter.to_host(value)?,
                None => Value::Undefined,
            };
            object.set(&name, value)?;
            Ok(JsValue::new_undefined(ctx.clone()))
        }
        "has" => {
            let found = object.has(&key_name(&mut converter, key)?)?;
            Ok(JsValue::new_bool(ctx.clone(), found))
        }
        "delete" => {
            let deleted = object.delete(&key_name(&mut converter, key)?)?;
            Ok(JsValue::new_bool(ctx.clone(), deleted))
        }
        "keys" => {
            let keys: IndexSet<String> = object.keys()?.into_iter().collect();
            let array = Array::new(ctx.clone()).map_err(|e| exception::capture(ctx, context, e))?;
            for (index, key) in keys.iter().enumerate() {
                array
                    .set(index, key.as_str())
                    .map_err(|e| exception::capture(ctx, context, e))?;
            }
            Ok(array.into_value())
        }
        _ => Err(Error::type_error(format!("unknown host operation '{op}'"))),
    }
}

fn key_name<'js>(converter: &mut Converter<'_, 'js>, key: Option<JsValue<'js>>) -> Result<String> {
    match key {
        Some(key) => match converter.to_host(key)? {
            Value::String(name) => Ok(name),
            other => Ok(other.to_string()),
        },
        None => Err(Error::type_error("missing property key")),
    }
}

fn args_to_host<'js>(converter: &mut Converter<'_, 'js>, args: JsValue<'js>) -> Result<Vec<Value>> {
    match converter.to_host(args)? {
        Value::List(list) => Ok(list.to_vec()),
        other => Err(Error::type_error(format!(
            "expected an argument list, got {}",
            other.kind()
        ))),
    }
}

/// Guest object for a host function or host object, created on first
/// exposure and reused afterwards.
pub(crate) fn expose<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    value: &Value,
) -> Result<JsValue<'js>> {
    let identity = match value {
        Value::Function(function) => function.identity(),
        Value::Object(object) => object.identity(),
        other => {
            return Err(Error::conversion(other.kind(), "only callables and host objects are exposed by reference"));
        }
    };

    let helpers = context.helpers(ctx)?;
    let existing = context.bridge(|bridge| bridge.exposed.get(&identity).copied())?;
    if let Some(slot) = existing {
        let current: JsValue<'js> = helpers.call(ctx, context, "exposed", (slot,))?;
        if current.is_object() {
            return Ok(current);
        }
    }

    // First exposure, or the previous guest object was collected and its
    // slot is waiting to be released.
    let slot = context.bridge(|bridge| bridge.add_exposure(identity, value.clone()))?;
    match value {
        Value::Object(object) => helpers.call(
            ctx,
            context,
            "makeHostProxy",
            (slot, object.is_callable(), object.class_name()),
        ),
        _ => {
            let name = match value {
                Value::Function(function) => function.name(),
                _ => "",
            };
            helpers.call(ctx, context, "makeHostFunction", (slot, name))
        }
    }
}

/// The host value behind a guest object, if it is one of our exposures.
pub(crate) fn host_value_for<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    value: &JsValue<'js>,
) -> Result<Option<Value>> {
    let slot: Option<u32> = context
        .helpers(ctx)?
        .call(ctx, context, "exposureSlot", (value.clone(),))?;
    let Some(slot) = slot else {
        return Ok(None);
    };
    context.bridge(|bridge| bridge.slots.get(&slot).map(|exposure| exposure.value.clone()))
}

/// Resolve a host-side guest proxy into `context`'s handle scope.
pub(crate) fn resolve_for<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    object: &JsObject,
) -> Result<JsValue<'js>> {
    let owner = object.owner()?;
    if !Rc::ptr_eq(&owner, context) {
        let same_isolate = owner.isolate.id == context.isolate.id;
        let shared_token = match (owner.security_token(), context.security_token()) {
            (Some(a), Some(b)) => !a.is_empty() && a == b,
            _ => false,
        };
        if !same_isolate || !shared_token {
            return Err(Error::conversion(
                "guest object",
                format!("object belongs to {}, not {}", owner.id, context.id),
            ));
        }
    }
    object.restore(ctx, &owner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Guest -> host
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct JsObjectInner {
    key: ArenaKey,
    context: Weak<ContextInner>,
    context_id: ContextId,
    isolate_id: IsolateId,
    callable: bool,
    array: bool,
}

impl Drop for JsObjectInner {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.release_key(self.key);
        }
    }
}

/// Operations a guest object supports, discovered per object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub property: bool,
    pub indexed: bool,
    pub callable: bool,
    pub iterable: bool,
}

/// Host proxy onto a guest object or function.
///
/// Clones share identity. Wrapping the same guest object again while a
/// proxy for it is alive returns that proxy. All operations fail with
/// [`Error::InvalidatedHandle`] once the owning context is disposed.
#[derive(Clone)]
pub struct JsObject(Rc<JsObjectInner>);

impl JsObject {
    pub(crate) fn from_guest<'js>(
        ctx: &Ctx<'js>,
        context: &Rc<ContextInner>,
        value: JsValue<'js>,
    ) -> Result<Self> {
        let callable = value.is_function();
        let array = value.is_array();
        let handle = Persistent::save(ctx, value);

        let (key, existing) = context.bridge(|bridge| {
            let key = bridge.arena.register(handle);
            let existing = bridge.wrappers.get(&key).and_then(Weak::upgrade);
            (key, existing)
        })?;
        if let Some(existing) = existing {
            context.release_key(key);
            return Ok(Self(existing));
        }

        let inner = Rc::new(JsObjectInner {
            key,
            context: Rc::downgrade(context),
            context_id: context.id,
            isolate_id: context.isolate.id,
            callable,
            array,
        });
        context.bridge(|bridge| bridge.wrappers.insert(key, Rc::downgrade(&inner)))?;
        Ok(Self(inner))
    }

    fn owner(&self) -> Result<Rc<ContextInner>> {
        self.0.context.upgrade().ok_or(Error::InvalidatedHandle)
    }

    pub(crate) fn restore<'js>(&self, ctx: &Ctx<'js>, owner: &Rc<ContextInner>) -> Result<JsValue<'js>> {
        let handle = owner
            .bridge(|bridge| bridge.arena.resolve(self.0.key).cloned())?
            .ok_or(Error::InvalidatedHandle)?;
        handle
            .restore(ctx)
            .map_err(|e| exception::capture(ctx, owner, e))
    }

    fn restore_object<'js>(&self, ctx: &Ctx<'js>, owner: &Rc<ContextInner>) -> Result<Object<'js>> {
        self.restore(ctx, owner)?
            .into_object()
            .ok_or_else(|| Error::conversion("guest object", "handle does not refer to an object"))
    }

    /// Run `f` inside the owning context with the object restored.
    fn with_object<R>(
        &self,
        f: impl for<'js> FnOnce(&Ctx<'js>, &Rc<ContextInner>, Object<'js>) -> Result<R>,
    ) -> Result<R> {
        let owner = self.owner()?;
        owner.with_ctx(|ctx| {
            let object = self.restore_object(ctx, &owner)?;
            f(ctx, &owner, object)
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.0.context_id
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.0.isolate_id
    }

    /// The owning context, while it is alive.
    pub fn context(&self) -> Option<Context> {
        self.0.context.upgrade().map(Context::from_inner)
    }

    /// Whether the owning context is alive and not disposed.
    pub fn is_alive(&self) -> bool {
        self.0
            .context
            .upgrade()
            .is_some_and(|context| !context.is_disposed())
    }

    pub fn is_callable(&self) -> bool {
        self.0.callable
    }

    pub fn is_array(&self) -> bool {
        self.0.array
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        self.with_object(|ctx, owner, object| {
            let value: JsValue = object
                .get(name)
                .map_err(|e| exception::capture(ctx, owner, e))?;
            Converter::new(ctx, owner).to_host(value)
        })
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.with_object(|ctx, owner, object| {
            let value = Converter::new(ctx, owner).to_guest(&value)?;
            object
                .set(name, value)
                .map_err(|e| exception::capture(ctx, owner, e))
        })
    }

    /// Delete a property. Returns the guest's `delete` result.
    pub fn delete(&self, name: &str) -> Result<bool> {
        self.with_object(|ctx, owner, object| {
            owner
                .helpers(ctx)?
                .call(ctx, owner, "remove", (object, name))
        })
    }

    pub fn has(&self, name: &str) -> Result<bool> {
        self.with_object(|ctx, owner, object| {
            object
                .contains_key(name)
                .map_err(|e| exception::capture(ctx, owner, e))
        })
    }

    /// Own enumerable string keys.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.with_object(|ctx, owner, object| {
            object
                .keys::<String>()
                .collect::<rquickjs::Result<Vec<_>>>()
                .map_err(|e| exception::capture(ctx, owner, e))
        })
    }

    /// Read an index. Fails with a `RangeError` when the object has no
    /// such index.
    pub fn get_index(&self, index: u32) -> Result<Value> {
        self.with_object(|ctx, owner, object| {
            let present = object
                .contains_key(index)
                .map_err(|e| exception::capture(ctx, owner, e))?;
            if !present {
                let class: String = owner
                    .helpers(ctx)?
                    .call(ctx, owner, "className", (object,))?;
                return Err(Error::range_error(format!("'{class}' index {index} out of range")));
            }
            let value: JsValue = object
                .get(index)
                .map_err(|e| exception::capture(ctx, owner, e))?;
            Converter::new(ctx, owner).to_host(value)
        })
    }

    /// Delete an index, returning the value it held, if any.
    pub fn delete_index(&self, index: u32) -> Result<Option<Value>> {
        self.with_object(|ctx, owner, object| {
            let present = object
                .contains_key(index)
                .map_err(|e| exception::capture(ctx, owner, e))?;
            let previous = if present {
                let value: JsValue = object
                    .get(index)
                    .map_err(|e| exception::capture(ctx, owner, e))?;
                Some(Converter::new(ctx, owner).to_host(value)?)
            } else {
                None
            };
            let deleted: bool = owner
                .helpers(ctx)?
                .call(ctx, owner, "remove", (object, index))?;
            if !deleted {
                return Err(Error::type_error(format!("index {index} cannot be deleted")));
            }
            Ok(previous)
        })
    }

    /// Whether any index in `0..length` holds a value equal to `item`.
    pub fn contains(&self, item: &Value) -> Result<bool> {
        self.with_object(|ctx, owner, object| {
            let length: f64 = object
                .get("length")
                .map_err(|e| exception::capture(ctx, owner, e))?;
            let mut converter = Converter::new(ctx, owner);
            converter.reserve(length)?;
            for index in 0..length as u32 {
                converter.tick()?;
                let present = object
                    .contains_key(index)
                    .map_err(|e| exception::capture(ctx, owner, e))?;
                if !present {
                    continue;
                }
                let value: JsValue = object
                    .get(index)
                    .map_err(|e| exception::capture(ctx, owner, e))?;
                if converter.to_host(value)? == *item {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    pub fn set_index(&self, index: u32, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.with_object(|ctx, owner, object| {
            let value = Converter::new(ctx, owner).to_guest(&value)?;
            object
                .set(index, value)
                .map_err(|e| exception::capture(ctx, owner, e))
        })
    }

    /// The object's `length`, for arrays and array-likes.
    pub fn len(&self) -> Result<usize> {
        match self.get("length")? {
            Value::Int(n) if n >= 0 => Ok(n as usize),
            other => Err(Error::conversion(
                "length",
                format!("object has no numeric length (found {})", other.kind()),
            )),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Call with `this` undefined.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.call_with_this(Value::Undefined, args)
    }

    pub fn call_with_this(&self, this: impl Into<Value>, args: &[Value]) -> Result<Value> {
        let this = this.into();
        self.with_object(|ctx, owner, object| {
            let function = object
                .into_value()
                .into_function()
                .ok_or_else(|| Error::type_error("guest object is not callable"))?;
            invoke(ctx, owner, &function, &this, args)
        })
    }

    /// Call the method `name` with this object as `this`.
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value> {
        self.with_object(|ctx, owner, object| {
            let method: JsValue = object
                .get(name)
                .map_err(|e| exception::capture(ctx, owner, e))?;
            let function = method
                .into_function()
                .ok_or_else(|| Error::type_error(format!("'{name}' is not a function")))?;
            let mut converter = Converter::new(ctx, owner);
            let mut call_args = Args::new(ctx.clone(), args.len());
            call_args
                .this(object)
                .map_err(|e| exception::capture(ctx, owner, e))?;
            for arg in args {
                let arg = converter.to_guest(arg)?;
                call_args
                    .push_arg(arg)
                    .map_err(|e| exception::capture(ctx, owner, e))?;
            }
            let result: JsValue = function
                .call_arg(call_args)
                .map_err(|e| exception::capture(ctx, owner, e))?;
            converter.to_host(result)
        })
    }

    /// `new` this object with the given arguments.
    pub fn construct(&self, args: &[Value]) -> Result<Value> {
        self.with_object(|ctx, owner, object| {
            let mut converter = Converter::new(ctx, owner);
            let args = converter.to_guest(&Value::from(args.to_vec()))?;
            let result: JsValue = owner
                .helpers(ctx)?
                .call(ctx, owner, "construct", (object, args))?;
            converter.to_host(result)
        })
    }

    /// Start the guest iterator protocol. Each call asks the object for a
    /// fresh iterator, so restartability follows the guest object.
    pub fn iter(&self) -> Result<JsIter> {
        let iterator = self.with_object(|ctx, owner, object| {
            let iterator: JsValue = owner
                .helpers(ctx)?
                .call(ctx, owner, "iterator", (object,))?;
            JsObject::from_guest(ctx, owner, iterator)
        })?;
        Ok(JsIter {
            iterator,
            done: false,
        })
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        let callable = self.0.callable;
        let array = self.0.array;
        self.with_object(|ctx, owner, object| {
            let helpers = owner.helpers(ctx)?;
            let iterable: bool = helpers.call(ctx, owner, "isIterable", (object.clone(),))?;
            let has_length = object
                .contains_key("length")
                .map_err(|e| exception::capture(ctx, owner, e))?;
            Ok(Capabilities {
                property: true,
                indexed: array || (has_length && !callable),
                callable,
                iterable,
            })
        })
    }

    /// The guest's class tag, e.g. `"Array"`, `"Promise"`, `"Map"`.
    pub fn type_name(&self) -> Result<String> {
        self.with_object(|ctx, owner, object| {
            owner
                .helpers(ctx)?
                .call(ctx, owner, "className", (object,))
        })
    }

    /// The function name, for callables.
    pub fn name(&self) -> Result<Option<String>> {
        if !self.0.callable {
            return Ok(None);
        }
        match self.get("name")? {
            Value::String(name) => Ok(Some(name)),
            _ => Ok(None),
        }
    }

    /// Guest truthiness of the object.
    pub fn is_truthy(&self) -> Result<bool> {
        self.with_object(|ctx, owner, object| {
            owner.helpers(ctx)?.call(ctx, owner, "truthy", (object,))
        })
    }

    /// Guest loose equality (`==`) with `other`.
    pub fn loose_eq(&self, other: impl Into<Value>) -> Result<bool> {
        let other = other.into();
        self.with_object(|ctx, owner, object| {
            let other = Converter::new(ctx, owner).to_guest(&other)?;
            owner
                .helpers(ctx)?
                .call(ctx, owner, "looseEquals", (object, other))
        })
    }

    /// Fetch the function at `name` together with this object, so it can
    /// later be called with this object as `this`.
    pub fn method(&self, name: &str) -> Result<JsMethod> {
        match self.get(name)? {
            Value::Js(function) if function.is_callable() => Ok(JsMethod {
                function,
                owner: self.clone(),
            }),
            other => Err(Error::type_error(format!(
                "'{name}' is not a function (found {})",
                other.kind()
            ))),
        }
    }

    /// The host error this guest error object was created from, if it was
    /// thrown into the guest by a host function.
    pub fn host_error(&self) -> Result<Option<Error>> {
        self.with_object(|ctx, owner, object| {
            let tag: Option<u32> = owner
                .helpers(ctx)?
                .call(ctx, owner, "errorTag", (object,))?;
            Ok(match tag {
                Some(tag) => owner.bridge(|bridge| bridge.host_errors.get(&tag).cloned())?,
                None => None,
            })
        })
    }
}

fn invoke<'js>(
    ctx: &Ctx<'js>,
    owner: &Rc<ContextInner>,
    function: &Function<'js>,
    this: &Value,
    args: &[Value],
) -> Result<Value> {
    let mut converter = Converter::new(ctx, owner);
    let mut call_args = Args::new(ctx.clone(), args.len());
    let this = converter.to_guest(this)?;
    call_args
        .this(this)
        .map_err(|e| exception::capture(ctx, owner, e))?;
    for arg in args {
        let arg = converter.to_guest(arg)?;
        call_args
            .push_arg(arg)
            .map_err(|e| exception::capture(ctx, owner, e))?;
    }
    let result: JsValue = function
        .call_arg(call_args)
        .map_err(|e| exception::capture(ctx, owner, e))?;
    converter.to_host(result)
}

impl PartialEq for JsObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.0.callable {
            "function"
        } else if self.0.array {
            "array"
        } else {
            "object"
        };
        write!(f, "[guest {kind} {}]", self.0.key)
    }
}

/// A guest function bound to the object it was fetched from
#[derive(Clone, Debug)]
pub struct JsMethod {
    function: JsObject,
    owner: JsObject,
}

impl JsMethod {
    pub fn function(&self) -> &JsObject {
        &self.function
    }

    /// The object the function was read from.
    pub fn owner(&self) -> &JsObject {
        &self.owner
    }

    /// Call with the owner as `this`.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.function
            .call_with_this(Value::Js(self.owner.clone()), args)
    }
}

/// Lazy iterator over a guest iterator. Fused once the guest reports
/// `done` or an error occurs.
pub struct JsIter {
    iterator: JsObject,
    done: bool,
}

impl Iterator for JsIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.iterator.with_object(|ctx, owner, iterator| {
            let step: JsValue = owner
                .helpers(ctx)?
                .call(ctx, owner, "step", (iterator,))?;
            Converter::new(ctx, owner).to_host(step)
        });

        let step = match step {
            Ok(Value::List(step)) => step,
            Ok(other) => {
                self.done = true;
                return Some(Err(Error::conversion(
                    "iterator result",
                    format!("unexpected {}", other.kind()),
                )));
            }
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        if step.get(0) == Some(Value::Bool(true)) {
            self.done = true;
            return None;
        }
        Some(Ok(step.get(1).unwrap_or_default()))
    }
}

impl std::iter::FusedIterator for JsIter {}
