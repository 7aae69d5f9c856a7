//! Value Converter
//!
//! Translates values between the host model ([`Value`]) and QuickJS values.
//!
//! Numbers: the guest has one float64 type with a fast int32 path.
//! - host `Int` within i32 becomes a guest int, within ±(2^53 - 1) an exact
//!   guest float, and beyond that follows [`IntegerPolicy`]
//! - guest floats that are integral, safe, and not `-0` come back as `Int`
//!
//! Strings are UTF-8 on the host and UTF-16 in the guest. A guest string
//! with an unpaired surrogate has no UTF-8 form and is rejected.
//!
//! Containers are copied; callables and class instances are shared through
//! the wrapper layer. One converter instance tracks identity for the whole
//! conversion, so shared substructure and cycles are preserved.

use std::collections::HashMap;
use std::rc::Rc;

use chrono::DateTime;
use rquickjs::{Array, Ctx, Object, Type, Value as JsValue};
use tracing::debug;

use crate::config::IntegerPolicy;
use crate::context::ContextInner;
use crate::error::{Error, Result};
use crate::exception;
use crate::value::{List, Map, Value};
use crate::wrapper::{self, Helpers, JsObject};

/// Largest integer a float64 represents exactly.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Elements copied between polls of the termination flag.
const POLL_INTERVAL: usize = 1024;

/// Nesting depth and element budget for container conversion
struct LimitTracker {
    depth: usize,
    max_depth: usize,
    elements: usize,
    max_elements: usize,
}

impl LimitTracker {
    fn new(max_depth: usize, max_elements: usize) -> Self {
        Self {
            depth: 0,
            max_depth,
            elements: 0,
            max_elements,
        }
    }

    /// Reserve room for `count` more elements before copying them.
    fn reserve(&self, count: f64) -> Result<()> {
        let remaining = self.max_elements.saturating_sub(self.elements);
        if count > remaining as f64 {
            return Err(Error::conversion(
                "length",
                format!("{count} elements exceed the limit of {}", self.max_elements),
            ));
        }
        Ok(())
    }

    /// Count one copied element. Returns `true` when it is time to poll.
    fn tick(&mut self) -> bool {
        self.elements += 1;
        self.elements % POLL_INTERVAL == 0
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(Error::conversion(
                "depth",
                format!("nesting exceeds {} levels", self.max_depth),
            ));
        }
        Ok(())
    }

    fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

/// Converter bound to one context and one handle scope
pub(crate) struct Converter<'a, 'js> {
    ctx: &'a Ctx<'js>,
    context: &'a Rc<ContextInner>,
    helpers: Option<Helpers<'js>>,
    limits: LimitTracker,
    policy: IntegerPolicy,
    /// Host container identity -> guest value produced for it
    to_guest_seen: HashMap<usize, JsValue<'js>>,
    /// Guest object -> host value produced for it
    to_host_seen: HashMap<JsValue<'js>, Value>,
}

impl<'a, 'js> Converter<'a, 'js> {
    pub(crate) fn new(ctx: &'a Ctx<'js>, context: &'a Rc<ContextInner>) -> Self {
        let config = &context.isolate.config;
        Self {
            ctx,
            context,
            helpers: None,
            limits: LimitTracker::new(config.max_conversion_depth, config.max_conversion_elements),
            policy: config.integer_policy,
            to_guest_seen: HashMap::new(),
            to_host_seen: HashMap::new(),
        }
    }

    fn helpers(&mut self) -> Result<Helpers<'js>> {
        if let Some(helpers) = &self.helpers {
            return Ok(helpers.clone());
        }
        let helpers = self.context.helpers(self.ctx)?;
        self.helpers = Some(helpers.clone());
        Ok(helpers)
    }

    fn engine_error(&self, err: rquickjs::Error) -> Error {
        exception::capture(self.ctx, self.context, err)
    }

    pub(crate) fn reserve(&self, count: f64) -> Result<()> {
        self.limits.reserve(count)
    }

    /// Count one copied element, polling for termination now and then.
    pub(crate) fn tick(&mut self) -> Result<()> {
        if self.limits.tick() {
            self.context.isolate.interrupt.check()?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Host -> guest
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn to_guest(&mut self, value: &Value) -> Result<JsValue<'js>> {
        let ctx = self.ctx.clone();
        let converted = match value {
            Value::Undefined => JsValue::new_undefined(ctx),
            Value::Null => JsValue::new_null(ctx),
            Value::Bool(b) => JsValue::new_bool(ctx, *b),
            Value::Int(i) => self.int_to_guest(*i)?,
            Value::Float(f) => JsValue::new_float(ctx, *f),
            Value::String(s) => rquickjs::String::from_str(ctx, s)
                .map_err(|e| self.engine_error(e))?
                .into_value(),
            Value::Date(date) => {
                let helpers = self.helpers()?;
                helpers.call(self.ctx, self.context, "makeDate", (date.timestamp_millis() as f64,))?
            }
            Value::List(list) => self.list_to_guest(list)?,
            Value::Map(map) => self.map_to_guest(map)?,
            Value::Function(_) | Value::Object(_) => wrapper::expose(self.ctx, self.context, value)?,
            Value::Js(object) => wrapper::resolve_for(self.ctx, self.context, object)?,
        };
        Ok(converted)
    }

    fn int_to_guest(&self, i: i64) -> Result<JsValue<'js>> {
        let ctx = self.ctx.clone();
        if let Ok(small) = i32::try_from(i) {
            return Ok(JsValue::new_int(ctx, small));
        }
        if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 {
            return Ok(JsValue::new_float(ctx, i as f64));
        }
        match self.policy {
            IntegerPolicy::Strict => Err(Error::conversion(
                "integer",
                format!("{i} is outside the guest's exact integer range (±2^53-1)"),
            )),
            IntegerPolicy::Lossy => {
                debug!(target: "jsbridge::convert", value = i, "promoting integer to float");
                Ok(JsValue::new_float(ctx, i as f64))
            }
        }
    }

    fn list_to_guest(&mut self, list: &List) -> Result<JsValue<'js>> {
        if let Some(existing) = self.to_guest_seen.get(&list.identity()) {
            return Ok(existing.clone());
        }
        self.limits.enter()?;

        let array = Array::new(self.ctx.clone()).map_err(|e| self.engine_error(e))?;
        self.to_guest_seen
            .insert(list.identity(), array.clone().into_value());
        for (index, item) in list.to_vec().iter().enumerate() {
            let item = self.to_guest(item)?;
            array.set(index, item).map_err(|e| self.engine_error(e))?;
        }

        self.limits.exit();
        Ok(array.into_value())
    }

    fn map_to_guest(&mut self, map: &Map) -> Result<JsValue<'js>> {
        if let Some(existing) = self.to_guest_seen.get(&map.identity()) {
            return Ok(existing.clone());
        }
        self.limits.enter()?;

        let object = Object::new(self.ctx.clone()).map_err(|e| self.engine_error(e))?;
        self.to_guest_seen
            .insert(map.identity(), object.clone().into_value());
        for (key, item) in map.entries() {
            let item = self.to_guest(&item)?;
            object
                .set(key.as_str(), item)
                .map_err(|e| self.engine_error(e))?;
        }

        self.limits.exit();
        Ok(object.into_value())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Guest -> host
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn to_host(&mut self, value: JsValue<'js>) -> Result<Value> {
        match value.type_of() {
            Type::Undefined => Ok(Value::Undefined),
            Type::Null => Ok(Value::Null),
            Type::Bool => Ok(Value::Bool(value.as_bool().unwrap_or_default())),
            Type::Int => Ok(Value::Int(value.as_int().map(i64::from).unwrap_or_default())),
            Type::Float => Ok(float_to_host(value.as_float().unwrap_or(f64::NAN))),
            Type::String => {
                let text = value
                    .as_string()
                    .ok_or_else(|| Error::conversion("string", "not a string"))?;
                text.to_string().map_err(|_| {
                    Error::conversion("string", "contains an unpaired UTF-16 surrogate")
                })
                .map(Value::String)
            }
            Type::Array
            | Type::Object
            | Type::Function
            | Type::Constructor
            | Type::Promise
            | Type::Exception => self.object_to_host(value),
            Type::Symbol => Err(Error::conversion(
                "symbol",
                "symbols have no host representation",
            )),
            Type::BigInt => Err(Error::conversion(
                "bigint",
                "bigints have no host representation",
            )),
            other => Err(Error::conversion(
                other.as_str(),
                "value has no host representation",
            )),
        }
    }

    fn object_to_host(&mut self, value: JsValue<'js>) -> Result<Value> {
        if let Some(host) = wrapper::host_value_for(self.ctx, self.context, &value)? {
            return Ok(host);
        }
        if let Some(existing) = self.to_host_seen.get(&value) {
            return Ok(existing.clone());
        }

        let helpers = self.helpers()?;
        let kind: String = helpers.call(self.ctx, self.context, "kindOf", (value.clone(),))?;
        match kind.as_str() {
            "array" => self.array_to_host(value),
            "plain" => self.plain_to_host(value),
            "date" => {
                let millis: f64 =
                    helpers.call(self.ctx, self.context, "dateValue", (value,))?;
                if !millis.is_finite() {
                    return Err(Error::conversion("date", "invalid date"));
                }
                DateTime::from_timestamp_millis(millis as i64)
                    .map(Value::Date)
                    .ok_or_else(|| Error::conversion("date", "date is out of range"))
            }
            _ => Ok(Value::Js(JsObject::from_guest(self.ctx, self.context, value)?)),
        }
    }

    fn array_to_host(&mut self, value: JsValue<'js>) -> Result<Value> {
        let object = value
            .as_object()
            .cloned()
            .ok_or_else(|| Error::conversion("array", "not an object"))?;
        self.limits.enter()?;

        let list = List::new();
        self.to_host_seen.insert(value, Value::List(list.clone()));
        let length: f64 = object.get("length").map_err(|e| self.engine_error(e))?;
        self.reserve(length)?;
        for index in 0..length as u32 {
            self.tick()?;
            let item: JsValue = object.get(index).map_err(|e| self.engine_error(e))?;
            list.push(self.to_host(item)?);
        }

        self.limits.exit();
        Ok(Value::List(list))
    }

    fn plain_to_host(&mut self, value: JsValue<'js>) -> Result<Value> {
        let object = value
            .as_object()
            .cloned()
            .ok_or_else(|| Error::conversion("object", "not an object"))?;
        self.limits.enter()?;

        let map = Map::new();
        self.to_host_seen.insert(value, Value::Map(map.clone()));
        let keys = object
            .keys::<String>()
            .collect::<rquickjs::Result<Vec<_>>>()
            .map_err(|e| self.engine_error(e))?;
        self.reserve(keys.len() as f64)?;
        for key in keys {
            self.tick()?;
            let item: JsValue = object
                .get(key.as_str())
                .map_err(|e| self.engine_error(e))?;
            let item = self.to_host(item)?;
            map.insert(key, item);
        }

        self.limits.exit();
        Ok(Value::Map(map))
    }
}

fn float_to_host(f: f64) -> Value {
    let negative_zero = f == 0.0 && f.is_sign_negative();
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER as f64 && !negative_zero {
        Value::Int(f as i64)
    } else {
        Value::Float(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::Context;
    use crate::engine::Engine;

    fn context() -> (Engine, Context) {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        (engine, context)
    }

    #[test]
    fn test_float_to_host() {
        assert!(matches!(float_to_host(3.0), Value::Int(3)));
        assert!(matches!(float_to_host(-0.0), Value::Float(f) if f == 0.0 && f.is_sign_negative()));
        assert!(matches!(float_to_host(0.5), Value::Float(_)));
        assert!(matches!(float_to_host(f64::NAN), Value::Float(f) if f.is_nan()));
        assert!(matches!(float_to_host(f64::INFINITY), Value::Float(_)));
        assert!(matches!(float_to_host(9007199254740992.0), Value::Float(_)));
    }

    #[test]
    fn test_primitive_round_trips() {
        let (_engine, context) = context();
        context.expose_global("echo", Value::function("echo", |args| {
            Ok(args.first().cloned().unwrap_or_default())
        }))
        .unwrap();

        for value in [
            Value::Undefined,
            Value::Null,
            Value::Bool(true),
            Value::Int(42),
            Value::Int(-7),
            Value::Int(3_000_000_000),
            Value::Int(MAX_SAFE_INTEGER),
            Value::Float(1.5),
            Value::Float(f64::INFINITY),
            Value::from("héllo 👋"),
        ] {
            context.expose_global("v", value.clone()).unwrap();
            assert_eq!(context.evaluate("echo(v)").unwrap(), value);
        }
    }

    #[test]
    fn test_guest_numbers() {
        let (_engine, context) = context();
        assert_eq!(context.evaluate("1 + 1").unwrap(), Value::Int(2));
        assert!(matches!(context.evaluate("2 ** 40").unwrap(), Value::Int(1099511627776)));
        assert!(matches!(context.evaluate("0.1 + 0.2").unwrap(), Value::Float(_)));
        assert!(matches!(context.evaluate("-0").unwrap(), Value::Float(_)));
        assert!(matches!(context.evaluate("NaN").unwrap(), Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_integer_policy() {
        let (_engine, context) = context();
        let err = context.expose_global("big", Value::Int(i64::MAX)).unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "integer"));

        let engine = Engine::with_config(
            EngineConfig::new().with_integer_policy(IntegerPolicy::Lossy),
        )
        .unwrap();
        let lossy = Context::new(&engine).unwrap();
        lossy.expose_global("big", Value::Int(i64::MAX)).unwrap();
        assert_eq!(lossy.evaluate("typeof big").unwrap(), Value::from("number"));
    }

    #[test]
    fn test_lone_surrogate_rejected() {
        let (_engine, context) = context();
        let err = context.evaluate("'\\ud800'").unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "string"));
        assert_eq!(context.evaluate("'\\ud83d\\udc4b'").unwrap(), Value::from("👋"));
    }

    #[test]
    fn test_unsupported_kinds() {
        let (_engine, context) = context();
        let err = context.evaluate("Symbol('s')").unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "symbol"));
        let err = context.evaluate("10n").unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "bigint"));
    }

    #[test]
    fn test_dates() {
        let (_engine, context) = context();
        let date = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        context.expose_global("when", Value::Date(date)).unwrap();
        assert_eq!(context.evaluate("when.getTime()").unwrap(), Value::Int(1_700_000_000_123));
        assert_eq!(context.evaluate("when").unwrap(), Value::Date(date));

        let err = context.evaluate("new Date(NaN)").unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "date"));
    }

    #[test]
    fn test_nested_containers() {
        let (_engine, context) = context();
        let value = context.evaluate("({x: 1, y: [1, 2, {z: null}]})").unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map.keys(), vec!["x", "y"]);
        let y = map.get("y").unwrap();
        let y = y.as_list().unwrap();
        assert_eq!(y.len(), 3);
        assert_eq!(y.get(2).unwrap().as_map().unwrap().get("z"), Some(Value::Null));
    }

    #[test]
    fn test_shared_substructure_preserved() {
        let (_engine, context) = context();
        let value = context.evaluate("const s = [1]; [s, s]").unwrap();
        let outer = value.as_list().unwrap();
        let (a, b) = (outer.get(0).unwrap(), outer.get(1).unwrap());
        assert!(a.as_list().unwrap().ptr_eq(b.as_list().unwrap()));
    }

    #[test]
    fn test_depth_limit() {
        let engine = Engine::with_config(EngineConfig::new().with_max_conversion_depth(4)).unwrap();
        let context = Context::new(&engine).unwrap();
        assert!(context.evaluate("[[[1]]]").is_ok());
        let err = context.evaluate("[[[[[1]]]]]").unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "depth"));
    }

    #[test]
    fn test_element_limit() {
        let engine =
            Engine::with_config(EngineConfig::new().with_max_conversion_elements(100)).unwrap();
        let context = Context::new(&engine).unwrap();
        assert_eq!(context.evaluate("new Array(50).fill(0)").unwrap().as_list().unwrap().len(), 50);

        // a sparse array only claims its length
        let err = context.evaluate("const a = []; a.length = 3e6; a").unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "length"));

        // the budget covers nested containers together
        let err = context
            .evaluate("Array.from({ length: 20 }, () => new Array(10).fill(1))")
            .unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "length"));

        let err = context
            .evaluate("Object.fromEntries(Array.from({ length: 200 }, (_, i) => ['k' + i, i]))")
            .unwrap_err();
        assert!(matches!(err, Error::Conversion { ref kind, .. } if kind == "length"));
    }

    #[test]
    fn test_large_conversion_stops_on_termination() {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        let handle = engine.termination_handle();
        context
            .expose_global(
                "stop",
                Value::function("stop", move |_| {
                    handle.terminate_with("stopped");
                    Ok(Value::Undefined)
                }),
            )
            .unwrap();

        let err = context
            .evaluate(
                "const big = new Array(5000).fill(0);\n\
                 Object.defineProperty(big, 10, { get() { stop(); return 0; } });\n\
                 Object.defineProperty(big, 4000, { get() { globalThis.reached = true; return 0; } });\n\
                 big",
            )
            .unwrap_err();
        match err {
            Error::Fatal { reason } => assert_eq!(reason, "stopped"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(context.evaluate("typeof reached").unwrap(), Value::from("undefined"));
    }
}
