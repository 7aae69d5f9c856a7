//! Host Value Model
//!
//! The host-side representation of everything that can cross the bridge.
//! Sequences and mappings are shared and mutable so that cyclic data
//! survives conversion; callables and objects are held by reference.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::wrapper::JsObject;

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// A host value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(DateTime<Utc>),
    List(List),
    Map(Map),
    Function(HostFunction),
    Object(HostObject),
    /// A guest object held by reference
    Js(JsObject),
}

impl Value {
    /// Name of the runtime kind, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Function(_) => "function",
            Self::Object(_) => "object",
            Self::Js(_) => "guest object",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as integer. Integral floats are accepted.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_js(&self) -> Option<&JsObject> {
        match self {
            Self::Js(object) => Some(object),
            _ => None,
        }
    }

    /// Wrap a host class instance.
    pub fn object(class: impl HostClass + 'static) -> Self {
        Self::Object(HostObject::new(class))
    }

    /// Wrap a host closure as a callable value.
    pub fn function(
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value> + 'static,
    ) -> Self {
        Self::Function(HostFunction::new(name, f))
    }

    /// Convert plain data to JSON. Callables, guest objects and cycles are
    /// rejected.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        to_json_inner(self, &mut HashSet::new())
    }

    /// Build a value from JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(List::from(items.iter().map(Self::from_json).collect::<Vec<_>>()))
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn to_json_inner(value: &Value, seen: &mut HashSet<usize>) -> Result<serde_json::Value> {
    let json = match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Date(d) => serde_json::Value::String(d.to_rfc3339()),
        Value::List(list) => {
            if !seen.insert(list.identity()) {
                return Err(Error::conversion("list", "cyclic data cannot be written as JSON"));
            }
            let items = list
                .to_vec()
                .iter()
                .map(|item| to_json_inner(item, seen))
                .collect::<Result<Vec<_>>>()?;
            seen.remove(&list.identity());
            serde_json::Value::Array(items)
        }
        Value::Map(map) => {
            if !seen.insert(map.identity()) {
                return Err(Error::conversion("map", "cyclic data cannot be written as JSON"));
            }
            let mut out = serde_json::Map::new();
            for (key, item) in map.entries() {
                out.insert(key, to_json_inner(&item, seen)?);
            }
            seen.remove(&map.identity());
            serde_json::Value::Object(out)
        }
        other => {
            return Err(Error::conversion(
                other.kind(),
                "value has no JSON representation",
            ));
        }
    };
    Ok(json)
}

// ─────────────────────────────────────────────────────────────────────────────
// Equality
// ─────────────────────────────────────────────────────────────────────────────

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other, &mut HashSet::new())
    }
}

/// Structural equality that terminates on cyclic lists and maps. A pair of
/// containers already under comparison is assumed equal.
fn values_equal(a: &Value, b: &Value, visiting: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if x.ptr_eq(y) || !visiting.insert((x.identity(), y.identity())) {
                return true;
            }
            let (xs, ys) = (x.to_vec(), y.to_vec());
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys.iter())
                    .all(|(p, q)| values_equal(p, q, visiting))
        }
        (Value::Map(x), Value::Map(y)) => {
            if x.ptr_eq(y) || !visiting.insert((x.identity(), y.identity())) {
                return true;
            }
            let (xs, ys) = (x.entries(), y.entries());
            xs.len() == ys.len()
                && xs.iter().all(|(key, p)| {
                    ys.iter()
                        .find(|(k, _)| k == key)
                        .is_some_and(|(_, q)| values_equal(p, q, visiting))
                })
        }
        (Value::Function(x), Value::Function(y)) => x.ptr_eq(y),
        (Value::Object(x), Value::Object(y)) => x.ptr_eq(y),
        (Value::Js(x), Value::Js(y)) => x.ptr_eq(y),
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display
// ─────────────────────────────────────────────────────────────────────────────

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_inner(self, f, &mut HashSet::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            other => display_inner(other, f, &mut HashSet::new()),
        }
    }
}

fn display_inner(
    value: &Value,
    f: &mut fmt::Formatter<'_>,
    seen: &mut HashSet<usize>,
) -> fmt::Result {
    match value {
        Value::Undefined => f.write_str("undefined"),
        Value::Null => f.write_str("null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Int(i) => write!(f, "{i}"),
        Value::Float(x) => write!(f, "{x}"),
        Value::String(s) => f.write_str(s),
        Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
        Value::List(list) => {
            if !seen.insert(list.identity()) {
                return f.write_str("[...]");
            }
            f.write_str("[")?;
            for (i, item) in list.to_vec().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                display_inner(item, f, seen)?;
            }
            seen.remove(&list.identity());
            f.write_str("]")
        }
        Value::Map(map) => {
            if !seen.insert(map.identity()) {
                return f.write_str("{...}");
            }
            f.write_str("{")?;
            for (i, (key, item)) in map.entries().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}: ")?;
                display_inner(item, f, seen)?;
            }
            seen.remove(&map.identity());
            f.write_str("}")
        }
        Value::Function(func) => write!(f, "[function {}]", func.name()),
        Value::Object(object) => write!(f, "[object {}]", object.class_name()),
        Value::Js(object) => write!(f, "{object:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────────────────

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Undefined
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(List::from(items))
    }
}

impl From<List> for Value {
    fn from(list: List) -> Self {
        Self::List(list)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Self::Map(map)
    }
}

impl From<HostFunction> for Value {
    fn from(func: HostFunction) -> Self {
        Self::Function(func)
    }
}

impl From<HostObject> for Value {
    fn from(object: HostObject) -> Self {
        Self::Object(object)
    }
}

impl From<JsObject> for Value {
    fn from(object: JsObject) -> Self {
        Self::Js(object)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared containers
// ─────────────────────────────────────────────────────────────────────────────

/// Shared, mutable sequence. Clones alias the same storage.
#[derive(Clone, Default)]
pub struct List(Rc<RefCell<Vec<Value>>>);

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.0.borrow_mut().push(value.into());
    }

    /// Set an element, padding with `Undefined` when past the end.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        let mut items = self.0.borrow_mut();
        if index >= items.len() {
            items.resize(index + 1, Value::Undefined);
        }
        items[index] = value.into();
    }

    /// Snapshot of the current elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl From<Vec<Value>> for List {
    fn from(items: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }
}

impl FromIterator<Value> for List {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

/// Shared, mutable, insertion-ordered mapping. Clones alias the same storage.
#[derive(Clone, Default)]
pub struct Map(Rc<RefCell<IndexMap<String, Value>>>);

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.borrow_mut().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.borrow_mut().shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    /// Snapshot of the current entries in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Map {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<IndexMap<_, _>>();
        Self(Rc::new(RefCell::new(entries)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host callables and objects
// ─────────────────────────────────────────────────────────────────────────────

type HostFn = dyn Fn(&[Value]) -> Result<Value>;

struct HostFunctionInner {
    name: String,
    f: Box<HostFn>,
}

/// A host function callable from guest code
#[derive(Clone)]
pub struct HostFunction(Rc<HostFunctionInner>);

impl HostFunction {
    pub fn new(name: impl Into<String>, f: impl Fn(&[Value]) -> Result<Value> + 'static) -> Self {
        Self(Rc::new(HostFunctionInner {
            name: name.into(),
            f: Box::new(f),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.0.f)(args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

/// Attribute-level access to a host object from guest code.
///
/// Only `get` is required. Everything else defaults to a read-only,
/// non-enumerable, non-callable object.
pub trait HostClass {
    /// Name reported through `Object.prototype.toString`.
    fn class_name(&self) -> &str {
        "HostObject"
    }

    /// Read an attribute. `None` means the attribute does not exist.
    fn get(&self, name: &str) -> Result<Option<Value>>;

    fn set(&self, name: &str, _value: Value) -> Result<()> {
        Err(Error::type_error(format!(
            "cannot set attribute '{name}' on {}",
            self.class_name()
        )))
    }

    fn has(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_some())
    }

    fn delete(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    /// Externally visible attribute names, in a stable order.
    fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn is_callable(&self) -> bool {
        false
    }

    fn call(&self, _args: &[Value]) -> Result<Value> {
        Err(Error::type_error(format!(
            "{} is not callable",
            self.class_name()
        )))
    }
}

/// A shared host object
#[derive(Clone)]
pub struct HostObject(Rc<dyn HostClass>);

impl HostObject {
    pub fn new(class: impl HostClass + 'static) -> Self {
        Self(Rc::new(class))
    }

    pub fn from_rc(class: Rc<dyn HostClass>) -> Self {
        Self(class)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl std::ops::Deref for HostObject {
    type Target = dyn HostClass;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// A plain attribute bag usable as a host object.
///
/// Attributes keep insertion order, which is the enumeration order seen by
/// the guest.
pub struct Record {
    class: String,
    fields: RefCell<IndexMap<String, Value>>,
    frozen: bool,
}

impl Record {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: RefCell::new(IndexMap::new()),
            frozen: false,
        }
    }

    /// Builder-style attribute insertion.
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.borrow_mut().insert(name.into(), value.into());
        self
    }

    /// Builder-style method insertion.
    pub fn method(
        self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value> + 'static,
    ) -> Self {
        let name = name.into();
        let func = HostFunction::new(name.clone(), f);
        self.with(name, func)
    }

    /// Reject guest writes and deletes.
    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.borrow_mut().insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.borrow().get(name).cloned()
    }
}

impl HostClass for Record {
    fn class_name(&self) -> &str {
        &self.class
    }

    fn get(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.field(name))
    }

    fn set(&self, name: &str, value: Value) -> Result<()> {
        if self.frozen {
            return Err(Error::type_error(format!(
                "cannot assign to read only attribute '{name}' of {}",
                self.class
            )));
        }
        self.insert(name, value);
        Ok(())
    }

    fn has(&self, name: &str) -> Result<bool> {
        Ok(self.fields.borrow().contains_key(name))
    }

    fn delete(&self, name: &str) -> Result<bool> {
        if self.frozen {
            return Ok(false);
        }
        Ok(self.fields.borrow_mut().shift_remove(name).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.fields.borrow().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality() {
        assert_eq!(Value::Int(5), Value::Float(5.0));
        assert_ne!(Value::Int(5), Value::Float(5.5));
        assert_ne!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Null, Value::Undefined);
    }

    #[test]
    fn test_list_aliasing() {
        let list = List::new();
        let alias = list.clone();
        alias.push(1);
        assert_eq!(list.len(), 1);
        assert!(list.ptr_eq(&alias));

        list.set(3, "x");
        assert_eq!(list.get(2), Some(Value::Undefined));
        assert_eq!(alias.get(3), Some(Value::from("x")));
    }

    #[test]
    fn test_cyclic_equality_terminates() {
        let a = List::new();
        a.push(a.clone());
        let b = List::new();
        b.push(b.clone());

        assert_eq!(Value::List(a.clone()), Value::List(b));
        assert_eq!(Value::List(a.clone()), Value::List(a));
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let x: Map = [("a", Value::from(1)), ("b", Value::from(2))].into_iter().collect();
        let y: Map = [("b", Value::from(2)), ("a", Value::from(1))].into_iter().collect();
        assert_eq!(Value::Map(x), Value::Map(y));
    }

    #[test]
    fn test_function_identity() {
        let f = HostFunction::new("f", |_| Ok(Value::Null));
        let g = HostFunction::new("f", |_| Ok(Value::Null));
        assert_eq!(Value::Function(f.clone()), Value::Function(f.clone()));
        assert_ne!(Value::Function(f), Value::Function(g));
    }

    #[test]
    fn test_display_cycle() {
        let list = List::new();
        list.push(1);
        list.push(list.clone());
        assert_eq!(Value::List(list).to_string(), "[1, [...]]");
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({"x": 1, "y": [1, 2.5, "three"], "z": null});
        let value = Value::from_json(&json);
        assert_eq!(value.as_map().and_then(|m| m.get("x")), Some(Value::Int(1)));
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn test_json_rejects_cycles_and_callables() {
        let list = List::new();
        list.push(list.clone());
        assert!(matches!(
            Value::List(list).to_json(),
            Err(Error::Conversion { .. })
        ));
        assert!(Value::function("f", |_| Ok(Value::Null)).to_json().is_err());
    }

    #[test]
    fn test_record() {
        let record = Record::new("Point").with("x", 1).with("y", 2);
        assert_eq!(record.keys().unwrap(), vec!["x", "y"]);
        record.set("x", Value::from(10)).unwrap();
        assert_eq!(record.get("x").unwrap(), Some(Value::Int(10)));
        assert!(record.delete("y").unwrap());
        assert!(!record.has("y").unwrap());

        let frozen = Record::new("Config").with("debug", true).frozen();
        assert!(frozen.set("debug", Value::from(false)).is_err());
        assert!(!frozen.delete("debug").unwrap());
    }

    #[test]
    fn test_host_object_identity() {
        let object = HostObject::new(Record::new("A"));
        let same = object.clone();
        let other = HostObject::new(Record::new("A"));
        assert!(object.ptr_eq(&same));
        assert!(!object.ptr_eq(&other));
        assert_eq!(object.class_name(), "A");
    }
}
