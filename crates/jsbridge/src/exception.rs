//! Exception Bridge
//!
//! Guest -> host: a pending guest exception is caught, described and
//! converted into [`Error::Thrown`], or recognized as one of our own host
//! errors coming back, or as engine termination.
//!
//! Host -> guest: an [`Error`] returned by a host callback is thrown into
//! the guest as an error object of the mapped class. The object is tagged
//! with the index of the original error so the round trip is lossless.

use std::cell::Cell;
use std::rc::Rc;

use rquickjs::{qjs, Ctx, Exception, Object, Value as JsValue};
use tracing::{debug, warn};

use crate::context::ContextInner;
use crate::convert::Converter;
use crate::debug::DebugEvent;
use crate::error::{Error, ErrorKind, GuestException, Result};
use crate::value::Value;
use crate::wrapper::JsObject;

/// Depth limit for building nested guest error causes.
const MAX_CAUSE_DEPTH: usize = 8;

/// Exceptions raised while describing an exception nest at most this deep.
const MAX_DESCRIBE_NESTING: usize = 4;

thread_local! {
    static DESCRIBING: Cell<usize> = const { Cell::new(0) };
}

// ─────────────────────────────────────────────────────────────────────────────
// Guest -> host
// ─────────────────────────────────────────────────────────────────────────────

/// Turn an engine error into a bridge error, consuming any pending guest
/// exception.
pub(crate) fn capture(ctx: &Ctx<'_>, context: &Rc<ContextInner>, err: rquickjs::Error) -> Error {
    match err {
        rquickjs::Error::Exception => {
            let thrown = ctx.catch();
            if is_uncatchable(ctx, &thrown) {
                warn!(target: "jsbridge::exception", "uncatchable guest error reached the host");
                return Error::fatal("execution terminated");
            }
            from_thrown(ctx, context, thrown)
        }
        rquickjs::Error::Allocation => Error::fatal("out of memory"),
        rquickjs::Error::FromJs { from, to, message } => Error::conversion(
            format!("{from} to {to}"),
            message.unwrap_or_else(|| "conversion failed".to_string()),
        ),
        other => Error::conversion("engine", other.to_string()),
    }
}

/// Convert a thrown guest value into a bridge error.
pub(crate) fn from_thrown<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    thrown: JsValue<'js>,
) -> Error {
    // Once termination is flagged every guest call is interrupted, so no
    // helper may run from here on.
    if context.isolate.interrupt.is_terminating() {
        return Error::fatal("execution terminated");
    }

    let nesting = DESCRIBING.with(|depth| {
        depth.set(depth.get() + 1);
        depth.get()
    });
    let error = if nesting > MAX_DESCRIBE_NESTING {
        Error::conversion("exception", "failed while describing a guest exception")
    } else {
        describe(ctx, context, thrown, 0).unwrap_or_else(|err| err)
    };
    DESCRIBING.with(|depth| depth.set(depth.get() - 1));

    match &error {
        Error::Thrown(exception) => {
            debug!(target: "jsbridge::exception", error = %exception, "guest exception");
            context
                .debug
                .notify(&context.isolate.interrupt, &DebugEvent::Exception { exception });
        }
        Error::Fatal { reason } => {
            warn!(target: "jsbridge::exception", reason = %reason, "guest execution terminated");
        }
        other => {
            debug!(target: "jsbridge::exception", error = %other, "host error returned from guest");
        }
    }
    error
}

fn describe<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    thrown: JsValue<'js>,
    depth: usize,
) -> Result<Error> {
    let helpers = context.helpers(ctx)?;
    let info: Object = helpers.call(ctx, context, "describeError", (thrown.clone(),))?;
    let read = |err: rquickjs::Error| capture(ctx, context, err);

    let name: Option<String> = info.get("name").map_err(read)?;
    let message: String = info.get("message").map_err(read)?;
    let stack: Option<String> = info.get("stack").map_err(read)?;

    let tag: Option<u32> = helpers.call(ctx, context, "errorTag", (thrown.clone(),))?;
    if let Some(tag) = tag {
        if let Some(source) = context.bridge(|bridge| bridge.host_errors.get(&tag).cloned())? {
            return Ok(Error::HostRaisedInGuestCallback {
                source: Box::new(source),
                guest_stack: stack,
            });
        }
    }

    let has_cause: bool = info.get("hasCause").map_err(read)?;
    let cause = if has_cause && depth == 0 {
        let cause: JsValue = info.get("cause").map_err(read)?;
        let cause = describe(ctx, context, cause, depth + 1).unwrap_or_else(|err| err);
        Some(Box::new(cause))
    } else {
        None
    };

    let identity = if thrown.is_object() {
        Some(JsObject::from_guest(ctx, context, thrown.clone())?)
    } else {
        None
    };
    let payload = match Converter::new(ctx, context).to_host(thrown) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(target: "jsbridge::exception", error = %err, "thrown value not convertible; using its message");
            Value::String(message.clone())
        }
    };

    Ok(Error::Thrown(GuestException {
        payload,
        name,
        message,
        stack,
        cause,
        thrown: identity,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Host -> guest
// ─────────────────────────────────────────────────────────────────────────────

/// Throw a host-side error into the guest. Returns the engine error the
/// trap function must return.
pub(crate) fn throw_into_guest<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    err: Error,
) -> rquickjs::Error {
    match err {
        Error::Fatal { reason } => {
            warn!(target: "jsbridge::exception", reason = %reason, "host callback requested termination");
            context.isolate.interrupt.terminate_with(reason.clone());
            throw_uncatchable(ctx, &format!("terminated: {reason}"))
        }
        _ if context.isolate.interrupt.is_terminating() => throw_uncatchable(ctx, "terminated"),
        Error::Thrown(exception) => {
            let original = match &exception.thrown {
                Some(thrown) => Converter::new(ctx, context).to_guest(&Value::Js(thrown.clone())),
                None => Converter::new(ctx, context).to_guest(&exception.payload),
            };
            match original {
                Ok(payload) => ctx.throw(payload),
                Err(conversion) => {
                    debug!(target: "jsbridge::exception", error = %conversion, "rethrowing guest exception as a new error");
                    throw_host_error(ctx, context, Error::Thrown(exception))
                }
            }
        }
        Error::HostRaisedInGuestCallback { source, .. } => throw_host_error(ctx, context, *source),
        other => throw_host_error(ctx, context, other),
    }
}

/// Throw an error that guest `catch` and `finally` blocks cannot intercept.
/// QuickJS unwinds it straight to the outermost host call, the same way it
/// unwinds its own interrupt.
fn throw_uncatchable(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    match Exception::from_message(ctx.clone(), message) {
        Ok(error) => {
            let error = error.into_object().into_value();
            // SAFETY: `error` is a live error object owned by this context and
            // the flag only marks it; ownership passes to `throw` below.
            unsafe { qjs::JS_SetUncatchableError(ctx.as_raw().as_ptr(), error.as_raw()) };
            ctx.throw(error)
        }
        // Out of memory. Whatever is pending unwinds and the outermost call
        // reports the termination.
        Err(err) => err,
    }
}

fn is_uncatchable(ctx: &Ctx<'_>, thrown: &JsValue<'_>) -> bool {
    // SAFETY: read-only check of an object flag on a value this context owns.
    thrown.is_object() && unsafe { qjs::JS_IsUncatchableError(ctx.as_raw().as_ptr(), thrown.as_raw()) }
}

fn throw_host_error<'js>(ctx: &Ctx<'js>, context: &Rc<ContextInner>, err: Error) -> rquickjs::Error {
    debug!(target: "jsbridge::exception", error = %err, "throwing host error into guest");
    let message = err.to_string();
    match make_guest_error(ctx, context, err, 0) {
        Ok(error) => ctx.throw(error),
        Err(_) => Exception::throw_message(ctx, &message),
    }
}

/// Build a tagged guest error object for a host error.
fn make_guest_error<'js>(
    ctx: &Ctx<'js>,
    context: &Rc<ContextInner>,
    err: Error,
    depth: usize,
) -> Result<JsValue<'js>> {
    let (kind, message, cause) = match &err {
        Error::Host(host) => (host.kind, host.message.clone(), host.cause.clone()),
        Error::Conversion { .. } => (ErrorKind::TypeError, err.to_string(), None),
        Error::InvalidatedHandle => (ErrorKind::ReferenceError, err.to_string(), None),
        Error::Compile { message, .. } => (ErrorKind::SyntaxError, message.clone(), None),
        Error::Thrown(exception) => (
            ErrorKind::from_class_name(exception.name.as_deref().unwrap_or_default()),
            exception.message.clone(),
            None,
        ),
        _ => (ErrorKind::Error, err.to_string(), None),
    };

    let cause = match cause {
        Some(cause) if depth < MAX_CAUSE_DEPTH => Some(match *cause {
            Error::Thrown(exception) => Converter::new(ctx, context).to_guest(&exception.payload)?,
            other => make_guest_error(ctx, context, other, depth + 1)?,
        }),
        _ => None,
    };

    let tag = context.bridge(|bridge| bridge.add_host_error(err))?;

    let has_cause = cause.is_some();
    let cause = cause.unwrap_or_else(|| JsValue::new_undefined(ctx.clone()));
    context.helpers(ctx)?.call(
        ctx,
        context,
        "makeError",
        (kind.class_name(), message, tag, has_cause, cause),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::engine::Engine;
    use crate::error::HostError;

    fn context() -> (Engine, Context) {
        let engine = Engine::new().unwrap();
        let context = Context::new(&engine).unwrap();
        (engine, context)
    }

    #[test]
    fn test_guest_error_fields() {
        let (_engine, context) = context();
        let err = context
            .evaluate("function fail() { throw new RangeError('too far'); }\nfail();")
            .unwrap_err();
        let exception = err.guest_exception().unwrap();
        assert_eq!(exception.name.as_deref(), Some("RangeError"));
        assert_eq!(exception.message, "too far");
        assert!(matches!(exception.payload, Value::Js(_)));
        let frames = exception.frames();
        assert!(frames.iter().any(|frame| frame.function == "fail"));
        assert_eq!(err.to_string(), "Uncaught RangeError: too far");
    }

    #[test]
    fn test_thrown_primitive() {
        let (_engine, context) = context();
        let err = context.evaluate("throw 'boom'").unwrap_err();
        let exception = err.guest_exception().unwrap();
        assert_eq!(exception.payload, Value::from("boom"));
        assert_eq!(exception.message, "boom");
        assert_eq!(exception.name, None);

        let err = context.evaluate("throw {code: 7}").unwrap_err();
        let payload = &err.guest_exception().unwrap().payload;
        assert_eq!(payload.as_map().unwrap().get("code"), Some(Value::Int(7)));
    }

    #[test]
    fn test_guest_cause_chain() {
        let (_engine, context) = context();
        let err = context
            .evaluate("throw new Error('outer', { cause: new TypeError('inner') })")
            .unwrap_err();
        let exception = err.guest_exception().unwrap();
        let cause = exception.cause.as_deref().unwrap();
        let cause = cause.guest_exception().unwrap();
        assert_eq!(cause.name.as_deref(), Some("TypeError"));
        assert_eq!(cause.message, "inner");
    }

    #[test]
    fn test_host_error_becomes_guest_error() {
        let (_engine, context) = context();
        context
            .expose_global(
                "fail",
                Value::function("fail", |_| Err(Error::range_error("out of range"))),
            )
            .unwrap();

        let caught = context
            .evaluate("try { fail(); 'no' } catch (e) { [e instanceof RangeError, e.message] }")
            .unwrap();
        assert_eq!(
            caught,
            Value::from(vec![Value::Bool(true), Value::from("out of range")])
        );

        let err = context.evaluate("fail()").unwrap_err();
        match err {
            Error::HostRaisedInGuestCallback { source, guest_stack } => {
                assert!(matches!(*source, Error::Host(HostError { kind: ErrorKind::RangeError, .. })));
                assert!(guest_stack.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_caught_host_error_maps_back() {
        let (_engine, context) = context();
        context
            .expose_global(
                "fail",
                Value::function("fail", |_| Err(Error::type_error("bad input"))),
            )
            .unwrap();

        let caught = context.evaluate("try { fail() } catch (e) { e }").unwrap();
        let host = caught.as_js().unwrap().host_error().unwrap().unwrap();
        assert_eq!(host.to_string(), "TypeError: bad input");
    }

    #[test]
    fn test_host_error_cause_reaches_guest() {
        let (_engine, context) = context();
        context
            .expose_global(
                "fail",
                Value::function("fail", |_| {
                    let inner = HostError::new(ErrorKind::TypeError, "inner");
                    Err(HostError::new(ErrorKind::Error, "outer")
                        .with_cause(inner.into())
                        .into())
                }),
            )
            .unwrap();
        let cause = context
            .evaluate("try { fail() } catch (e) { e.cause.name + ': ' + e.cause.message }")
            .unwrap();
        assert_eq!(cause, Value::from("TypeError: inner"));
    }

    #[test]
    fn test_thrown_passes_through_host_unchanged() {
        let (_engine, context) = context();
        context
            .expose_global(
                "relay",
                Value::function("relay", |args| match args.first().and_then(Value::as_js) {
                    Some(callback) => callback.call(&[]),
                    None => Ok(Value::Undefined),
                }),
            )
            .unwrap();

        let same = context
            .evaluate("const token = { id: 1 }; try { relay(() => { throw token; }) } catch (e) { e === token }")
            .unwrap();
        assert_eq!(same, Value::Bool(true));
    }

    #[test]
    fn test_conversion_error_is_type_error_in_guest() {
        let (_engine, context) = context();
        context
            .expose_global("huge", Value::function("huge", |_| Ok(Value::Int(i64::MAX))))
            .unwrap();
        let name = context
            .evaluate("try { huge() } catch (e) { e.name }")
            .unwrap();
        assert_eq!(name, Value::from("TypeError"));
    }

    #[test]
    fn test_engine_named_errors_thrown_by_guest_stay_catchable() {
        let (_engine, context) = context();
        let err = context
            .evaluate("throw new InternalError('out of memory')")
            .unwrap_err();
        assert!(!err.is_fatal(), "{err:?}");
        let exception = err.guest_exception().unwrap();
        assert_eq!(exception.name.as_deref(), Some("InternalError"));
        assert_eq!(exception.message, "out of memory");

        let err = context
            .evaluate("throw { name: 'InternalError', message: 'interrupted' }")
            .unwrap_err();
        let payload = &err.guest_exception().unwrap().payload;
        assert_eq!(payload.as_map().unwrap().get("message"), Some(Value::from("interrupted")));

        let caught = context
            .evaluate("try { throw new InternalError('interrupted') } catch (e) { e.message }")
            .unwrap();
        assert_eq!(caught, Value::from("interrupted"));
    }
}
