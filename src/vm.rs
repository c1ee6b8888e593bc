// ABOUTME: The call-engine seam between the compiler and the external VM

use crate::error::EvalError;
use crate::value::Value;
use std::rc::Rc;

/// Diagnostic handle for a failed or suspended execution context. The real
/// scheduler lives in the VM; the compiler only threads this through to the
/// caller when a macro expansion goes wrong.
#[derive(Debug, Clone)]
pub struct Fiber {
    /// The signal payload the callee ended with (usually the error value).
    pub payload: Value,
}

/// A non-ok outcome of calling into the engine.
#[derive(Debug, Clone)]
pub struct CallFailure {
    pub value: Value,
    pub fiber: Option<Rc<Fiber>>,
}

/// The compiler's view of the VM: hand it a callable and arguments, get a
/// value or a failure back. A suspended callee counts as a failure; the
/// compiler never resumes.
pub trait CallEngine {
    fn call(&mut self, fun: &Value, args: &[Value]) -> Result<Value, CallFailure>;
}

/// An engine that can run native functions and nothing else. Enough to
/// exercise the front-end (native-backed macros, tests, the CLI) without a
/// bytecode interpreter; a real VM implements `CallEngine` instead.
#[derive(Debug, Default)]
pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> NativeEngine {
        NativeEngine
    }
}

impl CallEngine for NativeEngine {
    fn call(&mut self, fun: &Value, args: &[Value]) -> Result<Value, CallFailure> {
        match fun {
            Value::Native(native) => (native.fun)(args).map_err(|e| failure(&e)),
            Value::Function(_) => Err(CallFailure {
                value: Value::str_from(b"cannot run a bytecode function without a virtual machine"),
                fiber: None,
            }),
            other => Err(failure(&EvalError::type_error(
                "call", "callable", other, 0,
            ))),
        }
    }
}

fn failure(err: &EvalError) -> CallFailure {
    let value = Value::str_from(format!("{}", err).as_bytes());
    CallFailure {
        fiber: Some(Rc::new(Fiber {
            payload: value.clone(),
        })),
        value,
    }
}
