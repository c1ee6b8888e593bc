// ABOUTME: Global environment: top-level bindings and the core native functions

use crate::error::{EvalError, ARITY_AT_LEAST_ONE, ARITY_ONE, ARITY_TWO};
use crate::symbols::Symbol;
use crate::value::{ArrayRef, NativeFn, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Def,
    Var,
    Macro,
}

/// A top-level binding. Every binding owns a one-element cell array: the
/// compiled thunk stores into it with `put-index`, and resolution reads the
/// current contents. For `var` bindings the cell itself is the runtime
/// location; for `def` and `macro` it just carries the installed value.
#[derive(Debug, Clone)]
pub struct Binding {
    pub kind: BindingKind,
    pub cell: ArrayRef,
}

/// What a symbol means at top level, from the compiler's point of view.
#[derive(Debug, Clone)]
pub enum Resolution {
    None,
    Def(Value),
    Var(ArrayRef),
    Macro(Value),
}

#[derive(Debug, Default)]
pub struct Environment {
    bindings: HashMap<Symbol, Binding>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    /// An environment with the core natives installed.
    pub fn core() -> Environment {
        let mut env = Environment::new();
        register_core(&mut env);
        env
    }

    /// Install an immutable binding with a known value (host API).
    pub fn def(&mut self, name: &str, value: Value) {
        let cell = new_cell(value);
        self.bindings
            .insert(Symbol::intern(name), Binding { kind: BindingKind::Def, cell });
    }

    /// Install a mutable binding (host API).
    pub fn var(&mut self, name: &str, value: Value) {
        let cell = new_cell(value);
        self.bindings
            .insert(Symbol::intern(name), Binding { kind: BindingKind::Var, cell });
    }

    /// Install a macro binding. The value must be something the call engine
    /// can invoke during expansion.
    pub fn def_macro(&mut self, name: &str, value: Value) {
        let cell = new_cell(value);
        self.bindings
            .insert(Symbol::intern(name), Binding { kind: BindingKind::Macro, cell });
    }

    /// Create the binding entry for a top-level `def`/`var` being compiled.
    /// The cell starts nil; running the thunk fills it. Redeclaration gets a
    /// fresh cell so stale closures keep the old location.
    pub fn declare(&mut self, sym: &Symbol, kind: BindingKind) -> ArrayRef {
        let cell = new_cell(Value::Nil);
        self.bindings
            .insert(sym.clone(), Binding { kind, cell: cell.clone() });
        cell
    }

    pub fn resolve(&self, sym: &Symbol) -> Resolution {
        match self.bindings.get(sym) {
            None => Resolution::None,
            Some(binding) => {
                let current = binding.cell.borrow()[0].clone();
                match binding.kind {
                    BindingKind::Def => Resolution::Def(current),
                    BindingKind::Macro => Resolution::Macro(current),
                    BindingKind::Var => Resolution::Var(binding.cell.clone()),
                }
            }
        }
    }

    pub fn get_binding(&self, sym: &Symbol) -> Option<&Binding> {
        self.bindings.get(sym)
    }

    pub fn names(&self) -> impl Iterator<Item = &Symbol> {
        self.bindings.keys()
    }
}

fn new_cell(value: Value) -> ArrayRef {
    Rc::new(RefCell::new(vec![value]))
}

// ============================================================================
// Core natives
// ============================================================================
//
// Declares a native function together with its registration helper. The
// registration identifier is derived with paste, so register_core below is
// just a list of names.

macro_rules! define_native {
    { $fn_ident:ident, name: $lisp_name:literal, $doc:literal, $impl:expr } => {
        #[doc = $doc]
        pub fn $fn_ident(args: &[Value]) -> Result<Value, EvalError> {
            ($impl)(args)
        }

        paste::paste! {
            fn [<register_ $fn_ident>](env: &mut Environment) {
                env.def(
                    $lisp_name,
                    Value::native(NativeFn {
                        name: $lisp_name,
                        fun: $fn_ident,
                    }),
                );
            }
        }
    };
}

/// Numbers as the arithmetic natives see them: integer results stay
/// integers until a real shows up or 32 bits overflow.
#[derive(Clone, Copy)]
enum Num {
    Int(i32),
    Real(f64),
}

impl Num {
    fn as_real(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Real(r) => r,
        }
    }
}

fn as_num(function: &str, value: &Value, position: usize) -> Result<Num, EvalError> {
    match value {
        Value::Integer(i) => Ok(Num::Int(*i)),
        Value::Real(r) => Ok(Num::Real(*r)),
        other => Err(EvalError::type_error(function, "number", other, position)),
    }
}

fn num_value(n: Num) -> Value {
    match n {
        Num::Int(i) => Value::Integer(i),
        Num::Real(r) => Value::Real(r),
    }
}

fn num_binop(a: Num, b: Num, int_op: fn(i32, i32) -> Option<i32>, real_op: fn(f64, f64) -> f64) -> Num {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => match int_op(x, y) {
            Some(i) => Num::Int(i),
            None => Num::Real(real_op(x as f64, y as f64)),
        },
        _ => Num::Real(real_op(a.as_real(), b.as_real())),
    }
}

fn fold_arithmetic(
    function: &str,
    args: &[Value],
    unit: Num,
    int_op: fn(i32, i32) -> Option<i32>,
    real_op: fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    let mut acc = unit;
    for (i, arg) in args.iter().enumerate() {
        acc = num_binop(acc, as_num(function, arg, i)?, int_op, real_op);
    }
    Ok(num_value(acc))
}

fn compare_numbers(function: &str, args: &[Value]) -> Result<std::cmp::Ordering, EvalError> {
    if args.len() != 2 {
        return Err(EvalError::arity_error(function, ARITY_TWO, args.len()));
    }
    let a = as_num(function, &args[0], 1)?.as_real();
    let b = as_num(function, &args[1], 2)?.as_real();
    a.partial_cmp(&b)
        .ok_or_else(|| EvalError::runtime_error(function, "cannot order nan"))
}

define_native! {
    native_add,
    name: "+",
    "Sum of the arguments; integer until a real or an overflow appears.",
    |args: &[Value]| fold_arithmetic("+", args, Num::Int(0), i32::checked_add, |a, b| a + b)
}

define_native! {
    native_sub,
    name: "-",
    "Subtract the rest from the first argument; one argument negates.",
    |args: &[Value]| {
        match args {
            [] => Err(EvalError::arity_error("-", ARITY_AT_LEAST_ONE, 0)),
            [only] => Ok(num_value(num_binop(
                Num::Int(0),
                as_num("-", only, 1)?,
                i32::checked_sub,
                |a, b| a - b,
            ))),
            [first, rest @ ..] => {
                let mut acc = as_num("-", first, 1)?;
                for (i, arg) in rest.iter().enumerate() {
                    acc = num_binop(acc, as_num("-", arg, i + 2)?, i32::checked_sub, |a, b| a - b);
                }
                Ok(num_value(acc))
            }
        }
    }
}

define_native! {
    native_mul,
    name: "*",
    "Product of the arguments.",
    |args: &[Value]| fold_arithmetic("*", args, Num::Int(1), i32::checked_mul, |a, b| a * b)
}

define_native! {
    native_div,
    name: "/",
    "Divide the first argument by the rest; integer division stays integral.",
    |args: &[Value]| {
        match args {
            [] => Err(EvalError::arity_error("/", ARITY_AT_LEAST_ONE, 0)),
            [only] => {
                let d = as_num("/", only, 1)?.as_real();
                if d == 0.0 {
                    return Err(EvalError::runtime_error("/", "division by zero"));
                }
                Ok(Value::Real(1.0 / d))
            }
            [first, rest @ ..] => {
                let mut acc = as_num("/", first, 1)?;
                for (i, arg) in rest.iter().enumerate() {
                    let divisor = as_num("/", arg, i + 2)?;
                    if divisor.as_real() == 0.0 {
                        return Err(EvalError::runtime_error("/", "division by zero"));
                    }
                    acc = num_binop(acc, divisor, i32::checked_div, |a, b| a / b);
                }
                Ok(num_value(acc))
            }
        }
    }
}

define_native! {
    native_lt,
    name: "<",
    "Numeric less-than over two arguments.",
    |args: &[Value]| Ok(Value::Boolean(compare_numbers("<", args)?.is_lt()))
}

define_native! {
    native_gt,
    name: ">",
    "Numeric greater-than over two arguments.",
    |args: &[Value]| Ok(Value::Boolean(compare_numbers(">", args)?.is_gt()))
}

define_native! {
    native_le,
    name: "<=",
    "Numeric less-than-or-equal over two arguments.",
    |args: &[Value]| Ok(Value::Boolean(compare_numbers("<=", args)?.is_le()))
}

define_native! {
    native_ge,
    name: ">=",
    "Numeric greater-than-or-equal over two arguments.",
    |args: &[Value]| Ok(Value::Boolean(compare_numbers(">=", args)?.is_ge()))
}

define_native! {
    native_eq,
    name: "=",
    "Structural equality over two arguments.",
    |args: &[Value]| {
        if args.len() != 2 {
            return Err(EvalError::arity_error("=", ARITY_TWO, args.len()));
        }
        Ok(Value::Boolean(args[0].equals(&args[1])))
    }
}

define_native! {
    native_not,
    name: "not",
    "Logical negation: true for nil and false, false otherwise.",
    |args: &[Value]| {
        if args.len() != 1 {
            return Err(EvalError::arity_error("not", ARITY_ONE, args.len()));
        }
        Ok(Value::Boolean(!args[0].is_truthy()))
    }
}

fn register_core(env: &mut Environment) {
    register_native_add(env);
    register_native_sub(env);
    register_native_mul(env);
    register_native_div(env);
    register_native_lt(env);
    register_native_gt(env);
    register_native_le(env);
    register_native_ge(env);
    register_native_eq(env);
    register_native_not(env);
}
