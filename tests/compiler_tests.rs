// ABOUTME: Integration tests for the compiler: codegen scenarios, scope and
// capture behavior, invariants over emitted bytecode

use lisp_forge::compiler::funcdef::FuncDef;
use lisp_forge::compiler::{compile, FormOptions, FunOptimizer, Slot};
use lisp_forge::env::Environment;
use lisp_forge::error::{CompileError, EvalError};
use lisp_forge::opcodes::{opcode_of, Opcode, OperandKind};
use lisp_forge::parser::parse_all;
use lisp_forge::value::{NativeFn, Value};
use lisp_forge::vm::NativeEngine;
use std::rc::Rc;

fn compile_src(source: &str) -> Rc<FuncDef> {
    let mut env = Environment::core();
    compile_src_in(source, &mut env)
}

fn compile_src_in(source: &str, env: &mut Environment) -> Rc<FuncDef> {
    let mut values = parse_all(source).expect("parse failed");
    assert_eq!(values.len(), 1, "expected one top-level form");
    let mut engine = NativeEngine::new();
    compile(&values.remove(0), env, &mut engine, Some("test"))
        .unwrap_or_else(|e| panic!("compile failed: {}", e))
}

fn compile_err(source: &str) -> CompileError {
    let mut env = Environment::core();
    compile_err_in(source, &mut env)
}

fn compile_err_in(source: &str, env: &mut Environment) -> CompileError {
    let mut values = parse_all(source).expect("parse failed");
    let mut engine = NativeEngine::new();
    compile(&values.remove(0), env, &mut engine, Some("test"))
        .err()
        .expect("expected a compile error")
}

fn opcodes_of(def: &FuncDef) -> Vec<Opcode> {
    def.bytecode
        .iter()
        .map(|&w| opcode_of(w).expect("valid opcode"))
        .collect()
}

/// Every local-register operand in the bytecode, for the register-bound
/// invariant.
fn slot_operands(def: &FuncDef) -> Vec<u32> {
    let mut out = Vec::new();
    for &word in &def.bytecode {
        let op = opcode_of(word).expect("valid opcode");
        let a = (word >> 8) & 0xFF;
        let b = (word >> 16) & 0xFF;
        let c = (word >> 24) & 0xFF;
        let wide = (word >> 16) & 0xFFFF;
        let s = (word >> 8) & 0xFF_FFFF;
        match op.operands() {
            OperandKind::None | OperandKind::L => {}
            OperandKind::S => out.push(s),
            OperandKind::SS => {
                out.push(a);
                out.push(wide);
            }
            OperandKind::SSS => {
                out.push(a);
                out.push(b);
                out.push(c);
            }
            OperandKind::SSU | OperandKind::SSI => {
                out.push(a);
                out.push(b);
            }
            // Slot A only; B/C are immediates or foreign-frame indices.
            OperandKind::SL
            | OperandKind::SI
            | OperandKind::SU
            | OperandKind::SC
            | OperandKind::SD
            | OperandKind::SES => out.push(a),
        }
    }
    out
}

fn assert_invariants(def: &FuncDef) {
    assert_eq!(
        def.sourcemap.len(),
        def.bytecode.len(),
        "source map length must match bytecode length"
    );
    for slot in slot_operands(def) {
        assert!(
            (slot as i32) <= def.slotcount - 1,
            "operand slot {} exceeds slotcount {}",
            slot,
            def.slotcount
        );
    }
    for sub in &def.defs {
        assert_invariants(sub);
    }
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_call_with_two_constants_tail_returns() {
    let def = compile_src("(+ 1 2)");
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::Push2), "arguments push in one pair");
    assert_eq!(*ops.last().unwrap(), Opcode::Tailcall);
    assert!(def.slotcount >= 3);
    assert_eq!(def.arity, 0);
    assert_eq!(def.name.as_deref(), Some("_thunk"));
    assert_invariants(&def);
}

#[test]
fn test_constant_if_drops_dead_branch() {
    let def = compile_src("(if true :yes :no)");
    let ops = opcodes_of(&def);
    assert!(!ops.contains(&Opcode::JumpIfNot), "no test for constant condition");
    assert!(!ops.contains(&Opcode::Jump));
    assert!(ops.contains(&Opcode::LoadConstant));
    assert!(ops.contains(&Opcode::Return));
    assert!(def
        .constants
        .iter()
        .any(|c| c.equals(&Value::keyword("yes"))));
    assert!(!def
        .constants
        .iter()
        .any(|c| c.equals(&Value::keyword("no"))));
    assert_invariants(&def);
}

#[test]
fn test_dead_branch_errors_still_reported() {
    let err = compile_err("(if true 1 unbound-name)");
    assert!(err.message.contains("unknown symbol unbound-name"));
}

#[test]
fn test_nested_closures_capture_chain() {
    let def = compile_src("(fn [x] (fn [y] (+ x y)))");
    // thunk -> outer -> inner
    assert_eq!(def.defs.len(), 1);
    let outer = &def.defs[0];
    assert!(outer.needs_env(), "outer function exposes its environment");
    assert_eq!(outer.arity, 1);
    assert_eq!(outer.defs.len(), 1);
    let inner = &outer.defs[0];
    assert_eq!(inner.environments, vec![-1]);
    let has_upvalue_load = inner.bytecode.iter().any(|&w| {
        opcode_of(w) == Some(Opcode::LoadUpvalue) && (w >> 16) & 0xFF == 0
    });
    assert!(has_upvalue_load, "x resolves through capture index 0");
    assert_invariants(&def);
}

#[test]
fn test_capture_chain_through_three_functions() {
    let def = compile_src("(fn [x] (fn [] (fn [] x)))");
    let outer = &def.defs[0];
    let middle = &outer.defs[0];
    let inner = &middle.defs[0];
    assert!(outer.needs_env());
    assert_eq!(middle.environments, vec![-1]);
    assert_eq!(inner.environments, vec![0]);
    assert_invariants(&def);
}

// ---------------------------------------------------------------------------
// Special forms
// ---------------------------------------------------------------------------

#[test]
fn test_top_level_def_stores_into_binding_cell() {
    let mut env = Environment::core();
    let def = compile_src_in("(def answer 42)", &mut env);
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::PutIndex), "the cell is filled at runtime");
    // The binding is visible to a later compilation as a def; the cell is
    // still nil because nothing ran the thunk.
    let later = compile_src_in("answer", &mut env);
    assert_eq!(opcodes_of(&later), vec![Opcode::ReturnNil]);
    assert_invariants(&def);
}

#[test]
fn test_top_level_var_and_set() {
    let mut env = Environment::core();
    let def = compile_src_in("(var counter 0)", &mut env);
    assert!(opcodes_of(&def).contains(&Opcode::PutIndex));
    // set on the var dereferences and writes back through the cell
    let set_def = compile_src_in("(set counter 5)", &mut env);
    let ops = opcodes_of(&set_def);
    assert!(ops.contains(&Opcode::PutIndex));
    assert_invariants(&set_def);
}

#[test]
fn test_set_on_immutable_binding_is_an_error() {
    let mut env = Environment::core();
    compile_src_in("(def fixed 1)", &mut env);
    let err = compile_err_in("(set fixed 2)", &mut env);
    assert!(err.message.contains("cannot write to constant"));
}

#[test]
fn test_local_def_aliases_and_reads_back() {
    let def = compile_src("(do (def x 10) (+ x 1))");
    let ops = opcodes_of(&def);
    assert_eq!(*ops.last().unwrap(), Opcode::Tailcall);
    assert_invariants(&def);
}

#[test]
fn test_local_var_set_moves_value() {
    let def = compile_src("(do (var x 1) (set x 2) x)");
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::LoadInteger));
    assert!(ops.contains(&Opcode::Return));
    assert_invariants(&def);
}

#[test]
fn test_if_with_dynamic_condition_emits_jumps() {
    let mut env = Environment::core();
    env.var("flag", Value::Boolean(true));
    let def = compile_src_in("(if flag 1 2)", &mut env);
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::JumpIfNot));
    assert!(ops.contains(&Opcode::Return));
    assert_invariants(&def);
}

#[test]
fn test_while_compiles_test_body_loop() {
    let mut env = Environment::core();
    env.var("n", Value::Integer(0));
    let def = compile_src_in("(while (< n 10) (set n (+ n 1)))", &mut env);
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::JumpIfNot));
    assert!(ops.contains(&Opcode::Jump));
    // The loop produces nil
    assert_eq!(*ops.last().unwrap(), Opcode::ReturnNil);
    // The backward jump points before the condition
    let jump_at = def
        .bytecode
        .iter()
        .position(|&w| opcode_of(w) == Some(Opcode::Jump))
        .unwrap();
    let offset = ((def.bytecode[jump_at] >> 8) as i32) << 8 >> 8;
    assert!(offset < 0, "loop jump goes backward, got {}", offset);
    assert_invariants(&def);
}

#[test]
fn test_while_false_compiles_to_nothing_but_checks_body() {
    let def = compile_src("(while false 1 2 3)");
    assert_eq!(opcodes_of(&def), vec![Opcode::ReturnNil]);
    let err = compile_err("(while false missing-binding)");
    assert!(err.message.contains("unknown symbol"));
}

#[test]
fn test_break_jumps_out_of_loop() {
    let mut env = Environment::core();
    env.var("n", Value::Integer(0));
    let def = compile_src_in("(while (< n 10) (break) (set n 1))", &mut env);
    let ops = opcodes_of(&def);
    // break's forward jump plus the loop-back jump
    assert!(ops.iter().filter(|&&o| o == Opcode::Jump).count() >= 2);
    assert_invariants(&def);
}

#[test]
fn test_break_outside_loop_returns() {
    let def = compile_src("(break 7)");
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::Return));
    assert_invariants(&def);
}

#[test]
fn test_fn_arity_and_flags() {
    let def = compile_src("(fn [a b c] a)");
    let f = &def.defs[0];
    assert_eq!(f.arity, 3);
    assert!(!f.is_vararg());
    assert!(f.slotcount >= 3);

    let def = compile_src("(fn [a & rest] rest)");
    let f = &def.defs[0];
    assert_eq!(f.arity, 1);
    assert!(f.is_vararg());
}

#[test]
fn test_named_fn_loads_self() {
    let def = compile_src("(fn loop-forever [] (loop-forever))");
    let f = &def.defs[0];
    assert_eq!(f.name.as_deref(), Some("loop-forever"));
    let ops = opcodes_of(f);
    assert!(ops.contains(&Opcode::LoadSelf));
    // Self-recursion does not require an environment capture
    assert!(f.environments.is_empty());
    assert_invariants(&def);
}

#[test]
fn test_fn_body_tail_position_returns() {
    let def = compile_src("(fn [] nil)");
    let f = &def.defs[0];
    assert_eq!(opcodes_of(f), vec![Opcode::ReturnNil]);
}

#[test]
fn test_quote_produces_constant() {
    let def = compile_src("'(a b c)");
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::LoadConstant));
    assert!(def
        .constants
        .iter()
        .any(|c| matches!(c, Value::Tuple(t) if t.items.len() == 3)));
}

#[test]
fn test_quasiquote_without_unquote_is_constant() {
    let def = compile_src("~(1 2 3)");
    let ops = opcodes_of(&def);
    assert!(!ops.contains(&Opcode::MakeTuple));
    assert!(ops.contains(&Opcode::LoadConstant));
}

#[test]
fn test_quasiquote_with_unquote_builds_tuple() {
    let mut env = Environment::core();
    env.def("x", Value::Integer(9));
    let def = compile_src_in("~(1 ,x 3)", &mut env);
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::MakeTuple));
    assert_invariants(&def);
}

#[test]
fn test_quasiquote_splice_uses_push_array() {
    let mut env = Environment::core();
    env.def("xs", Value::tuple(vec![Value::Integer(1)]));
    let def = compile_src_in("~(1 ;xs 2)", &mut env);
    let ops = opcodes_of(&def);
    assert!(ops.contains(&Opcode::PushArray));
    assert!(ops.contains(&Opcode::MakeTuple));
    assert_invariants(&def);
}

#[test]
fn test_nested_quasiquote_stays_quoted() {
    let mut env = Environment::core();
    env.def("x", Value::Integer(9));
    // The inner unquote is protected by the nested quasiquote
    let def = compile_src_in("~~(1 ,x)", &mut env);
    assert!(opcodes_of(&def).contains(&Opcode::LoadConstant));
}

#[test]
fn test_unquote_and_splice_outside_quasiquote_error() {
    assert!(compile_err(",x").message.contains("cannot use unquote here"));
    assert!(compile_err(";x").message.contains("cannot use splice here"));
}

#[test]
fn test_mutable_literals_construct_at_runtime() {
    let def = compile_src("@[1 2 3]");
    assert!(opcodes_of(&def).contains(&Opcode::MakeArray));
    let def = compile_src("@{:a 1}");
    assert!(opcodes_of(&def).contains(&Opcode::MakeTable));
    let def = compile_src("{:a 1}");
    assert!(opcodes_of(&def).contains(&Opcode::MakeStruct));
    let def = compile_src("@\"bytes\"");
    assert!(opcodes_of(&def).contains(&Opcode::MakeBuffer));
}

// ---------------------------------------------------------------------------
// Constants and slots
// ---------------------------------------------------------------------------

#[test]
fn test_load_integer_immediate_boundary() {
    let def = compile_src("-32768");
    assert!(opcodes_of(&def).contains(&Opcode::LoadInteger));
    assert!(def.constants.is_empty());

    let def = compile_src("-32769");
    assert!(opcodes_of(&def).contains(&Opcode::LoadConstant));
    assert!(def.constants.iter().any(|c| c.equals(&Value::Integer(-32769))));
}

#[test]
fn test_constants_are_pooled_by_structural_equality() {
    let def = compile_src("(+ \"same\" \"same\")");
    let count = def
        .constants
        .iter()
        .filter(|c| c.equals(&Value::str_from(b"same")))
        .count();
    assert_eq!(count, 1);
}

#[test]
fn test_unknown_symbol_is_an_error_with_position() {
    let err = compile_err("(+ 1\n   nowhere)");
    assert!(err.message.contains("unknown symbol nowhere"));
    assert_eq!(err.line, 1, "position falls back to the enclosing form");
}

#[test]
fn test_recursion_guard_trips_on_deep_nesting() {
    let mut source = String::new();
    for _ in 0..2000 {
        source.push_str("(+ 1 ");
    }
    source.push('1');
    for _ in 0..2000 {
        source.push(')');
    }
    let err = compile_err(&source);
    assert!(err.message.contains("recursed too deeply"));
}

// ---------------------------------------------------------------------------
// Macro expansion through the call engine
// ---------------------------------------------------------------------------

fn macro_always_42(_args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Integer(42))
}

fn macro_self_call(args: &[Value]) -> Result<Value, EvalError> {
    let mut items = vec![Value::symbol("spinner")];
    items.extend(args.iter().cloned());
    Ok(Value::tuple(items))
}

fn macro_explode(_args: &[Value]) -> Result<Value, EvalError> {
    Err(EvalError::runtime_error("boom-macro", "intentional failure"))
}

#[test]
fn test_macro_expansion_replaces_form() {
    let mut env = Environment::core();
    env.def_macro(
        "always-42",
        Value::native(NativeFn {
            name: "always-42",
            fun: macro_always_42,
        }),
    );
    let def = compile_src_in("(always-42 ignored junk)", &mut env);
    assert!(opcodes_of(&def).contains(&Opcode::LoadInteger));
    assert!(!opcodes_of(&def).contains(&Opcode::Call));
}

#[test]
fn test_macro_expansion_cap() {
    let mut env = Environment::core();
    env.def_macro(
        "spinner",
        Value::native(NativeFn {
            name: "spinner",
            fun: macro_self_call,
        }),
    );
    let err = compile_err_in("(spinner)", &mut env);
    assert!(err.message.contains("recursed too deeply in macro expansion"));
}

#[test]
fn test_macro_runtime_error_carries_fiber() {
    let mut env = Environment::core();
    env.def_macro(
        "boom",
        Value::native(NativeFn {
            name: "boom",
            fun: macro_explode,
        }),
    );
    let err = compile_err_in("(boom)", &mut env);
    assert!(err.message.starts_with("(macro)"));
    assert!(err.macro_fiber.is_some());
}

#[test]
fn test_macro_value_out_of_call_position_is_constant() {
    let mut env = Environment::core();
    env.def_macro(
        "always-42",
        Value::native(NativeFn {
            name: "always-42",
            fun: macro_always_42,
        }),
    );
    // Referencing the macro as a value compiles to its binding, not an
    // expansion.
    let def = compile_src_in("always-42", &mut env);
    assert!(opcodes_of(&def).contains(&Opcode::LoadConstant));
}

// ---------------------------------------------------------------------------
// Call-site specialization
// ---------------------------------------------------------------------------

fn fold_add_can_optimize(_c: &Compiler, _opts: &FormOptions, args: &[Slot]) -> bool {
    args.iter().all(|s| s.is_constant())
}

fn fold_add_optimize(_c: &mut Compiler, _opts: &FormOptions, args: &[Slot]) -> Slot {
    let mut total = 0;
    for slot in args {
        if let Value::Integer(i) = slot.constant {
            total += i;
        }
    }
    Slot::constant(Value::Integer(total))
}

use lisp_forge::compiler::Compiler;

inventory::submit! {
    FunOptimizer {
        name: "folding-add",
        can_optimize: fold_add_can_optimize,
        optimize: fold_add_optimize,
    }
}

#[test]
fn test_native_optimizer_replaces_call() {
    let mut env = Environment::core();
    env.def(
        "folding-add",
        Value::native(NativeFn {
            name: "folding-add",
            fun: |args| {
                let mut total = 0;
                for a in args {
                    if let Value::Integer(i) = a {
                        total += i;
                    }
                }
                Ok(Value::Integer(total))
            },
        }),
    );
    let def = compile_src_in("(folding-add 20 22)", &mut env);
    let ops = opcodes_of(&def);
    assert!(!ops.contains(&Opcode::Call));
    assert!(!ops.contains(&Opcode::Tailcall));
    assert!(ops.contains(&Opcode::LoadInteger));
    // Non-constant arguments fall back to the ordinary call
    env.var("n", Value::Integer(1));
    let def = compile_src_in("(folding-add n 22)", &mut env);
    assert!(opcodes_of(&def).contains(&Opcode::Tailcall));
}

// ---------------------------------------------------------------------------
// Sticky errors
// ---------------------------------------------------------------------------

#[test]
fn test_first_error_wins() {
    let err = compile_err("(do missing-one missing-two)");
    assert!(err.message.contains("missing-one"));
    assert!(!err.message.contains("missing-two"));
}

#[test]
fn test_sourcemap_parity_everywhere() {
    let def = compile_src(
        "(fn outer [a]\n  (do\n    (var t 0)\n    (while (< t a) (set t (+ t 1)))\n    (fn inner [] t)))",
    );
    assert_invariants(&def);
}
