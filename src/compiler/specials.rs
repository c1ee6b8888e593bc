// ABOUTME: Special-form compilers: def var set if do while break fn quote
// quasiquote unquote splice

use super::{
    Compiler, FormOptions, LoopFrame, Slot, SCOPE_FUNCTION, SLOT_MUTABLE, SLOT_RETURNED,
};
use crate::env::BindingKind;
use crate::opcodes::{encode_s, encode_su, Opcode};
use crate::symbols::Symbol;
use crate::value::{Tuple, Value, TYPE_ANY};
use forge_macros::special_form;

/// One dispatch-table entry. The `#[special_form]` attribute submits these
/// through inventory, so the table is the set of handlers in this file.
pub struct Special {
    pub name: &'static str,
    pub compile: fn(&mut Compiler, FormOptions, &[Value]) -> Slot,
}

inventory::collect!(Special);

pub fn lookup(name: &str) -> Option<&'static Special> {
    inventory::iter::<Special>().find(|s| s.name == name)
}

/// Names of all registered special forms, for tooling.
pub fn names() -> impl Iterator<Item = &'static str> {
    inventory::iter::<Special>().map(|s| s.name)
}

fn expect_symbol<'v>(c: &mut Compiler, form: &str, value: &'v Value) -> Option<&'v Symbol> {
    match value {
        Value::Symbol(sym) => Some(sym),
        _ => {
            c.cerror(format!("expected symbol as {} target", form));
            None
        }
    }
}

// ---------------------------------------------------------------------------
// quote
// ---------------------------------------------------------------------------

#[special_form("quote")]
fn sf_quote(c: &mut Compiler, _opts: FormOptions, args: &[Value]) -> Slot {
    if args.len() != 1 {
        return c.error_slot("expected 1 argument to quote");
    }
    Slot::constant(args[0].clone())
}

// ---------------------------------------------------------------------------
// def / var / set
// ---------------------------------------------------------------------------

#[special_form("def")]
fn sf_def(c: &mut Compiler, _opts: FormOptions, args: &[Value]) -> Slot {
    if args.len() != 2 {
        return c.error_slot("expected 2 arguments to def");
    }
    let Some(sym) = expect_symbol(c, "def", &args[0]) else {
        return Slot::nil_constant();
    };
    let sym = sym.clone();
    let ret = c.compile_value(FormOptions::default(), &args[1]);
    if c.has_error() {
        return Slot::nil_constant();
    }
    if c.at_top_level() {
        // Install the binding entry now; emit code that fills its cell
        // when the thunk runs.
        let cell = c.declare_global(&sym, BindingKind::Def);
        c.store_into_cell(cell, &ret);
        ret
    } else {
        // Local defs alias the value's slot; constants stay constant.
        c.name_slot(&sym, ret)
    }
}

#[special_form("var")]
fn sf_var(c: &mut Compiler, _opts: FormOptions, args: &[Value]) -> Slot {
    if args.len() != 2 {
        return c.error_slot("expected 2 arguments to var");
    }
    let Some(sym) = expect_symbol(c, "var", &args[0]) else {
        return Slot::nil_constant();
    };
    let sym = sym.clone();
    let ret = c.compile_value(FormOptions::default(), &args[1]);
    if c.has_error() {
        return Slot::nil_constant();
    }
    if c.at_top_level() {
        let cell = c.declare_global(&sym, BindingKind::Var);
        c.store_into_cell(cell, &ret);
        ret
    } else {
        // Mutable locals get a dedicated register.
        let mut slot = c.far_slot();
        slot.flags |= SLOT_MUTABLE;
        c.copy(&slot, &ret);
        c.free_slot(&ret);
        c.name_slot(&sym, slot)
    }
}

#[special_form("set")]
fn sf_set(c: &mut Compiler, _opts: FormOptions, args: &[Value]) -> Slot {
    if args.len() != 2 {
        return c.error_slot("expected 2 arguments to set");
    }
    let Some(sym) = expect_symbol(c, "set", &args[0]) else {
        return Slot::nil_constant();
    };
    let dest = c.resolve(&sym.clone());
    if c.has_error() {
        return Slot::nil_constant();
    }
    if dest.flags & SLOT_MUTABLE == 0 {
        return c.error_slot("cannot write to constant");
    }
    let result = c.compile_value(FormOptions::default(), &args[1]);
    c.copy(&dest, &result);
    c.free_slot(&result);
    dest
}

// ---------------------------------------------------------------------------
// do
// ---------------------------------------------------------------------------

#[special_form("do")]
fn sf_do(c: &mut Compiler, opts: FormOptions, args: &[Value]) -> Slot {
    c.push_scope(0, "do");
    let mut ret = Slot::nil_constant();
    for (i, form) in args.iter().enumerate() {
        if i == args.len() - 1 {
            ret = c.compile_value(opts.clone(), form);
        } else {
            let slot = c.compile_value(FormOptions::default(), form);
            c.free_slot(&slot);
        }
    }
    c.pop_scope_keepslot(&ret);
    ret
}

// ---------------------------------------------------------------------------
// if
// ---------------------------------------------------------------------------

#[special_form("if")]
fn sf_if(c: &mut Compiler, opts: FormOptions, args: &[Value]) -> Slot {
    if args.len() < 2 || args.len() > 3 {
        return c.error_slot("expected 2 or 3 arguments to if");
    }
    let cond = &args[0];
    let truebody = &args[1];
    let falsebody = args.get(2).cloned().unwrap_or(Value::Nil);

    c.push_scope(0, "if");
    let condslot = c.compile_value(FormOptions::default(), cond);
    if c.has_error() {
        c.pop_scope();
        return Slot::nil_constant();
    }

    // A constant condition picks its branch at compile time; the dead
    // branch is still checked for well-formedness but emits nothing.
    if condslot.is_constant() {
        let (taken, dropped) = if condslot.constant.is_truthy() {
            (truebody, &falsebody)
        } else {
            (&falsebody, truebody)
        };
        c.throwaway(FormOptions::default(), dropped);
        let ret = c.compile_value(opts, taken);
        c.pop_scope_keepslot(&ret);
        return ret;
    }

    let target = if opts.tail {
        None
    } else {
        Some(c.gettarget(&opts))
    };
    let branch_opts = FormOptions {
        tail: opts.tail,
        hint: target.clone(),
        types: opts.types,
    };

    let cond_reg = c.preread(0xFF, 0, &condslot);
    let jump_to_false = c.emit_forward_jump(Opcode::JumpIfNot, Some(cond_reg));
    c.postread(&condslot, cond_reg);
    c.free_slot(&condslot);

    c.push_scope(0, "if-true");
    c.compile_value(branch_opts.clone(), truebody);
    c.pop_scope();
    let jump_over_false = if opts.tail {
        None
    } else {
        Some(c.emit_forward_jump(Opcode::Jump, None))
    };
    c.patch_jump(jump_to_false);

    c.push_scope(0, "if-false");
    c.compile_value(branch_opts, &falsebody);
    c.pop_scope();
    if let Some(jump) = jump_over_false {
        c.patch_jump(jump);
    }

    let ret = match target {
        Some(slot) => slot,
        None => {
            let mut slot = Slot::nil_constant();
            slot.flags |= SLOT_RETURNED;
            slot
        }
    };
    c.pop_scope_keepslot(&ret);
    ret
}

// ---------------------------------------------------------------------------
// while / break
// ---------------------------------------------------------------------------

#[special_form("while")]
fn sf_while(c: &mut Compiler, _opts: FormOptions, args: &[Value]) -> Slot {
    if args.is_empty() {
        return c.error_slot("expected at least 1 argument to while");
    }
    let loop_start = c.buffer.len();
    c.push_scope(0, "while");
    let condslot = c.compile_value(FormOptions::default(), &args[0]);
    if c.has_error() {
        c.pop_scope();
        return Slot::nil_constant();
    }

    if condslot.is_constant() {
        if !condslot.constant.is_truthy() {
            // The loop never runs; check the body anyway.
            for form in &args[1..] {
                c.throwaway(FormOptions::default(), form);
            }
            c.pop_scope();
            return Slot::nil_constant();
        }
        // Constant-true condition: no test, just loop.
        compile_loop_body(c, &args[1..], loop_start, None);
        c.pop_scope();
        return Slot::nil_constant();
    }

    let cond_reg = c.preread(0xFF, 0, &condslot);
    let exit_jump = c.emit_forward_jump(Opcode::JumpIfNot, Some(cond_reg));
    c.postread(&condslot, cond_reg);
    c.free_slot(&condslot);

    compile_loop_body(c, &args[1..], loop_start, Some(exit_jump));
    c.pop_scope();
    Slot::nil_constant()
}

fn compile_loop_body(c: &mut Compiler, body: &[Value], loop_start: usize, exit_jump: Option<usize>) {
    c.loops.push(LoopFrame {
        function_depth: c.function_depth(),
        break_jumps: Vec::new(),
    });
    for form in body {
        let slot = c.compile_value(FormOptions::default(), form);
        c.free_slot(&slot);
    }
    let frame = c.loops.pop().expect("loop frame pushed above");
    c.emit_backward_jump(loop_start);
    if let Some(jump) = exit_jump {
        c.patch_jump(jump);
    }
    for jump in frame.break_jumps {
        c.patch_jump(jump);
    }
}

#[special_form("break")]
fn sf_break(c: &mut Compiler, _opts: FormOptions, args: &[Value]) -> Slot {
    if args.len() > 1 {
        return c.error_slot("expected at most 1 argument to break");
    }
    let in_loop = c
        .loops
        .last()
        .map_or(false, |frame| frame.function_depth == c.function_depth());
    if in_loop {
        if let Some(value) = args.first() {
            let slot = c.compile_value(FormOptions::default(), value);
            c.free_slot(&slot);
        }
        let jump = c.emit_forward_jump(Opcode::Jump, None);
        c.loops
            .last_mut()
            .expect("checked above")
            .break_jumps
            .push(jump);
        Slot::nil_constant()
    } else {
        // Outside a loop, break returns from the function.
        let slot = match args.first() {
            Some(value) => c.compile_value(FormOptions::default(), value),
            None => Slot::nil_constant(),
        };
        c.emit_return(slot)
    }
}

// ---------------------------------------------------------------------------
// fn
// ---------------------------------------------------------------------------

#[special_form("fn")]
fn sf_fn(c: &mut Compiler, opts: FormOptions, args: &[Value]) -> Slot {
    let mut index = 0;
    let name = match args.first() {
        Some(Value::Symbol(sym)) => {
            index = 1;
            Some(sym.clone())
        }
        _ => None,
    };
    let Some(Value::Tuple(params)) = args.get(index) else {
        return c.error_slot("expected parameter list");
    };
    let params = params.clone();

    c.push_scope(SCOPE_FUNCTION, "fn");

    let mut arity = 0;
    let mut vararg = false;
    let mut param_iter = params.items.iter().peekable();
    while let Some(param) = param_iter.next() {
        let Value::Symbol(psym) = param else {
            return c.error_slot("expected symbol as parameter");
        };
        if psym.name() == "&" {
            let Some(Value::Symbol(rest)) = param_iter.next() else {
                return c.error_slot("expected symbol after & in parameter list");
            };
            if param_iter.peek().is_some() {
                return c.error_slot("expected a single symbol after & in parameter list");
            }
            vararg = true;
            let slot = c.far_slot();
            c.name_slot(rest, slot);
            break;
        }
        arity += 1;
        let slot = c.far_slot();
        c.name_slot(psym, slot);
    }

    // A named function can call itself without capturing anything.
    if let Some(fname) = &name {
        let slot = c.far_slot();
        c.emit(encode_s(Opcode::LoadSelf, slot.index as u32));
        c.name_slot(fname, slot);
    }

    let body = &args[index + 1..];
    if body.is_empty() {
        c.emit_return(Slot::nil_constant());
    } else {
        for (i, form) in body.iter().enumerate() {
            if i == body.len() - 1 {
                c.compile_value(
                    FormOptions {
                        tail: true,
                        hint: None,
                        types: TYPE_ANY,
                    },
                    form,
                );
            } else {
                let slot = c.compile_value(FormOptions::default(), form);
                c.free_slot(&slot);
            }
        }
    }
    if c.has_error() {
        return Slot::nil_constant();
    }

    let mut def = c.pop_funcdef();
    def.arity = arity;
    def.flags |= if vararg {
        super::funcdef::FLAG_VARARG
    } else {
        super::funcdef::FLAG_FIXARITY
    };
    if let Some(fname) = &name {
        def.name = Some(std::rc::Rc::from(fname.name()));
        def.flags |= super::funcdef::FLAG_HASNAME;
    }
    let defindex = c.add_funcdef(std::rc::Rc::new(def));
    if defindex > 0xFFFF {
        return c.error_slot("too many nested function definitions");
    }
    c.mark_closure();
    let target = c.gettarget(&opts);
    c.emit(encode_su(Opcode::Closure, target.index as u32, defindex as u32));
    target
}

// ---------------------------------------------------------------------------
// quasiquote / unquote / splice
// ---------------------------------------------------------------------------

#[special_form("quasiquote")]
fn sf_quasiquote(c: &mut Compiler, _opts: FormOptions, args: &[Value]) -> Slot {
    if args.len() != 1 {
        return c.error_slot("expected 1 argument to quasiquote");
    }
    quasiquote(c, &args[0], 1)
}

#[special_form("unquote")]
fn sf_unquote(c: &mut Compiler, _opts: FormOptions, _args: &[Value]) -> Slot {
    c.error_slot("cannot use unquote here")
}

#[special_form("splice")]
fn sf_splice(c: &mut Compiler, _opts: FormOptions, _args: &[Value]) -> Slot {
    c.error_slot("cannot use splice here")
}

fn form_head_is(tuple: &Tuple, name: &str) -> bool {
    tuple.items.len() == 2
        && matches!(&tuple.items[0], Value::Symbol(sym) if sym.name() == name)
}

/// Does this template contain an interpolation at the active depth? If not,
/// the whole subtree is a constant.
fn needs_build(value: &Value, depth: i32) -> bool {
    match value {
        Value::Tuple(t) => {
            if form_head_is(t, "unquote") || form_head_is(t, "splice") {
                if depth == 1 {
                    true
                } else {
                    needs_build(&t.items[1], depth - 1)
                }
            } else if form_head_is(t, "quasiquote") {
                needs_build(&t.items[1], depth + 1)
            } else {
                t.items.iter().any(|item| needs_build(item, depth))
            }
        }
        Value::Array(items) => items.borrow().iter().any(|item| needs_build(item, depth)),
        Value::Struct(entries) => entries
            .entries()
            .iter()
            .any(|(k, v)| needs_build(k, depth) || needs_build(v, depth)),
        Value::Table(table) => table
            .borrow()
            .entries()
            .iter()
            .any(|(k, v)| needs_build(k, depth) || needs_build(v, depth)),
        _ => false,
    }
}

fn quasiquote(c: &mut Compiler, value: &Value, depth: i32) -> Slot {
    if !needs_build(value, depth) {
        return Slot::constant(value.clone());
    }
    match value {
        Value::Tuple(t) if form_head_is(t, "unquote") && depth == 1 => {
            c.compile_value(FormOptions::default(), &t.items[1])
        }
        Value::Tuple(t) if form_head_is(t, "unquote") => {
            build_nested_marker(c, "unquote", &t.items[1], depth - 1)
        }
        Value::Tuple(t) if form_head_is(t, "quasiquote") => {
            build_nested_marker(c, "quasiquote", &t.items[1], depth + 1)
        }
        Value::Tuple(t) => build_sequence(c, &t.items, Opcode::MakeTuple, depth),
        Value::Array(items) => {
            let elements = items.borrow().clone();
            build_sequence(c, &elements, Opcode::MakeArray, depth)
        }
        Value::Struct(entries) => {
            let pairs = entries.entries().to_vec();
            build_mapping(c, &pairs, Opcode::MakeStruct, depth)
        }
        Value::Table(table) => {
            let pairs = table.borrow().entries().to_vec();
            build_mapping(c, &pairs, Opcode::MakeTable, depth)
        }
        other => Slot::constant(other.clone()),
    }
}

/// Rebuild a nested `(unquote x)` / `(quasiquote x)` marker form whose
/// payload interpolates at a deeper level.
fn build_nested_marker(c: &mut Compiler, head: &str, payload: &Value, depth: i32) -> Slot {
    let parts = vec![
        (Slot::constant(Value::symbol(head)), false),
        (quasiquote(c, payload, depth), false),
    ];
    finish_build(c, parts, Opcode::MakeTuple)
}

fn build_sequence(c: &mut Compiler, items: &[Value], op: Opcode, depth: i32) -> Slot {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        if let Value::Tuple(t) = item {
            if form_head_is(t, "splice") && depth == 1 {
                let slot = c.compile_value(FormOptions::default(), &t.items[1]);
                parts.push((slot, true));
                continue;
            }
        }
        parts.push((quasiquote(c, item, depth), false));
    }
    finish_build(c, parts, op)
}

fn build_mapping(c: &mut Compiler, pairs: &[(Value, Value)], op: Opcode, depth: i32) -> Slot {
    let mut parts = Vec::with_capacity(pairs.len() * 2);
    for (k, v) in pairs {
        for item in [k, v] {
            if let Value::Tuple(t) = item {
                if form_head_is(t, "splice") && depth == 1 {
                    return c.error_slot("cannot splice into struct or table");
                }
            }
            parts.push((quasiquote(c, item, depth), false));
        }
    }
    finish_build(c, parts, op)
}

fn finish_build(c: &mut Compiler, parts: Vec<(Slot, bool)>, op: Opcode) -> Slot {
    c.push_parts(&parts);
    for (slot, _) in &parts {
        c.free_slot(slot);
    }
    let target = c.gettarget(&FormOptions::default());
    c.emit(encode_s(op, target.index as u32));
    target
}
