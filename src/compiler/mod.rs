// ABOUTME: Compiler core: scope stack, symbol resolution with upvalue capture,
// macro expansion, and the value-tree walker that drives emission

pub mod emit;
pub mod funcdef;
pub mod regalloc;
pub mod specials;

use crate::config::Limits;
use crate::env::{BindingKind, Environment, Resolution};
use crate::error::CompileError;
use crate::opcodes::{encode_s, encode_ss, Opcode};
use crate::symbols::Symbol;
use crate::value::{ArrayRef, Value, TYPE_ANY, TYPE_CALLABLE};
use crate::vm::{CallEngine, Fiber};
use funcdef::{FuncDef, SourceMapping, FLAG_HASNAME, FLAG_NEEDSENV};
use regalloc::RegisterAllocator;
use std::rc::Rc;

// Slot property flags; the permitted-type mask travels separately.
pub const SLOT_CONSTANT: u32 = 0x01;
pub const SLOT_NAMED: u32 = 0x02;
pub const SLOT_MUTABLE: u32 = 0x04;
pub const SLOT_REF: u32 = 0x08;
pub const SLOT_RETURNED: u32 = 0x10;

/// A value-producing location: a local register, an upvalue, a known
/// constant, or a global ref cell. `envindex` below zero means local;
/// otherwise it indexes the current function's capture list.
#[derive(Debug, Clone)]
pub struct Slot {
    pub index: i32,
    pub envindex: i32,
    pub flags: u32,
    pub types: u32,
    pub constant: Value,
}

impl Slot {
    pub fn constant(value: Value) -> Slot {
        Slot {
            index: -1,
            envindex: -1,
            flags: SLOT_CONSTANT,
            types: value.type_bit(),
            constant: value,
        }
    }

    pub fn nil_constant() -> Slot {
        Slot::constant(Value::Nil)
    }

    pub fn is_constant(&self) -> bool {
        self.flags & SLOT_CONSTANT != 0
    }

    /// Same location and, for constants and refs, the same value.
    pub fn sequal(&self, other: &Slot) -> bool {
        if self.flags == other.flags
            && self.index == other.index
            && self.envindex == other.envindex
        {
            if self.flags & (SLOT_CONSTANT | SLOT_REF) != 0 {
                return self.constant.equals(&other.constant);
            }
            return true;
        }
        false
    }
}

/// Options passed down the compile recursion for one form.
#[derive(Debug, Clone)]
pub struct FormOptions {
    /// Return the produced value instead of materializing it.
    pub tail: bool,
    /// Preferred destination slot.
    pub hint: Option<Slot>,
    /// Permitted value types, for specialization.
    pub types: u32,
}

impl Default for FormOptions {
    fn default() -> Self {
        FormOptions {
            tail: false,
            hint: None,
            types: TYPE_ANY,
        }
    }
}

// Scope flags.
pub(crate) const SCOPE_FUNCTION: u32 = 1;
pub(crate) const SCOPE_ENV: u32 = 2;
pub(crate) const SCOPE_TOP: u32 = 4;
pub(crate) const SCOPE_UNUSED: u32 = 8;
pub(crate) const SCOPE_CLOSURE: u32 = 16;

/// A symbol bound in a scope. `sym` goes to None when the pair is carried
/// into the parent only to keep a captured slot alive.
#[derive(Debug, Clone)]
pub(crate) struct SymPair {
    pub sym: Option<Symbol>,
    pub slot: Slot,
    pub keep: bool,
}

#[derive(Debug)]
pub(crate) struct Scope {
    #[allow(dead_code)]
    pub name: &'static str,
    pub ra: RegisterAllocator,
    pub syms: Vec<SymPair>,
    pub consts: Vec<Value>,
    pub envs: Vec<i32>,
    pub defs: Vec<Rc<FuncDef>>,
    pub bytecode_start: usize,
    pub flags: u32,
}

#[derive(Debug, Default)]
pub(crate) struct LoopFrame {
    pub function_depth: usize,
    pub break_jumps: Vec<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct CompileFailure {
    pub message: String,
    pub fiber: Option<Rc<Fiber>>,
}

/// A call-site specialization for a native function, consulted before
/// ordinary call emission. Registered through inventory; none ship by
/// default, hosts and tests submit their own.
pub struct FunOptimizer {
    pub name: &'static str,
    pub can_optimize: fn(&Compiler, &FormOptions, &[Slot]) -> bool,
    pub optimize: fn(&mut Compiler, &FormOptions, &[Slot]) -> Slot,
}

inventory::collect!(FunOptimizer);

fn fun_optimizer(name: &str) -> Option<&'static FunOptimizer> {
    inventory::iter::<FunOptimizer>().find(|o| o.name == name)
}

pub struct Compiler<'a> {
    pub(crate) scopes: Vec<Scope>,
    pub(crate) buffer: Vec<u32>,
    pub(crate) mapbuffer: Vec<SourceMapping>,
    pub(crate) current_mapping: SourceMapping,
    pub(crate) env: &'a mut Environment,
    pub(crate) engine: &'a mut dyn CallEngine,
    pub(crate) source: Option<Rc<str>>,
    pub(crate) recursion_guard: i32,
    pub(crate) limits: Limits,
    pub(crate) error: Option<CompileFailure>,
    pub(crate) loops: Vec<LoopFrame>,
}

enum Expansion {
    NotExpanded(Option<&'static specials::Special>),
    Expanded(Value),
}

impl<'a> Compiler<'a> {
    fn new(
        env: &'a mut Environment,
        engine: &'a mut dyn CallEngine,
        source: Option<&str>,
        limits: Limits,
    ) -> Compiler<'a> {
        Compiler {
            scopes: Vec::new(),
            buffer: Vec::new(),
            mapbuffer: Vec::new(),
            current_mapping: SourceMapping::default(),
            env,
            engine,
            source: source.map(Rc::from),
            recursion_guard: limits.recursion_guard,
            limits,
            error: None,
            loops: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Record a compile error. The first error wins; everything after it
    /// compiles to nil-constant no-ops.
    pub(crate) fn cerror(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(CompileFailure {
                message: message.into(),
                fiber: None,
            });
        }
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Record an error and hand back the nil-constant sentinel.
    pub(crate) fn error_slot(&mut self, message: impl Into<String>) -> Slot {
        self.cerror(message);
        Slot::nil_constant()
    }

    // ------------------------------------------------------------------
    // Scopes and slots
    // ------------------------------------------------------------------

    pub(crate) fn push_scope(&mut self, flags: u32, name: &'static str) {
        // Non-function scopes see their parent's busy registers.
        let ra = if flags & SCOPE_FUNCTION == 0 {
            match self.scopes.last() {
                Some(parent) => parent.ra.clone(),
                None => RegisterAllocator::new(),
            }
        } else {
            RegisterAllocator::new()
        };
        self.scopes.push(Scope {
            name,
            ra,
            syms: Vec::new(),
            consts: Vec::new(),
            envs: Vec::new(),
            defs: Vec::new(),
            bytecode_start: self.buffer.len(),
            flags,
        });
    }

    pub(crate) fn pop_scope(&mut self) {
        let old = self.scopes.pop().expect("scope stack underflow");
        if old.flags & (SCOPE_FUNCTION | SCOPE_UNUSED) == 0 {
            if let Some(parent) = self.scopes.last_mut() {
                // A loop body that made a closure taints its parent too.
                if old.flags & SCOPE_CLOSURE != 0 {
                    parent.flags |= SCOPE_CLOSURE;
                }
                if parent.ra.max < old.ra.max {
                    parent.ra.max = old.ra.max;
                }
                // Captured slots must outlive the scope that named them.
                for mut pair in old.syms {
                    if pair.keep {
                        pair.sym = None;
                        parent.ra.touch(pair.slot.index);
                        parent.syms.push(pair);
                    }
                }
            }
        }
    }

    pub(crate) fn pop_scope_keepslot(&mut self, slot: &Slot) {
        self.pop_scope();
        if !self.scopes.is_empty() && slot.envindex < 0 && slot.index >= 0 {
            self.allocator().touch(slot.index);
        }
    }

    /// Package the current function scope into a definition. Its bytecode
    /// and source map are carved off the shared buffers so nothing bleeds
    /// into the enclosing function.
    pub(crate) fn pop_funcdef(&mut self) -> FuncDef {
        let scope = self.scopes.pop().expect("scope stack underflow");
        debug_assert!(
            scope.flags & SCOPE_FUNCTION != 0,
            "expected function scope"
        );
        let bytecode = self.buffer.split_off(scope.bytecode_start);
        let sourcemap = self.mapbuffer.split_off(scope.bytecode_start);
        let mut flags = 0;
        if scope.flags & SCOPE_ENV != 0 {
            flags |= FLAG_NEEDSENV;
        }
        if self.source.is_some() {
            flags |= funcdef::FLAG_HASSOURCE;
        }
        if !scope.envs.is_empty() {
            flags |= funcdef::FLAG_HASENVS;
        }
        if !scope.defs.is_empty() {
            flags |= funcdef::FLAG_HASDEFS;
        }
        flags |= funcdef::FLAG_HASSOURCEMAP;
        FuncDef {
            bytecode,
            sourcemap,
            constants: scope.consts,
            environments: scope.envs,
            defs: scope.defs,
            slotcount: scope.ra.max + 1,
            arity: 0,
            flags,
            source: self.source.clone(),
            name: None,
        }
    }

    /// Add a nested definition to the innermost function scope.
    pub(crate) fn add_funcdef(&mut self, def: Rc<FuncDef>) -> usize {
        let scope = self
            .scopes
            .iter_mut()
            .rev()
            .find(|s| s.flags & SCOPE_FUNCTION != 0)
            .expect("a function scope always encloses compilation");
        scope.defs.push(def);
        scope.defs.len() - 1
    }

    pub(crate) fn allocator(&mut self) -> &mut RegisterAllocator {
        &mut self
            .scopes
            .last_mut()
            .expect("scope stack never empty during compilation")
            .ra
    }

    pub(crate) fn far_slot(&mut self) -> Slot {
        Slot {
            index: self.allocator().alloc_far(),
            envindex: -1,
            flags: 0,
            types: TYPE_ANY,
            constant: Value::Nil,
        }
    }

    pub(crate) fn free_slot(&mut self, slot: &Slot) {
        if slot.flags & (SLOT_CONSTANT | SLOT_REF | SLOT_NAMED) != 0 {
            return;
        }
        if slot.envindex >= 0 {
            return;
        }
        if slot.index >= 0 {
            self.allocator().free(slot.index);
        }
    }

    pub(crate) fn free_slots(&mut self, slots: &[Slot]) {
        for slot in slots {
            self.free_slot(slot);
        }
    }

    /// Bind a symbol to a slot in the current scope; returns the slot with
    /// the named flag applied.
    pub(crate) fn name_slot(&mut self, sym: &Symbol, mut slot: Slot) -> Slot {
        slot.flags |= SLOT_NAMED;
        self.scopes
            .last_mut()
            .expect("scope stack never empty during compilation")
            .syms
            .push(SymPair {
                sym: Some(sym.clone()),
                slot: slot.clone(),
                keep: false,
            });
        slot
    }

    /// Destination for an instruction that writes a fresh value: the hint
    /// when it is a plain near local, a new near slot otherwise.
    pub(crate) fn gettarget(&mut self, opts: &FormOptions) -> Slot {
        if let Some(hint) = &opts.hint {
            if hint.envindex < 0 && hint.index >= 0 && hint.index <= 0xFF {
                return hint.clone();
            }
        }
        Slot {
            index: self.allocator().alloc_near(0xFF, 4),
            envindex: -1,
            flags: 0,
            types: TYPE_ANY,
            constant: Value::Nil,
        }
    }

    pub(crate) fn at_top_level(&self) -> bool {
        self.scopes
            .last()
            .map_or(false, |s| s.flags & SCOPE_TOP != 0)
    }

    /// Record that the current scope created a closure. Loop compilation
    /// reads this off its body scopes (propagated upward on pop).
    pub(crate) fn mark_closure(&mut self) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.flags |= SCOPE_CLOSURE;
        }
    }

    pub(crate) fn declare_global(&mut self, sym: &Symbol, kind: BindingKind) -> ArrayRef {
        self.env.declare(sym, kind)
    }

    /// Emit code that stores a slot's value into a binding cell when the
    /// compiled code runs.
    pub(crate) fn store_into_cell(&mut self, cell: ArrayRef, src: &Slot) {
        let dest = Slot {
            index: -1,
            envindex: -1,
            flags: SLOT_REF | SLOT_NAMED | SLOT_MUTABLE,
            types: TYPE_ANY,
            constant: Value::Array(cell),
        };
        self.copy(&dest, src);
    }

    pub(crate) fn function_depth(&self) -> usize {
        self.scopes
            .iter()
            .filter(|s| s.flags & SCOPE_FUNCTION != 0)
            .count()
    }

    // ------------------------------------------------------------------
    // Symbol resolution
    // ------------------------------------------------------------------

    /// Look a symbol up through the scope chain, then the global
    /// environment. A hit across a function boundary promotes the binding
    /// into every intermediate capture list.
    pub(crate) fn resolve(&mut self, sym: &Symbol) -> Slot {
        let mut unused = false;
        let mut foundlocal = true;
        let mut hit: Option<(usize, usize)> = None;
        'search: for si in (0..self.scopes.len()).rev() {
            let scope = &self.scopes[si];
            if scope.flags & SCOPE_UNUSED != 0 {
                unused = true;
            }
            for pi in (0..scope.syms.len()).rev() {
                if scope.syms[pi].sym.as_ref() == Some(sym) {
                    hit = Some((si, pi));
                    break 'search;
                }
            }
            if scope.flags & SCOPE_FUNCTION != 0 {
                foundlocal = false;
            }
        }

        let Some((si, pi)) = hit else {
            return match self.env.resolve(sym) {
                Resolution::None => self.error_slot(format!("unknown symbol {}", sym)),
                // A macro used out of calling position is just its value.
                Resolution::Def(value) | Resolution::Macro(value) => Slot::constant(value),
                Resolution::Var(cell) => Slot {
                    index: -1,
                    envindex: -1,
                    flags: SLOT_REF | SLOT_NAMED | SLOT_MUTABLE,
                    types: TYPE_ANY,
                    constant: Value::Array(cell),
                },
            };
        };

        let mut ret = self.scopes[si].syms[pi].slot.clone();

        // Constants and refs are stateless; no capture machinery needed.
        if ret.flags & (SLOT_CONSTANT | SLOT_REF) != 0 {
            return ret;
        }

        // Dead code may reference bindings without forcing capture.
        if unused || foundlocal {
            ret.envindex = -1;
            return ret;
        }

        // The binding lives in an enclosing function's frame: keep its slot
        // alive, expose that function's environment, and thread the capture
        // through every function boundary in between.
        self.scopes[si].syms[pi].keep = true;
        let mut fi = si;
        while self.scopes[fi].flags & SCOPE_FUNCTION == 0 {
            fi -= 1;
        }
        self.scopes[fi].flags |= SCOPE_ENV;
        let mut envindex: i32 = -1;
        for i in fi + 1..self.scopes.len() {
            if self.scopes[i].flags & SCOPE_FUNCTION == 0 {
                continue;
            }
            let envs = &mut self.scopes[i].envs;
            match envs.iter().position(|&e| e == envindex) {
                Some(j) => envindex = j as i32,
                None => {
                    envs.push(envindex);
                    envindex = (envs.len() - 1) as i32;
                }
            }
        }
        ret.envindex = envindex;
        ret
    }

    // ------------------------------------------------------------------
    // Macro expansion
    // ------------------------------------------------------------------

    /// Expand one macro application, or discover a special form. Refines
    /// the source-mapping cursor whenever the form carries a position.
    fn macroexpand1(&mut self, x: &Value) -> Expansion {
        let Value::Tuple(form) = x else {
            return Expansion::NotExpanded(None);
        };
        if form.items.is_empty() {
            return Expansion::NotExpanded(None);
        }
        if form.sm_line > 0 {
            self.current_mapping = SourceMapping {
                line: form.sm_line,
                column: form.sm_column,
            };
        }
        let Value::Symbol(name) = &form.items[0] else {
            return Expansion::NotExpanded(None);
        };
        if let Some(special) = specials::lookup(name.name()) {
            return Expansion::NotExpanded(Some(special));
        }
        let Resolution::Macro(macval) = self.env.resolve(name) else {
            return Expansion::NotExpanded(None);
        };
        match self.engine.call(&macval, &form.items[1..]) {
            Ok(out) => Expansion::Expanded(out),
            Err(failure) => {
                if self.error.is_none() {
                    self.error = Some(CompileFailure {
                        message: format!("(macro) {}", failure.value),
                        fiber: failure.fiber,
                    });
                }
                Expansion::NotExpanded(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Value dispatch
    // ------------------------------------------------------------------

    /// Compile one value to a slot. The heart of the single-pass walker.
    pub(crate) fn compile_value(&mut self, opts: FormOptions, value: &Value) -> Slot {
        if self.has_error() {
            return Slot::nil_constant();
        }
        self.recursion_guard -= 1;
        if self.recursion_guard <= 0 {
            self.recursion_guard += 1;
            return self.error_slot("recursed too deeply");
        }
        let last_mapping = self.current_mapping;

        // Macro expansion, bounded. Also discovers special forms and
        // refines the source cursor.
        let mut x = value.clone();
        let mut special = None;
        let mut remaining = self.limits.max_macro_expand;
        loop {
            if self.has_error() {
                break;
            }
            match self.macroexpand1(&x) {
                Expansion::NotExpanded(s) => {
                    special = s;
                    break;
                }
                Expansion::Expanded(next) => {
                    x = next;
                    remaining -= 1;
                    if remaining <= 0 {
                        self.cerror("recursed too deeply in macro expansion");
                        break;
                    }
                }
            }
        }
        if self.has_error() {
            self.recursion_guard += 1;
            return Slot::nil_constant();
        }

        let mut ret = if let Some(special) = special {
            let Value::Tuple(form) = &x else {
                unreachable!("specials are only found on tuples")
            };
            let args = form.items[1..].to_vec();
            (special.compile)(self, opts.clone(), &args)
        } else {
            match &x {
                Value::Tuple(form) if form.items.is_empty() => Slot::constant(x.clone()),
                Value::Tuple(form) => {
                    let head = self.compile_value(
                        FormOptions {
                            types: TYPE_CALLABLE,
                            ..FormOptions::default()
                        },
                        &form.items[0],
                    );
                    let slots = self.to_slots(&form.items[1..]);
                    self.compile_call(&opts, slots, head)
                }
                Value::Symbol(sym) => self.resolve(&sym.clone()),
                Value::Array(items) => {
                    let elements = items.borrow().clone();
                    let slots = self.to_slots(&elements);
                    self.maker(&opts, slots, Opcode::MakeArray)
                }
                Value::Struct(entries) => {
                    let pairs = entries.entries().to_vec();
                    let slots = self.to_slots_kv(&pairs);
                    self.maker(&opts, slots, Opcode::MakeStruct)
                }
                Value::Table(table) => {
                    let pairs = table.borrow().entries().to_vec();
                    let slots = self.to_slots_kv(&pairs);
                    self.maker(&opts, slots, Opcode::MakeTable)
                }
                Value::Buffer(bytes) => {
                    let text = Value::str_from(&bytes.borrow());
                    let slots = self.to_slots(&[text]);
                    self.maker(&opts, slots, Opcode::MakeBuffer)
                }
                other => Slot::constant(other.clone()),
            }
        };

        if self.has_error() {
            self.recursion_guard += 1;
            return Slot::nil_constant();
        }
        self.current_mapping = last_mapping;
        if opts.tail {
            ret = self.emit_return(ret);
        }
        if let Some(hint) = &opts.hint {
            if !ret.sequal(hint) {
                self.copy(hint, &ret);
                ret = hint.clone();
            }
        }
        self.recursion_guard += 1;
        ret
    }

    /// Compile each value to its own slot, left to right.
    pub(crate) fn to_slots(&mut self, values: &[Value]) -> Vec<Slot> {
        values
            .iter()
            .map(|v| self.compile_value(FormOptions::default(), v))
            .collect()
    }

    /// Interleaved key/value slots in canonical entry order.
    pub(crate) fn to_slots_kv(&mut self, pairs: &[(Value, Value)]) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(pairs.len() * 2);
        for (k, v) in pairs {
            slots.push(self.compile_value(FormOptions::default(), k));
            slots.push(self.compile_value(FormOptions::default(), v));
        }
        slots
    }

    /// Emit a call. The callee register is materialized before the argument
    /// pushes so it stays live across them; a constant native callee first
    /// gets a chance to specialize the whole call away.
    pub(crate) fn compile_call(&mut self, opts: &FormOptions, slots: Vec<Slot>, fun: Slot) -> Slot {
        let mut specialized = None;
        if fun.is_constant() {
            if let Value::Native(native) = &fun.constant {
                if let Some(optimizer) = fun_optimizer(native.name) {
                    if (optimizer.can_optimize)(self, opts, &slots) {
                        specialized = Some((optimizer.optimize)(self, opts, &slots));
                    }
                }
            }
        }
        let ret = match specialized {
            Some(slot) => slot,
            None => {
                let fun_reg = self.preread(0xFF, 0, &fun);
                self.push_slots(&slots);
                let slot = if opts.tail {
                    self.emit(encode_s(Opcode::Tailcall, fun_reg as u32));
                    let mut slot = Slot::nil_constant();
                    slot.flags |= SLOT_RETURNED;
                    slot
                } else {
                    let target = self.gettarget(opts);
                    self.emit(encode_ss(
                        Opcode::Call,
                        target.index as u32,
                        fun_reg as u32,
                    ));
                    target
                };
                self.postread(&fun, fun_reg);
                slot
            }
        };
        self.free_slots(&slots);
        self.free_slot(&fun);
        ret
    }

    /// Emit a constructor: push the element slots, then build into a target.
    pub(crate) fn maker(&mut self, opts: &FormOptions, slots: Vec<Slot>, op: Opcode) -> Slot {
        self.push_slots(&slots);
        self.free_slots(&slots);
        let target = self.gettarget(opts);
        self.emit(encode_s(op, target.index as u32));
        target
    }

    /// Compile a form for well-formedness only: everything it emits is
    /// discarded, and its scope never forces captures.
    pub(crate) fn throwaway(&mut self, opts: FormOptions, value: &Value) {
        let bufstart = self.buffer.len();
        self.push_scope(SCOPE_UNUSED, "unused");
        self.compile_value(opts, value);
        self.pop_scope();
        self.buffer.truncate(bufstart);
        self.mapbuffer.truncate(bufstart);
    }
}

/// Compile one top-level form into a zero-arity thunk.
pub fn compile(
    value: &Value,
    env: &mut Environment,
    engine: &mut dyn CallEngine,
    source: Option<&str>,
) -> Result<Rc<FuncDef>, CompileError> {
    compile_with_limits(value, env, engine, source, Limits::default())
}

pub fn compile_with_limits(
    value: &Value,
    env: &mut Environment,
    engine: &mut dyn CallEngine,
    source: Option<&str>,
    limits: Limits,
) -> Result<Rc<FuncDef>, CompileError> {
    let mut c = Compiler::new(env, engine, source, limits);
    c.push_scope(SCOPE_FUNCTION | SCOPE_TOP, "root");
    let opts = FormOptions {
        tail: true,
        hint: None,
        types: TYPE_ANY,
    };
    c.compile_value(opts, value);
    match c.error.take() {
        Some(failure) => Err(CompileError {
            message: failure.message,
            line: c.current_mapping.line,
            column: c.current_mapping.column,
            macro_fiber: failure.fiber,
        }),
        None => {
            let mut def = c.pop_funcdef();
            def.name = Some(Rc::from("_thunk"));
            def.flags |= FLAG_HASNAME;
            Ok(Rc::new(def))
        }
    }
}
