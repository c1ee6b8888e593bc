// ABOUTME: Value types for the reader and compiler: the tagged sum, containers,
// structural equality/ordering/hashing, and round-trippable printing

use crate::compiler::funcdef::FuncDef;
use crate::error::EvalError;
use crate::symbols::{hash_bytes, Symbol};
use crate::vm::Fiber;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub type BufferRef = Rc<RefCell<Vec<u8>>>;
pub type TableRef = Rc<RefCell<Table>>;

/// An immutable ordered sequence. Carries the source position of its opening
/// delimiter when it came from the reader, and a flag recording whether it
/// was written with square brackets.
#[derive(Debug)]
pub struct Tuple {
    pub items: Vec<Value>,
    pub sm_line: i32,
    pub sm_column: i32,
    pub bracket: bool,
}

impl Tuple {
    pub fn new(items: Vec<Value>) -> Tuple {
        Tuple {
            items,
            sm_line: 0,
            sm_column: 0,
            bracket: false,
        }
    }
}

/// An immutable mapping with canonical entry order: entries are sorted by
/// key hash, ties broken by the total value ordering. Iteration order
/// therefore depends only on the keys, never on source order.
#[derive(Debug)]
pub struct Struct {
    entries: Vec<(Value, Value)>,
}

impl Struct {
    /// Build from key/value pairs. A repeated key keeps the last value.
    pub fn from_pairs(pairs: Vec<(Value, Value)>) -> Struct {
        let mut entries: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            match entries.iter_mut().find(|(ek, _)| ek.equals(&k)) {
                Some(slot) => slot.1 = v,
                None => entries.push((k, v)),
            }
        }
        entries.sort_by(|(a, _), (b, _)| canonical_key_order(a, b));
        Struct { entries }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .binary_search_by(|(k, _)| canonical_key_order(k, key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}

/// A mutable mapping with the same canonical entry order as `Struct`, and an
/// optional prototype consulted on missed lookups.
#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<(Value, Value)>,
    pub proto: Option<TableRef>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn put(&mut self, key: Value, value: Value) {
        match self
            .entries
            .binary_search_by(|(k, _)| canonical_key_order(k, &key))
        {
            Ok(i) => self.entries[i].1 = value,
            Err(i) => self.entries.insert(i, (key, value)),
        }
    }

    /// Lookup in this table only.
    pub fn get_local(&self, key: &Value) -> Option<&Value> {
        self.entries
            .binary_search_by(|(k, _)| canonical_key_order(k, key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// Lookup falling back to the prototype chain.
    pub fn get(&self, key: &Value) -> Option<Value> {
        if let Some(v) = self.get_local(key) {
            return Some(v.clone());
        }
        let mut proto = self.proto.clone();
        while let Some(t) = proto {
            let t = t.borrow();
            if let Some(v) = t.get_local(key) {
                return Some(v.clone());
            }
            proto = t.proto.clone();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}

fn canonical_key_order(a: &Value, b: &Value) -> Ordering {
    a.hash32()
        .cmp(&b.hash32())
        .then_with(|| a.compare(b))
}

/// A bytecode function value: a definition closed over nothing. Real
/// closures only exist inside the VM; the compiler sees functions as
/// constants to call or to consult for specialization.
#[derive(Debug)]
pub struct Function {
    pub def: Rc<FuncDef>,
}

/// A host function. Callable by the macro engine and by optimizer lookups;
/// the compiled artifact refers to it as a constant.
pub struct NativeFn {
    pub name: &'static str,
    pub fun: fn(&[Value]) -> Result<Value, EvalError>,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

/// Opaque host handle carried through the value tree untouched.
pub trait AbstractValue: fmt::Debug {
    fn type_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    Str(Rc<[u8]>),
    Symbol(Symbol),
    Keyword(Symbol),
    Buffer(BufferRef),
    Tuple(Rc<Tuple>),
    Array(ArrayRef),
    Struct(Rc<Struct>),
    Table(TableRef),
    Function(Rc<Function>),
    Native(Rc<NativeFn>),
    Fiber(Rc<Fiber>),
    Abstract(Rc<dyn AbstractValue>),
}

/// Type tags, used for slot type masks. `false` and `true` are distinct
/// tags so constant slots can carry exact type knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Nil = 0,
    False,
    True,
    Integer,
    Real,
    Str,
    Symbol,
    Keyword,
    Buffer,
    Tuple,
    Array,
    Struct,
    Table,
    Function,
    Native,
    Fiber,
    Abstract,
}

/// Mask accepting every value type.
pub const TYPE_ANY: u32 = 0x0001_FFFF;
pub const TYPE_CALLABLE: u32 = (1 << Kind::Function as u32) | (1 << Kind::Native as u32);

impl Value {
    pub fn str_from(bytes: &[u8]) -> Value {
        Value::Str(Rc::from(bytes))
    }

    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Symbol::intern(name))
    }

    pub fn keyword(name: &str) -> Value {
        Value::Keyword(Symbol::intern(name))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(Tuple::new(items)))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn buffer(bytes: Vec<u8>) -> Value {
        Value::Buffer(Rc::new(RefCell::new(bytes)))
    }

    pub fn native(native: NativeFn) -> Value {
        Value::Native(Rc::new(native))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Nil => Kind::Nil,
            Value::Boolean(false) => Kind::False,
            Value::Boolean(true) => Kind::True,
            Value::Integer(_) => Kind::Integer,
            Value::Real(_) => Kind::Real,
            Value::Str(_) => Kind::Str,
            Value::Symbol(_) => Kind::Symbol,
            Value::Keyword(_) => Kind::Keyword,
            Value::Buffer(_) => Kind::Buffer,
            Value::Tuple(_) => Kind::Tuple,
            Value::Array(_) => Kind::Array,
            Value::Struct(_) => Kind::Struct,
            Value::Table(_) => Kind::Table,
            Value::Function(_) => Kind::Function,
            Value::Native(_) => Kind::Native,
            Value::Fiber(_) => Kind::Fiber,
            Value::Abstract(_) => Kind::Abstract,
        }
    }

    pub fn type_bit(&self) -> u32 {
        1 << self.kind() as u32
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            Kind::Nil => "nil",
            Kind::False | Kind::True => "boolean",
            Kind::Integer => "integer",
            Kind::Real => "real",
            Kind::Str => "string",
            Kind::Symbol => "symbol",
            Kind::Keyword => "keyword",
            Kind::Buffer => "buffer",
            Kind::Tuple => "tuple",
            Kind::Array => "array",
            Kind::Struct => "struct",
            Kind::Table => "table",
            Kind::Function => "function",
            Kind::Native => "cfunction",
            Kind::Fiber => "fiber",
            Kind::Abstract => "abstract",
        }
    }

    /// Everything except nil and false is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Structural equality. Immutable aggregates compare by content,
    /// mutable ones and callables by identity, symbols by pointer.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a.same(b),
            (Value::Keyword(a), Value::Keyword(b)) => a.same(b),
            (Value::Buffer(a), Value::Buffer(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.items.len() == b.items.len()
                    && a.items.iter().zip(&b.items).all(|(x, y)| x.equals(y))
            }
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => {
                a.len() == b.len()
                    && a.entries()
                        .iter()
                        .zip(b.entries())
                        .all(|((ak, av), (bk, bv))| ak.equals(bk) && av.equals(bv))
            }
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Fiber(a), Value::Fiber(b)) => Rc::ptr_eq(a, b),
            (Value::Abstract(a), Value::Abstract(b)) => {
                std::ptr::eq(Rc::as_ptr(a) as *const u8, Rc::as_ptr(b) as *const u8)
            }
            _ => false,
        }
    }

    /// Total order over all values: by type tag first, then within the type.
    /// The ordering is representational (no numeric promotion across
    /// integer/real); its only job is to be deterministic and consistent
    /// with `equals`.
    pub fn compare(&self, other: &Value) -> Ordering {
        let ka = self.kind() as u8;
        let kb = other.kind() as u8;
        if ka != kb {
            return ka.cmp(&kb);
        }
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => {
                a.partial_cmp(b).unwrap_or_else(|| a.to_bits().cmp(&b.to_bits()))
            }
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Symbol(a), Value::Symbol(b)) | (Value::Keyword(a), Value::Keyword(b)) => {
                a.name().cmp(b.name())
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.items.iter().zip(&b.items) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.items.len().cmp(&b.items.len())
            }
            (Value::Struct(a), Value::Struct(b)) => {
                for ((ak, av), (bk, bv)) in a.entries().iter().zip(b.entries()) {
                    let ord = ak.compare(bk).then_with(|| av.compare(bv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            // Mutable and opaque values order by address.
            _ => self.identity().cmp(&other.identity()),
        }
    }

    fn identity(&self) -> usize {
        match self {
            Value::Buffer(r) => Rc::as_ptr(r) as usize,
            Value::Array(r) => Rc::as_ptr(r) as usize,
            Value::Table(r) => Rc::as_ptr(r) as usize,
            Value::Function(r) => Rc::as_ptr(r) as usize,
            Value::Native(r) => Rc::as_ptr(r) as usize,
            Value::Fiber(r) => Rc::as_ptr(r) as usize,
            Value::Abstract(r) => Rc::as_ptr(r) as *const u8 as usize,
            _ => 0,
        }
    }

    /// Structural 32-bit hash, consistent with `equals`.
    pub fn hash32(&self) -> u32 {
        match self {
            Value::Nil => 0x0721_9af5,
            Value::Boolean(false) => 0x5f35_6e2b,
            Value::Boolean(true) => 0x9b4d_1a73,
            Value::Integer(i) => (*i as u32).wrapping_mul(0x9e37_79b9),
            Value::Real(r) => {
                let bits = r.to_bits();
                ((bits >> 32) as u32 ^ bits as u32).wrapping_mul(0x9e37_79b9)
            }
            Value::Str(s) => hash_bytes(s),
            Value::Symbol(s) => s.hash32(),
            Value::Keyword(s) => s.hash32() ^ 0x5bd1_e995,
            Value::Tuple(t) => {
                let mut h: u32 = 0x3a8f_05c5;
                for item in &t.items {
                    h = h.wrapping_mul(31).wrapping_add(item.hash32());
                }
                h
            }
            Value::Struct(s) => {
                let mut h: u32 = 0x42b4_29a1;
                for (k, v) in s.entries() {
                    h = h.wrapping_mul(31).wrapping_add(k.hash32());
                    h = h.wrapping_mul(31).wrapping_add(v.hash32());
                }
                h
            }
            _ => {
                let p = self.identity() as u64;
                ((p >> 32) as u32 ^ p as u32).wrapping_mul(0x9e37_79b9)
            }
        }
    }
}

// ============================================================================
// Printing
// ============================================================================
//
// The textual form round-trips through the reader for everything the reader
// can produce: symbols and keywords print bare, strings with the escape set,
// bracket tuples keep their brackets, mutable containers keep their @.

fn write_string_body(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => write!(f, "\\\"")?,
            b'\\' => write!(f, "\\\\")?,
            b'\n' => write!(f, "\\n")?,
            b'\t' => write!(f, "\\t")?,
            b'\r' => write!(f, "\\r")?,
            0 => write!(f, "\\0")?,
            0x0C => write!(f, "\\f")?,
            0x0B => write!(f, "\\v")?,
            27 => write!(f, "\\e")?,
            b if b < 0x20 || b == 0x7F => write!(f, "\\x{:02x}", b)?,
            _ => {
                // Longest chunk of printable ASCII / valid UTF-8; anything
                // that fails to decode is hex-escaped byte by byte.
                let start = i;
                while i < bytes.len() {
                    let b = bytes[i];
                    if b < 0x20 || b == 0x7F || b == b'"' || b == b'\\' {
                        break;
                    }
                    i += 1;
                }
                match std::str::from_utf8(&bytes[start..i]) {
                    Ok(chunk) => f.write_str(chunk)?,
                    Err(e) => {
                        let valid = e.valid_up_to();
                        f.write_str(std::str::from_utf8(&bytes[start..start + valid]).expect(
                            "valid_up_to marks a decodable prefix",
                        ))?;
                        write!(f, "\\x{:02x}", bytes[start + valid])?;
                        i = start + valid + 1;
                    }
                }
                continue;
            }
        }
        i += 1;
    }
    Ok(())
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Value], open: &str, close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}

fn write_entries(
    f: &mut fmt::Formatter<'_>,
    entries: &[(Value, Value)],
    open: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, (k, v)) in entries.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{} {}", k, v)?;
    }
    f.write_str("}")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(true) => write!(f, "true"),
            Value::Boolean(false) => write!(f, "false"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => {
                if r.fract() == 0.0 && r.is_finite() && r.abs() < 1e17 {
                    write!(f, "{:.1}", r)
                } else {
                    write!(f, "{}", r)
                }
            }
            Value::Str(s) => {
                write!(f, "\"")?;
                write_string_body(f, s)?;
                write!(f, "\"")
            }
            Value::Symbol(s) => write!(f, "{}", s),
            Value::Keyword(s) => write!(f, ":{}", s),
            Value::Buffer(b) => {
                write!(f, "@\"")?;
                write_string_body(f, &b.borrow())?;
                write!(f, "\"")
            }
            Value::Tuple(t) => {
                if t.bracket {
                    write_seq(f, &t.items, "[", "]")
                } else {
                    write_seq(f, &t.items, "(", ")")
                }
            }
            Value::Array(a) => write_seq(f, &a.borrow(), "@[", "]"),
            Value::Struct(s) => write_entries(f, s.entries(), "{"),
            Value::Table(t) => write_entries(f, t.borrow().entries(), "@{"),
            Value::Function(func) => match &func.def.name {
                Some(name) => write!(f, "<function {}>", name),
                None => write!(f, "<function>"),
            },
            Value::Native(n) => write!(f, "<cfunction {}>", n.name),
            Value::Fiber(_) => write!(f, "<fiber>"),
            Value::Abstract(a) => write!(f, "<abstract {}>", a.type_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_and_real_display() {
        assert_eq!(format!("{}", Value::Integer(42)), "42");
        assert_eq!(format!("{}", Value::Integer(-7)), "-7");
        assert_eq!(format!("{}", Value::Real(1.0)), "1.0");
        assert_eq!(format!("{}", Value::Real(-2.5)), "-2.5");
    }

    #[test]
    fn test_string_display_escapes() {
        let v = Value::str_from(b"say \"hi\"\n");
        assert_eq!(format!("{}", v), r#""say \"hi\"\n""#);
        let v = Value::str_from(&[0x01]);
        assert_eq!(format!("{}", v), r#""\x01""#);
    }

    #[test]
    fn test_container_display() {
        let t = Value::tuple(vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(format!("{}", t), "(1 2)");

        let mut bt = Tuple::new(vec![Value::Integer(1), Value::Integer(2)]);
        bt.bracket = true;
        assert_eq!(format!("{}", Value::Tuple(Rc::new(bt))), "[1 2]");

        let a = Value::array(vec![Value::Integer(1)]);
        assert_eq!(format!("{}", a), "@[1]");

        let b = Value::buffer(b"hey".to_vec());
        assert_eq!(format!("{}", b), "@\"hey\"");
    }

    #[test]
    fn test_symbol_equality_is_pointer_equality() {
        let a = Value::symbol("x");
        let b = Value::symbol("x");
        assert!(a.equals(&b));
        let c = Value::symbol("y");
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_tuple_equality_ignores_source_info() {
        let mut t1 = Tuple::new(vec![Value::Integer(1)]);
        t1.sm_line = 3;
        t1.sm_column = 9;
        let t2 = Tuple::new(vec![Value::Integer(1)]);
        assert!(Value::Tuple(Rc::new(t1)).equals(&Value::Tuple(Rc::new(t2))));
    }

    #[test]
    fn test_mutable_containers_compare_by_identity() {
        let a = Value::array(vec![Value::Integer(1)]);
        let b = Value::array(vec![Value::Integer(1)]);
        assert!(!a.equals(&b));
        assert!(a.equals(&a.clone()));
    }

    #[test]
    fn test_struct_canonical_order_is_source_order_independent() {
        let k1 = Value::keyword("a");
        let k2 = Value::keyword("b");
        let s1 = Struct::from_pairs(vec![
            (k1.clone(), Value::Integer(1)),
            (k2.clone(), Value::Integer(2)),
        ]);
        let s2 = Struct::from_pairs(vec![
            (k2.clone(), Value::Integer(2)),
            (k1.clone(), Value::Integer(1)),
        ]);
        assert!(Value::Struct(Rc::new(s1)).equals(&Value::Struct(Rc::new(s2))));
    }

    #[test]
    fn test_struct_duplicate_key_keeps_last() {
        let k = Value::keyword("a");
        let s = Struct::from_pairs(vec![
            (k.clone(), Value::Integer(1)),
            (k.clone(), Value::Integer(2)),
        ]);
        assert_eq!(s.len(), 1);
        assert!(s.get(&k).unwrap().equals(&Value::Integer(2)));
    }

    #[test]
    fn test_table_put_get_and_proto() {
        let mut t = Table::new();
        t.put(Value::keyword("x"), Value::Integer(10));
        assert!(t
            .get(&Value::keyword("x"))
            .unwrap()
            .equals(&Value::Integer(10)));
        assert!(t.get(&Value::keyword("missing")).is_none());

        let parent = Rc::new(RefCell::new(t));
        let mut child = Table::new();
        child.proto = Some(parent);
        assert!(child
            .get(&Value::keyword("x"))
            .unwrap()
            .equals(&Value::Integer(10)));
    }

    #[test]
    fn test_hash_consistent_with_equals() {
        let a = Value::tuple(vec![Value::Integer(1), Value::str_from(b"x")]);
        let b = Value::tuple(vec![Value::Integer(1), Value::str_from(b"x")]);
        assert!(a.equals(&b));
        assert_eq!(a.hash32(), b.hash32());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::str_from(b"").is_truthy());
    }

    #[test]
    fn test_compare_total_order() {
        let mut vals = vec![
            Value::Integer(3),
            Value::Nil,
            Value::Integer(1),
            Value::Boolean(true),
        ];
        vals.sort_by(|a, b| a.compare(b));
        assert!(vals[0].is_nil());
        assert!(vals[1].equals(&Value::Boolean(true)));
        assert!(vals[2].equals(&Value::Integer(1)));
        assert!(vals[3].equals(&Value::Integer(3)));
    }
}
