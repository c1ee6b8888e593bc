// ABOUTME: Streaming byte-at-a-time parser turning source text into values

use crate::chars::{is_symbol_char, is_whitespace, to_hex, valid_utf8};
use crate::error::{ParseError, ParserUsage};
use crate::number::scan_number;
use crate::symbols::Symbol;
use crate::value::{Struct, Table, Tuple, Value};
use std::cell::RefCell;
use std::rc::Rc;

// Frame flags. The low byte of a reader-macro frame holds the macro
// character itself.
const FLAG_CONTAINER: u32 = 0x100;
const FLAG_BUFFER: u32 = 0x200;
const FLAG_PARENS: u32 = 0x400;
const FLAG_SQRBRACKETS: u32 = 0x800;
const FLAG_CURLYBRACKETS: u32 = 0x1000;
const FLAG_STRING: u32 = 0x2000;
const FLAG_LONGSTRING: u32 = 0x4000;
const FLAG_READERMAC: u32 = 0x8000;
const FLAG_ATSYM: u32 = 0x10000;
const FLAG_COMMENT: u32 = 0x20000;
const FLAG_TOKEN: u32 = 0x40000;
const FLAG_INSTRING: u32 = 0x100000;
const FLAG_END_CANDIDATE: u32 = 0x200000;

/// The consumer a frame dispatches bytes to. Reader-macro and container
/// frames both dispatch through `Root`; the flags tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consumer {
    Root,
    TokenChar,
    StringChar,
    Escape1,
    EscapeHex,
    LongString,
    AtSign,
    Comment,
}

/// Per-frame parse state. `counter` is the hex-digits-remaining count or the
/// long-string closing-run length; `argn` is the pending value count for
/// containers, the fence length for long strings, the hex accumulator for
/// escapes, and a seen-non-ascii marker for tokens.
#[derive(Debug, Clone, Copy)]
struct Frame {
    counter: i32,
    argn: i32,
    flags: u32,
    line: usize,
    column: usize,
    consumer: Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// At a safe termination point between top-level forms.
    Root,
    /// Inside an unfinished form.
    Pending,
    /// A syntax error is waiting to be read with `error`.
    Error,
    /// `eof` has been called; no more input is accepted.
    Dead,
}

/// Introspection snapshot of one parse frame, for tooling and REPL prompts.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub kind: &'static str,
    pub argn: usize,
    pub buffer: Option<Vec<u8>>,
    pub line: usize,
    pub column: usize,
}

/// A resumable parser. Feed it bytes with `consume`; finished top-level
/// values queue up and come back out through `produce`. The parser can be
/// cloned at any point to checkpoint its entire state.
#[derive(Debug, Clone)]
pub struct Parser {
    buf: Vec<u8>,
    args: Vec<Value>,
    states: Vec<Frame>,
    error: Option<&'static str>,
    lookback: Option<u8>,
    line: usize,
    column: usize,
    pending: usize,
    dead: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Parser {
        let mut parser = Parser {
            buf: Vec::new(),
            args: Vec::new(),
            states: Vec::new(),
            error: None,
            lookback: None,
            line: 1,
            column: 0,
            pending: 0,
            dead: false,
        };
        parser.push_frame(Consumer::Root, FLAG_CONTAINER);
        parser
    }

    /// Feed one byte. Errors only on misuse (dead parser or an unread
    /// error); syntax problems set the sticky error state instead.
    pub fn consume(&mut self, byte: u8) -> Result<(), ParserUsage> {
        self.check_alive()?;
        if byte == b'\r' {
            self.line += 1;
            self.column = 0;
        } else if byte == b'\n' {
            self.column = 0;
            if self.lookback != Some(b'\r') {
                self.line += 1;
            }
        } else {
            self.column += 1;
        }
        let mut consumed = false;
        while !consumed && self.error.is_none() {
            consumed = match self.top().consumer {
                Consumer::Root => self.root(byte),
                Consumer::TokenChar => self.token_char(byte),
                Consumer::StringChar => self.string_char(byte),
                Consumer::Escape1 => self.escape_1(byte),
                Consumer::EscapeHex => self.escape_hex(byte),
                Consumer::LongString => self.long_string(byte),
                Consumer::AtSign => self.at_sign(byte),
                Consumer::Comment => self.comment(byte),
            };
        }
        self.lookback = Some(byte);
        Ok(())
    }

    /// Feed a byte by numeric code; alias for `consume`.
    pub fn byte(&mut self, byte: u8) -> Result<(), ParserUsage> {
        self.consume(byte)
    }

    /// Finalize the input. A synthetic newline flushes any pending token,
    /// then any still-open form is an error reported at the opening
    /// delimiter's position. The parser is dead afterwards.
    pub fn eof(&mut self) -> Result<(), ParserUsage> {
        self.check_alive()?;
        let line = self.line;
        let column = self.column;
        self.consume(b'\n')?;
        self.line = line;
        self.column = column;
        if self.error.is_none() && self.states.len() > 1 {
            let open = self.states[1];
            self.line = open.line;
            self.column = open.column;
            self.error = Some("unexpected end of source");
        }
        self.dead = true;
        Ok(())
    }

    pub fn status(&self) -> Status {
        if self.error.is_some() {
            Status::Error
        } else if self.dead {
            Status::Dead
        } else if self.states.len() > 1 {
            Status::Pending
        } else {
            Status::Root
        }
    }

    /// Read and clear the sticky error, flushing partial state so parsing
    /// can continue after a bad form.
    pub fn error(&mut self) -> Option<&'static str> {
        let message = self.error.take()?;
        self.flush();
        Some(message)
    }

    /// Drop all partial state: open frames, the token buffer, and any
    /// queued values.
    pub fn flush(&mut self) {
        self.args.clear();
        self.states.truncate(1);
        self.states[0].argn = 0;
        self.buf.clear();
        self.pending = 0;
    }

    /// Dequeue the next finished top-level value.
    pub fn produce(&mut self) -> Option<Value> {
        if self.pending == 0 {
            return None;
        }
        self.pending -= 1;
        self.states[0].argn -= 1;
        Some(self.args.remove(0))
    }

    pub fn has_more(&self) -> bool {
        self.pending > 0
    }

    /// Current (line, column) — the `where` operation.
    pub fn position(&self) -> (usize, usize) {
        (self.line, self.column)
    }

    /// Inject a value as if it had just been parsed. Legal in container
    /// frames (becomes an element) and string frames (its text joins the
    /// buffer). A pending token is finalized first.
    pub fn insert(&mut self, value: &Value) -> Result<(), ParserUsage> {
        if self.top().consumer == Consumer::TokenChar {
            self.consume(b' ')?;
            self.column -= 1;
        }
        let at_root = self.states.len() == 1;
        let flags = self.top().flags;
        if flags & FLAG_CONTAINER != 0 {
            self.top().argn += 1;
            if at_root {
                self.pending += 1;
            }
            self.args.push(value.clone());
            Ok(())
        } else if flags & (FLAG_STRING | FLAG_LONGSTRING) != 0 {
            match value {
                Value::Str(s) => self.buf.extend_from_slice(s),
                Value::Buffer(b) => self.buf.extend_from_slice(&b.borrow()),
                other => self.buf.extend_from_slice(format!("{}", other).as_bytes()),
            }
            Ok(())
        } else {
            Err(ParserUsage::CannotInsert)
        }
    }

    /// One character per open frame, innermost last: `(["` means a string
    /// inside brackets inside parens. Long strings contribute their fence.
    pub fn delimiters(&self) -> String {
        let mut out = String::new();
        for frame in &self.states {
            if frame.flags & FLAG_PARENS != 0 {
                out.push('(');
            } else if frame.flags & FLAG_SQRBRACKETS != 0 {
                out.push('[');
            } else if frame.flags & FLAG_CURLYBRACKETS != 0 {
                out.push('{');
            } else if frame.flags & FLAG_STRING != 0 {
                out.push('"');
            } else if frame.flags & FLAG_LONGSTRING != 0 {
                for _ in 0..frame.argn {
                    out.push('`');
                }
            }
        }
        out
    }

    /// Per-frame snapshots, outermost first — the `state` operation.
    pub fn frames(&self) -> Vec<FrameInfo> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let kind = frame_kind(frame, i == 0);
                let uses_buffer = frame.flags
                    & (FLAG_STRING | FLAG_LONGSTRING | FLAG_COMMENT | FLAG_TOKEN)
                    != 0;
                FrameInfo {
                    kind,
                    argn: frame.argn.max(0) as usize,
                    buffer: uses_buffer.then(|| self.buf.clone()),
                    line: frame.line,
                    column: frame.column,
                }
            })
            .collect()
    }

    fn check_alive(&self) -> Result<(), ParserUsage> {
        if self.dead {
            return Err(ParserUsage::Dead);
        }
        if self.error.is_some() {
            return Err(ParserUsage::UncheckedError);
        }
        Ok(())
    }

    fn top(&mut self) -> &mut Frame {
        self.states.last_mut().expect("parser state stack never empty")
    }

    fn push_frame(&mut self, consumer: Consumer, flags: u32) {
        self.states.push(Frame {
            counter: 0,
            argn: 0,
            flags,
            line: self.line,
            column: self.column,
            consumer,
        });
    }

    /// Finish a value: deposit it into the enclosing container, wrapping it
    /// in reader-macro tuples on the way out.
    fn popstate(&mut self, mut value: Value) {
        loop {
            let finished = self.states.pop().expect("cannot pop the root frame");
            let at_root = self.states.len() == 1;
            let newtop = *self.states.last().expect("root frame below");
            if newtop.flags & FLAG_CONTAINER != 0 {
                // Containers stamp the opening position onto tuples.
                if let Value::Tuple(t) = &mut value {
                    if let Some(data) = Rc::get_mut(t) {
                        data.sm_line = finished.line as i32;
                        data.sm_column = finished.column as i32;
                    }
                }
                self.top().argn += 1;
                if at_root {
                    self.pending += 1;
                }
                self.args.push(value);
                return;
            } else if newtop.flags & FLAG_READERMAC != 0 {
                let which = reader_macro_name((newtop.flags & 0xFF) as u8);
                let tuple = Tuple {
                    items: vec![Value::symbol(which), value],
                    sm_line: newtop.line as i32,
                    sm_column: newtop.column as i32,
                    bracket: false,
                };
                value = Value::Tuple(Rc::new(tuple));
                // Loop around to pop the reader-macro frame itself.
            } else {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Consumers. Each returns true when the byte was consumed, false to
    // hand it back to the new top frame.
    // ------------------------------------------------------------------

    fn root(&mut self, c: u8) -> bool {
        match c {
            b'\'' | b',' | b';' | b'~' | b'|' => {
                self.push_frame(Consumer::Root, FLAG_READERMAC | c as u32);
                true
            }
            b'"' => {
                self.push_frame(Consumer::StringChar, FLAG_STRING);
                true
            }
            b'#' => {
                self.push_frame(Consumer::Comment, FLAG_COMMENT);
                true
            }
            b'@' => {
                self.push_frame(Consumer::AtSign, FLAG_ATSYM);
                true
            }
            b'`' => {
                self.push_frame(Consumer::LongString, FLAG_LONGSTRING);
                true
            }
            b'(' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_PARENS);
                true
            }
            b'[' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_SQRBRACKETS);
                true
            }
            b'{' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_CURLYBRACKETS);
                true
            }
            b')' | b']' | b'}' => self.close_delimiter(c),
            _ => {
                if is_whitespace(c) {
                    return true;
                }
                if !is_symbol_char(c) {
                    self.error = Some("unexpected character");
                    return true;
                }
                self.push_frame(Consumer::TokenChar, FLAG_TOKEN);
                false
            }
        }
    }

    fn close_delimiter(&mut self, c: u8) -> bool {
        if self.states.len() == 1 {
            self.error = Some("unexpected delimiter");
            return true;
        }
        let state = *self.states.last().expect("checked above");
        let closed = if (c == b')' && state.flags & FLAG_PARENS != 0)
            || (c == b']' && state.flags & FLAG_SQRBRACKETS != 0)
        {
            if state.flags & FLAG_ATSYM != 0 {
                self.close_array(&state)
            } else {
                self.close_tuple(&state, c == b']')
            }
        } else if c == b'}' && state.flags & FLAG_CURLYBRACKETS != 0 {
            if state.argn & 1 != 0 {
                self.error = Some("struct and table literals expect even number of arguments");
                return true;
            }
            if state.flags & FLAG_ATSYM != 0 {
                self.close_table(&state)
            } else {
                self.close_struct(&state)
            }
        } else {
            self.error = Some("mismatched delimiter");
            return true;
        };
        self.popstate(closed);
        true
    }

    fn take_args(&mut self, n: i32) -> Vec<Value> {
        self.args.split_off(self.args.len() - n as usize)
    }

    fn close_tuple(&mut self, state: &Frame, bracket: bool) -> Value {
        let items = self.take_args(state.argn);
        Value::Tuple(Rc::new(Tuple {
            items,
            sm_line: 0,
            sm_column: 0,
            bracket,
        }))
    }

    fn close_array(&mut self, state: &Frame) -> Value {
        Value::array(self.take_args(state.argn))
    }

    fn close_struct(&mut self, state: &Frame) -> Value {
        let mut items = self.take_args(state.argn).into_iter();
        let mut pairs = Vec::with_capacity(state.argn as usize / 2);
        while let (Some(k), Some(v)) = (items.next(), items.next()) {
            pairs.push((k, v));
        }
        Value::Struct(Rc::new(Struct::from_pairs(pairs)))
    }

    fn close_table(&mut self, state: &Frame) -> Value {
        let mut items = self.take_args(state.argn).into_iter();
        let mut table = Table::new();
        while let (Some(k), Some(v)) = (items.next(), items.next()) {
            table.put(k, v);
        }
        Value::Table(Rc::new(RefCell::new(table)))
    }

    fn token_char(&mut self, c: u8) -> bool {
        if is_symbol_char(c) {
            self.buf.push(c);
            if c > 127 {
                self.top().argn = 1; // saw non-ascii, validate on finish
            }
            return true;
        }
        // Token finished; classify the buffer and hand the byte back.
        let nonascii = self.top().argn == 1;
        let first = self.buf[0];
        let start_dig = first.is_ascii_digit();
        let start_num = start_dig || first == b'-' || first == b'+' || first == b'.';
        let ret = if first == b':' {
            if nonascii && !valid_utf8(&self.buf[1..]) {
                self.error = Some("invalid utf-8 in keyword");
                return false;
            }
            Value::Keyword(intern_token(&self.buf[1..]))
        } else if let Some(num) = start_num.then(|| scan_number(&self.buf)).flatten() {
            num
        } else if self.buf == b"nil" {
            Value::Nil
        } else if self.buf == b"false" {
            Value::Boolean(false)
        } else if self.buf == b"true" {
            Value::Boolean(true)
        } else if start_dig {
            self.error = Some("symbol literal cannot start with a digit");
            return false;
        } else {
            if nonascii && !valid_utf8(&self.buf) {
                self.error = Some("invalid utf-8 in symbol");
                return false;
            }
            Value::Symbol(intern_token(&self.buf))
        };
        self.buf.clear();
        self.popstate(ret);
        false
    }

    fn string_char(&mut self, c: u8) -> bool {
        match c {
            b'\\' => {
                self.top().consumer = Consumer::Escape1;
                true
            }
            b'"' => self.string_end(),
            // Raw line breaks are dropped; multi-line text is what long
            // strings are for.
            b'\n' | b'\r' => true,
            _ => {
                self.buf.push(c);
                true
            }
        }
    }

    fn string_end(&mut self) -> bool {
        let state = *self.states.last().expect("string frame present");
        let mut start = 0;
        let mut end = self.buf.len();
        if state.flags & FLAG_LONGSTRING != 0 {
            // Strip one newline adjacent to each fence.
            if self.buf.first() == Some(&b'\n') {
                start = 1;
            }
            if end > start && self.buf[end - 1] == b'\n' {
                end -= 1;
            }
        }
        let bytes = &self.buf[start..end];
        let ret = if state.flags & FLAG_BUFFER != 0 {
            Value::buffer(bytes.to_vec())
        } else {
            Value::str_from(bytes)
        };
        self.buf.clear();
        self.popstate(ret);
        true
    }

    fn escape_1(&mut self, c: u8) -> bool {
        if c == b'x' {
            let top = self.top();
            top.counter = 2;
            top.argn = 0;
            top.consumer = Consumer::EscapeHex;
            return true;
        }
        let byte = match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' | b'z' => 0,
            b'f' => 0x0C,
            b'v' => 0x0B,
            b'e' => 27,
            b'"' => b'"',
            b'\\' => b'\\',
            _ => {
                self.error = Some("invalid string escape sequence");
                return true;
            }
        };
        self.buf.push(byte);
        self.top().consumer = Consumer::StringChar;
        true
    }

    fn escape_hex(&mut self, c: u8) -> bool {
        let Some(digit) = to_hex(c) else {
            self.error = Some("invalid hex digit in hex escape");
            return true;
        };
        let top = self.top();
        top.argn = (top.argn << 4) + digit as i32;
        top.counter -= 1;
        if top.counter == 0 {
            let byte = (top.argn & 0xFF) as u8;
            top.argn = 0;
            top.consumer = Consumer::StringChar;
            self.buf.push(byte);
        }
        true
    }

    fn long_string(&mut self, c: u8) -> bool {
        let flags = self.top().flags;
        if flags & FLAG_INSTRING != 0 {
            if c == b'`' {
                let top = self.top();
                top.flags = (top.flags | FLAG_END_CANDIDATE) & !FLAG_INSTRING;
                top.counter = 1; // backticks seen in the candidate run
                return true;
            }
            self.buf.push(c);
            true
        } else if flags & FLAG_END_CANDIDATE != 0 {
            let (counter, fence) = {
                let top = self.top();
                (top.counter, top.argn)
            };
            if counter == fence {
                self.string_end();
                return false;
            }
            if c == b'`' && counter < fence {
                self.top().counter += 1;
                return true;
            }
            // Shorter run: the backticks were literal content after all.
            for _ in 0..counter {
                self.buf.push(b'`');
            }
            self.buf.push(c);
            let top = self.top();
            top.counter = 0;
            top.flags = (top.flags | FLAG_INSTRING) & !FLAG_END_CANDIDATE;
            true
        } else {
            // Still counting the opening fence.
            let top = self.top();
            top.argn += 1;
            if c != b'`' {
                top.flags |= FLAG_INSTRING;
                self.buf.push(c);
            }
            true
        }
    }

    fn at_sign(&mut self, c: u8) -> bool {
        self.states.pop();
        match c {
            b'{' => {
                self.push_frame(
                    Consumer::Root,
                    FLAG_CONTAINER | FLAG_CURLYBRACKETS | FLAG_ATSYM,
                );
                true
            }
            b'"' => {
                self.push_frame(Consumer::StringChar, FLAG_BUFFER | FLAG_STRING);
                true
            }
            b'`' => {
                self.push_frame(Consumer::LongString, FLAG_BUFFER | FLAG_LONGSTRING);
                true
            }
            b'[' => {
                self.push_frame(
                    Consumer::Root,
                    FLAG_CONTAINER | FLAG_SQRBRACKETS | FLAG_ATSYM,
                );
                true
            }
            b'(' => {
                self.push_frame(Consumer::Root, FLAG_CONTAINER | FLAG_PARENS | FLAG_ATSYM);
                true
            }
            _ => {
                // Not a mutable literal; the @ was a token lead.
                self.push_frame(Consumer::TokenChar, FLAG_TOKEN);
                self.buf.push(b'@');
                false
            }
        }
    }

    fn comment(&mut self, c: u8) -> bool {
        if c == b'\n' {
            self.states.pop();
            self.buf.clear();
        } else {
            self.buf.push(c);
        }
        true
    }
}

fn reader_macro_name(c: u8) -> &'static str {
    match c {
        b'\'' => "quote",
        b',' => "unquote",
        b';' => "splice",
        b'|' => "short-fn",
        b'~' => "quasiquote",
        _ => "<unknown>",
    }
}

fn frame_kind(frame: &Frame, is_root: bool) -> &'static str {
    if is_root {
        return "root";
    }
    if frame.flags & (FLAG_PARENS | FLAG_SQRBRACKETS) != 0 {
        if frame.flags & FLAG_ATSYM != 0 {
            "array"
        } else {
            "tuple"
        }
    } else if frame.flags & FLAG_CURLYBRACKETS != 0 {
        if frame.flags & FLAG_ATSYM != 0 {
            "table"
        } else {
            "struct"
        }
    } else if frame.flags & (FLAG_STRING | FLAG_LONGSTRING) != 0 {
        if frame.flags & FLAG_BUFFER != 0 {
            "buffer"
        } else {
            "string"
        }
    } else if frame.flags & FLAG_COMMENT != 0 {
        "comment"
    } else if frame.flags & FLAG_TOKEN != 0 {
        "token"
    } else if frame.flags & FLAG_READERMAC != 0 {
        reader_macro_name((frame.flags & 0xFF) as u8)
    } else if frame.flags & FLAG_ATSYM != 0 {
        "at"
    } else {
        "root"
    }
}

/// Tokens are validated before interning, so decoding only fails for byte
/// sequences the permissive validator lets through (surrogate encodings);
/// those intern lossily.
fn intern_token(bytes: &[u8]) -> Symbol {
    match std::str::from_utf8(bytes) {
        Ok(s) => Symbol::intern(s),
        Err(_) => Symbol::intern(&String::from_utf8_lossy(bytes)),
    }
}

/// Parse a complete source text, collecting every top-level value.
pub fn parse_all(source: &str) -> Result<Vec<Value>, ParseError> {
    let mut parser = Parser::new();
    let mut values = Vec::new();
    for &byte in source.as_bytes() {
        parser
            .consume(byte)
            .expect("errors are drained before feeding continues");
        if parser.status() == Status::Error {
            return Err(take_parse_error(&mut parser));
        }
        while let Some(v) = parser.produce() {
            values.push(v);
        }
    }
    parser.eof().expect("parser still alive");
    if parser.status() == Status::Error {
        return Err(take_parse_error(&mut parser));
    }
    while let Some(v) = parser.produce() {
        values.push(v);
    }
    Ok(values)
}

fn take_parse_error(parser: &mut Parser) -> ParseError {
    let (line, column) = parser.position();
    ParseError {
        message: parser
            .error()
            .unwrap_or("unknown parse error")
            .to_string(),
        line,
        column,
    }
}
