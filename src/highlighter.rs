// ABOUTME: Syntax highlighter for the REPL with color support
// Implements rustyline's Highlighter trait to provide ANSI color codes
// for source elements while preserving display width

use lisp_forge::compiler::specials;
use rustyline::completion::Completer;
use rustyline::highlight::{CmdKind, Highlighter};
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::Helper;
use std::borrow::Cow;
use std::collections::HashSet;

// ANSI color codes (3-bit/4-bit colors for maximum terminal compatibility)
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_PARENS: &str = "\x1b[1;34m"; // Bold blue
const COLOR_SPECIAL_FORM: &str = "\x1b[1;35m"; // Bold magenta
const COLOR_NATIVE: &str = "\x1b[36m"; // Cyan
const COLOR_NUMBER: &str = "\x1b[33m"; // Yellow
const COLOR_STRING: &str = "\x1b[32m"; // Green
const COLOR_KEYWORD: &str = "\x1b[33m"; // Yellow
const COLOR_COMMENT: &str = "\x1b[90m"; // Bright black (gray)
const COLOR_READER_MACRO: &str = "\x1b[1;33m"; // Bold yellow

/// Helper wiring syntax-aware coloring into the line editor.
pub struct ForgeHelper;

impl ForgeHelper {
    pub fn new() -> Self {
        ForgeHelper
    }
}

impl Default for ForgeHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl Helper for ForgeHelper {}

impl Completer for ForgeHelper {
    type Candidate = String;
}

impl Hinter for ForgeHelper {
    type Hint = String;
}

impl Validator for ForgeHelper {}

impl Highlighter for ForgeHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        let special_forms: HashSet<&'static str> = specials::names().collect();
        let natives = native_names();
        let highlighted = highlight_line(line, &special_forms, &natives);
        if highlighted == line {
            Cow::Borrowed(line)
        } else {
            Cow::Owned(highlighted)
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: CmdKind) -> bool {
        true
    }
}

fn native_names() -> HashSet<&'static str> {
    ["+", "-", "*", "/", "<", ">", "<=", ">=", "=", "not"]
        .into_iter()
        .collect()
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric()
        || "!$%&*+-./:<=>@\\^_~|".contains(c)
        || !c.is_ascii()
}

/// Tokenize a line and wrap each token in its color.
fn highlight_line(
    line: &str,
    special_forms: &HashSet<&'static str>,
    natives: &HashSet<&'static str>,
) -> String {
    let mut out = String::with_capacity(line.len());
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                // Comment to end of line
                out.push_str(COLOR_COMMENT);
                out.extend(&chars[i..]);
                out.push_str(COLOR_RESET);
                break;
            }
            '"' => {
                let start = i;
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\\' {
                        i += 1;
                    } else if chars[i] == '"' {
                        break;
                    }
                    i += 1;
                }
                i = (i + 1).min(chars.len());
                out.push_str(COLOR_STRING);
                out.extend(&chars[start..i]);
                out.push_str(COLOR_RESET);
            }
            '(' | ')' | '[' | ']' | '{' | '}' => {
                out.push_str(COLOR_PARENS);
                out.push(c);
                out.push_str(COLOR_RESET);
                i += 1;
            }
            '\'' | ',' | ';' | '~' | '|' | '`' => {
                out.push_str(COLOR_READER_MACRO);
                out.push(c);
                out.push_str(COLOR_RESET);
                i += 1;
            }
            c if is_token_char(c) => {
                let start = i;
                while i < chars.len() && is_token_char(chars[i]) {
                    i += 1;
                }
                let token: String = chars[start..i].iter().collect();
                let color = classify_token(&token, special_forms, natives);
                match color {
                    Some(color) => {
                        out.push_str(color);
                        out.push_str(&token);
                        out.push_str(COLOR_RESET);
                    }
                    None => out.push_str(&token),
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn classify_token(
    token: &str,
    special_forms: &HashSet<&'static str>,
    natives: &HashSet<&'static str>,
) -> Option<&'static str> {
    if special_forms.contains(token) {
        return Some(COLOR_SPECIAL_FORM);
    }
    if natives.contains(token) {
        return Some(COLOR_NATIVE);
    }
    if token.starts_with(':') {
        return Some(COLOR_KEYWORD);
    }
    if token == "nil" || token == "true" || token == "false" {
        return Some(COLOR_KEYWORD);
    }
    let first = token.chars().next()?;
    if first.is_ascii_digit()
        || (token.len() > 1 && matches!(first, '-' | '+' | '.'))
            && token.chars().nth(1).is_some_and(|c| c.is_ascii_digit())
    {
        return Some(COLOR_NUMBER);
    }
    None
}
