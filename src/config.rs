// ABOUTME: Configuration and constants for the reader, compiler, and REPL

pub const VERSION: &str = "1.0.0";
pub const WELCOME_MESSAGE: &str = "lisp-forge v1.0";
pub const WELCOME_SUBTITLE: &str = "A streaming Lisp reader and bytecode compiler in Rust";

/// Depth guard for the compiler's value-dispatch recursion.
pub const RECURSION_GUARD: i32 = 1024;

/// Maximum number of macro expansions applied to a single form.
pub const MAX_MACRO_EXPAND: i32 = 200;

/// Maximum number of pooled constants per function scope.
pub const MAX_CONSTANTS: usize = 0xFFFF;

/// Compiler limits, adjustable by embedders (tests lower them to hit the
/// guard paths without deep inputs).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub recursion_guard: i32,
    pub max_macro_expand: i32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            recursion_guard: RECURSION_GUARD,
            max_macro_expand: MAX_MACRO_EXPAND,
        }
    }
}
