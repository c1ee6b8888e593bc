//! Procedural macros for lisp-forge special forms
//!
//! Provides the `#[special_form]` attribute macro for declaring compiler
//! special-form handlers. The attribute keeps the handler function as-is and
//! generates the `inventory` registration next to it, so the dispatch table
//! in `compiler::specials` is assembled from the handlers themselves.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, LitStr};

/// Register a function as a special-form compiler.
///
/// Usage:
///
/// ```ignore
/// #[special_form("if")]
/// fn sf_if(c: &mut Compiler, opts: FormOptions, args: &[Value]) -> Slot {
///     ...
/// }
/// ```
///
/// The string argument is the source-level name the form is dispatched on.
/// The expanded code submits a `crate::compiler::specials::Special` entry,
/// so the attribute is only usable inside the main crate.
#[proc_macro_attribute]
pub fn special_form(attr: TokenStream, item: TokenStream) -> TokenStream {
    let name = parse_macro_input!(attr as LitStr);
    let func = parse_macro_input!(item as ItemFn);
    let ident = &func.sig.ident;

    let expanded = quote! {
        #func

        inventory::submit! {
            crate::compiler::specials::Special {
                name: #name,
                compile: #ident,
            }
        }
    };

    TokenStream::from(expanded)
}
