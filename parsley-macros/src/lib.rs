//! Procedural macro for Parsley's per-type method tables.
//!
//! Provides `#[method(...)]`, an attribute that turns a plain method
//! implementation function into a self-registering entry in the value
//! system's dispatch table. Registration happens once, at the call site,
//! and both dispatch (`eval::call_method`) and introspection (`describe()`)
//! read from the same `inventory`-collected table — see
//! `src/methods/mod.rs` for the consumer side.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, Lit, Meta};

struct MethodArgs {
    on: String,
    name: String,
    arity: String,
    doc: String,
}

fn parse_args(attr: TokenStream) -> MethodArgs {
    let attr_str = attr.to_string();
    let mut on = String::new();
    let mut name = String::new();
    let mut arity = String::new();

    let parser = syn::punctuated::Punctuated::<Meta, syn::Token![,]>::parse_terminated;
    let metas = parser
        .parse(attr)
        .unwrap_or_else(|_| syn::punctuated::Punctuated::new());

    for meta in metas {
        if let Meta::NameValue(nv) = meta {
            let key = nv.path.get_ident().map(|i| i.to_string()).unwrap_or_default();
            if let syn::Expr::Lit(syn::ExprLit { lit: Lit::Str(s), .. }) = nv.value {
                let value = s.value();
                match key.as_str() {
                    "on" => on = value,
                    "name" => name = value,
                    "arity" => arity = value,
                    _ => {}
                }
            }
        }
    }

    // Fallback: accept unquoted-identifier spellings for `on` if the
    // structured parse above found nothing.
    if on.is_empty() {
        if let Some(start) = attr_str.find("on") {
            let rest = &attr_str[start..];
            if let Some(eq) = rest.find('=') {
                let after = rest[eq + 1..].trim_start();
                let end = after.find(',').unwrap_or(after.len());
                on = after[..end].trim().trim_matches('"').to_string();
            }
        }
    }

    MethodArgs { on, name, arity, doc: String::new() }
}

fn extract_doc(func: &ItemFn) -> String {
    func.attrs
        .iter()
        .filter_map(|a| {
            if a.path().is_ident("doc") {
                if let Meta::NameValue(nv) = &a.meta {
                    if let syn::Expr::Lit(syn::ExprLit { lit: Lit::Str(s), .. }) = &nv.value {
                        return Some(s.value().trim().to_string());
                    }
                }
            }
            None
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Registers a value method: `#[method(on = "Array", name = "push", arity = "1")]`.
///
/// The annotated function keeps signature
/// `fn(&Value, &[Value]) -> Result<Value, RuntimeError>` and is registered
/// under `crate::methods::MethodEntry` via `inventory::submit!`.
#[proc_macro_attribute]
pub fn method(attr: TokenStream, item: TokenStream) -> TokenStream {
    let func = parse_macro_input!(item as ItemFn);
    let mut args = parse_args(attr);
    args.doc = extract_doc(&func);

    let fn_ident = func.sig.ident.clone();
    let on = args.on;
    let name = if args.name.is_empty() { fn_ident.to_string() } else { args.name };
    let arity = if args.arity.is_empty() { "any".to_string() } else { args.arity };
    let doc = args.doc;

    let expanded = quote! {
        #func

        ::inventory::submit! {
            crate::methods::MethodEntry {
                type_name: #on,
                name: #name,
                arity: #arity,
                description: #doc,
                func: #fn_ident,
            }
        }
    };

    TokenStream::from(expanded)
}
