//! Augment the development of transfer primitives with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, AttributeArgs, Error, Ident, ItemFn, Lit, Meta, NestedMeta};

/// Levels accepted by the `level` argument of [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test function with a [tracing] subscriber that writes to the test output.
///
/// The subscriber captures events up to `level` (default `DEBUG`) and is only installed
/// for the duration of the test on the calling thread. Crates using this attribute
/// must have `tracing` and `tracing-subscriber` available.
///
/// # Example
///
/// ```rust
/// use courier_macros::test_traced;
/// use tracing::info;
///
/// #[test_traced(level = "INFO")]
/// fn test_info_level() {
///     info!("visible in test output");
///     assert_eq!(2 + 2, 4);
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttributeArgs);
    let input = parse_macro_input!(item as ItemFn);

    // Parse arguments
    let mut level = String::from("DEBUG");
    for arg in args {
        match arg {
            NestedMeta::Meta(Meta::NameValue(nv)) if nv.path.is_ident("level") => match nv.lit {
                Lit::Str(value) => level = value.value().to_uppercase(),
                other => {
                    return Error::new_spanned(other, "level must be a string literal")
                        .to_compile_error()
                        .into()
                }
            },
            other => {
                return Error::new_spanned(other, "unsupported argument, expected `level`")
                    .to_compile_error()
                    .into()
            }
        }
    }
    if !LEVELS.contains(&level.as_str()) {
        return Error::new(
            Span::call_site(),
            format!("invalid level `{level}`, expected one of {LEVELS:?}"),
        )
        .to_compile_error()
        .into();
    }
    let level = Ident::new(&level, Span::call_site());

    // Wrap the body with a scoped subscriber
    let attrs = input.attrs;
    let vis = input.vis;
    let name = input.sig.ident;
    let output = input.sig.output;
    let block = input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis fn #name() #output {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::tracing::Level::#level)
                .with_line_number(true)
                .with_span_events(::tracing_subscriber::fmt::format::FmtSpan::CLOSE)
                .finish();
            let dispatcher = ::tracing::Dispatch::new(subscriber);
            ::tracing::dispatcher::with_default(&dispatcher, || #block)
        }
    };
    TokenStream::from(expanded)
}
