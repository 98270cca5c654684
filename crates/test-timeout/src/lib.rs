//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one on a fresh
//! current-thread runtime. Both accept an optional limit in seconds,
//! e.g. `#[test_timeout::tokio_timeout_test(10)]`; the default is 60.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Sync,
    Tokio,
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr, item, Flavor::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr, item, Flavor::Tokio)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn parse_limit(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn expand(attr: TokenStream, item: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let secs = parse_limit(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = item;

    match (flavor, sig.asyncness.is_some()) {
        (Flavor::Sync, true) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "use #[test_timeout::tokio_timeout_test] for async tests",
            ));
        }
        (Flavor::Tokio, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "#[test_timeout::tokio_timeout_test] expects an async fn",
            ));
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let body = match flavor {
        Flavor::Sync => quote! { #block },
        Flavor::Tokio => quote! {
            {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime");
                runtime.block_on(async move {
                    tokio::time::timeout(limit, async move #block)
                        .await
                        .expect("test timed out");
                });
            }
        },
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` are dropped so the test is not registered twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
