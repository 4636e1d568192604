//! Test attributes that fail a test which runs past a wall-clock limit.
//!
//! ```ignore
//! #[timeout(5)]
//! fn sync_test() { .. }
//!
//! #[tokio_timeout_test(millis = 500, start_paused = true)]
//! async fn async_test() { .. }
//! ```
//!
//! The test body runs on its own thread so a deadlock is reported as a
//! failure instead of hanging the harness. Both attributes install a
//! `tracing_subscriber` fmt subscriber writing to the test output, filtered
//! by `RUST_LOG`; crates using them need `tracing-subscriber` (with
//! `env-filter`) as a dev-dependency.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitBool, LitInt, Token};

const DEFAULT_LIMIT_MILLIS: u64 = 60_000;

struct TimeoutArgs {
    limit_millis: u64,
    start_paused: Option<LitBool>,
}

fn positive(lit: &LitInt, scale: u64) -> syn::Result<u64> {
    let value: u64 = lit.base10_parse()?;
    if value == 0 {
        return Err(syn::Error::new(
            lit.span(),
            "timeout must be greater than zero",
        ));
    }
    value
        .checked_mul(scale)
        .ok_or_else(|| syn::Error::new(lit.span(), "timeout is too large"))
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            limit_millis: DEFAULT_LIMIT_MILLIS,
            start_paused: None,
        };

        if input.peek(LitInt) {
            let secs: LitInt = input.parse()?;
            args.limit_millis = positive(&secs, 1_000)?;
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            match key.to_string().as_str() {
                "secs" => args.limit_millis = positive(&input.parse::<LitInt>()?, 1_000)?,
                "millis" => args.limit_millis = positive(&input.parse::<LitInt>()?, 1)?,
                "start_paused" => args.start_paused = Some(input.parse()?),
                _ => {
                    return Err(syn::Error::new(
                        key.span(),
                        "expected `secs`, `millis` or `start_paused`",
                    ))
                }
            }
            if input.is_empty() {
                break;
            }
            input.parse::<Token![,]>()?;
        }

        Ok(args)
    }
}

fn init_test_logging() -> TokenStream2 {
    quote! {
        let _ = ::tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Spawns `body` on a named thread and waits at most `limit` for it.
fn run_with_limit(name: &Ident, body: TokenStream2) -> TokenStream2 {
    quote! {
        let (sender, receiver) = ::std::sync::mpsc::channel();
        ::std::thread::Builder::new()
            .name(stringify!(#name).into())
            .spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            })
            .expect("failed to spawn test thread");
        match receiver.recv_timeout(limit) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", limit)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let limit_millis = args.limit_millis;
    let paused = args.start_paused.as_ref().map_or(false, |paused| paused.value);
    // a paused clock jumps straight to the next timer, so only the
    // wall-clock limit applies there
    let (builder, body) = if paused {
        (
            quote! {
                ::tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
            },
            quote! { async move #block .await; },
        )
    } else {
        (
            quote! {
                ::tokio::runtime::Builder::new_current_thread()
                    .enable_all()
            },
            quote! {
                ::tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out");
            },
        )
    };
    let logging = init_test_logging();
    let runner = run_with_limit(
        &sig.ident,
        quote! {
            let runtime = #builder
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async { #body });
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #logging
            let limit = ::std::time::Duration::from_millis(#limit_millis);
            #runner
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    if let Some(paused) = &args.start_paused {
        return syn::Error::new_spanned(paused, "start_paused only applies to tokio_timeout_test")
            .to_compile_error()
            .into();
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let limit_millis = args.limit_millis;
    let logging = init_test_logging();
    let runner = run_with_limit(&sig.ident, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #logging
            let limit = ::std::time::Duration::from_millis(#limit_millis);
            #runner
        }
    })
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
