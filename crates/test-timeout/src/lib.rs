use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, ReturnType};

/// Environment variable holding a multiplier applied to every timeout, for
/// machines where nested X servers are slow to come up.
const SCALE_VAR: &str = "TEST_TIMEOUT_SCALE";

/// Runs a synchronous test on its own thread and fails it if it does not
/// finish within the given number of seconds (default 60).
///
/// ```ignore
/// #[test_timeout::timeout(30)]
/// fn session_comes_up() { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut timeout_secs: u64 = 60;

    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        timeout_secs = match lit.base10_parse() {
            Ok(value) => value,
            Err(err) => return err.to_compile_error().into(),
        };
        if timeout_secs == 0 {
            return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                .to_compile_error()
                .into();
        }
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
    if !matches!(sig.output, ReturnType::Default) {
        return syn::Error::new_spanned(
            &sig.output,
            "timeout attribute expects a test returning ()",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let test_name = sig.ident.to_string();
    let scale_var = SCALE_VAR;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let scale = std::env::var(#scale_var)
                .ok()
                .and_then(|value| value.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value > 0.0)
                .unwrap_or(1.0);
            let timeout_duration = std::time::Duration::from_secs_f64(#timeout_secs as f64 * scale);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#test_name.to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block ));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test `{}` timed out after {:?}", #test_name, timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test `{}` failed before reporting a result", #test_name)
                }
            }
        }
    })
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
