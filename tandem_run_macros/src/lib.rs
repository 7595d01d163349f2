use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, ItemFn};

/// Runs `async fn main` on a current-thread tokio runtime with the
/// process-wide bridge running for the whole body.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;
    let output = &input.sig.output;

    if input.sig.asyncness.is_none() {
        return quote! { compile_error!("the #[tandem_run::main] function must be async"); }.into();
    }

    if name != "main" {
        return quote! {
            compile_error!("#[tandem_run::main] can only be applied to the `main` function");
        }
        .into();
    }

    if !input.sig.inputs.is_empty() {
        return quote! { compile_error!("the #[tandem_run::main] function takes no arguments"); }
            .into();
    }

    let inner = format_ident!("__tandem_main");
    let result = quote! {
        #(#attrs)*
        #vis fn main() #output {
            async fn #inner() #output #body

            let runtime = ::tandem_run::__private::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build the tokio runtime");

            match runtime.block_on(::tandem_run::run_in_background(#inner)) {
                Ok(output) => output,
                Err(err) => panic!("bridge failed: {err}"),
            }
        }
    };
    result.into()
}
