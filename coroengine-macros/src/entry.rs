use crate::parse::{is_test_attribute, parse_int, token_stream_with_error};
use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::spanned::Spanned;
use syn::{AttrStyle, ItemFn};

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const KNOBS: &str = "`worker_threads`, `timer_threads`";

/// Config used in case of the attribute not being able to build a valid config
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    worker_threads: None,
    timer_threads: None,
};

#[derive(Clone, Copy, PartialEq)]
enum Entry {
    Main,
    Test,
}

impl Entry {
    fn macro_name(self) -> &'static str {
        match self {
            Entry::Main => "coroengine::main",
            Entry::Test => "coroengine::test",
        }
    }
}

/// Expands
///
/// ```ignore
/// #[coroengine::main(worker_threads = 2)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// into a sync `main` that builds a task processor with the requested knobs
/// and blocks on the async body.
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // On failure still expand to something close to the input so IDE
    // completions keep working, with the error attached.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, Entry::Main))
    };

    match config {
        Ok(config) => parse_knobs(input, Entry::Main, config),
        Err(e) => token_stream_with_error(parse_knobs(input, Entry::Main, DEFAULT_ERROR_CONFIG), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, Entry::Test))
    };

    match config {
        Ok(config) => parse_knobs(input, Entry::Test, config),
        Err(e) => token_stream_with_error(parse_knobs(input, Entry::Test, DEFAULT_ERROR_CONFIG), e),
    }
}

struct FinalConfig {
    worker_threads: Option<usize>,
    timer_threads: Option<usize>,
}

struct ConfigBuilder {
    entry: Entry,
    worker_threads: Option<usize>,
    timer_threads: Option<usize>,
}

impl ConfigBuilder {
    fn new(entry: Entry) -> Self {
        ConfigBuilder {
            entry,
            worker_threads: None,
            timer_threads: None,
        }
    }

    fn set_threads(
        slot: &mut Option<usize>,
        lit: &syn::Lit,
        span: Span,
        field: &str,
    ) -> Result<(), syn::Error> {
        if slot.is_some() {
            return Err(syn::Error::new(span, format!("`{field}` set multiple times.")));
        }

        let value = parse_int(lit, span, field)?;
        if value == 0 {
            return Err(syn::Error::new(span, format!("`{field}` may not be 0.")));
        }
        *slot = Some(value);

        Ok(())
    }

    fn build(&self) -> FinalConfig {
        // Tests default to a single worker, like a dedicated test processor.
        let worker_threads = match (self.entry, self.worker_threads) {
            (_, Some(n)) => Some(n),
            (Entry::Test, None) => Some(1),
            (Entry::Main, None) => None,
        };

        FinalConfig {
            worker_threads,
            timer_threads: self.timer_threads,
        }
    }
}

fn build_config(input: &ItemFn, args: AttributeArgs, entry: Entry) -> Result<FinalConfig, syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }

    let mut config = ConfigBuilder::new(entry);

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&namevalue, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "worker_threads" => {
                        ConfigBuilder::set_threads(&mut config.worker_threads, lit, lit.span(), "worker_threads")?;
                    }
                    "timer_threads" => {
                        ConfigBuilder::set_threads(&mut config.timer_threads, lit, lit.span(), "timer_threads")?;
                    }
                    name => {
                        let msg = format!("Unknown attribute {name} is specified; expected one of: {KNOBS}");
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "worker_threads" | "timer_threads" => {
                        format!("The `{name}` attribute requires an argument, e.g. #[{}({name} = 2)].", entry.macro_name())
                    }
                    name => format!("Unknown attribute {name} is specified; expected one of: {KNOBS}."),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(other, "Unknown attribute inside the macro"));
            }
        }
    }

    Ok(config.build())
}

fn parse_knobs(input: ItemFn, entry: Entry, config: FinalConfig) -> TokenStream {
    let ItemFn {
        mut attrs,
        vis,
        mut sig,
        block,
    } = input;
    sig.asyncness = None;

    // If a type mismatch occurs, rustc points at the last statement.
    let span = block.stmts.last().map_or_else(Span::call_site, Spanned::span);

    let mut processor = quote_spanned! {span=>
        coroengine::TaskProcessor::builder()
    };
    if let Some(n) = config.worker_threads {
        processor = quote_spanned! {span=> #processor.worker_threads(#n) };
    }
    if let Some(n) = config.timer_threads {
        processor = quote_spanned! {span=> #processor.timer_threads(#n) };
    }

    // Inner attributes cannot stay on the generated block, lift them onto
    // the function like `syn` does.
    for attr in &mut attrs {
        attr.style = AttrStyle::Outer;
    }

    let generated_attrs = match entry {
        Entry::Test => quote! { #[::core::prelude::v1::test] },
        Entry::Main => quote! {},
    };

    // The body runs as a task, so it must be `Send + 'static`. Tests box it to
    // keep `block_on` from being instantiated once per test.
    let body = match entry {
        Entry::Test => {
            let output_type = match &sig.output {
                syn::ReturnType::Default => quote! { () },
                syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
            };
            quote! {
                let body: ::core::pin::Pin<::std::boxed::Box<
                    dyn ::core::future::Future<Output = #output_type> + ::core::marker::Send
                >> = ::std::boxed::Box::pin(async move #block);
            }
        }
        Entry::Main => quote! {
            let body = async move #block;
        },
    };

    let last_block = quote_spanned! {span=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            return #processor
                .try_build()
                .expect("Failed building the TaskProcessor")
                .block_on(body);
        }
    };

    quote! {
        #(#attrs)*
        #generated_attrs
        #vis #sig {
            #body
            #last_block
        }
    }
}
