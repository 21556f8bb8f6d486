use proc_macro2::{Span, TokenStream};
use syn::Attribute;

pub(crate) fn parse_int(lit: &syn::Lit, span: Span, field: &str) -> Result<usize, syn::Error> {
    match lit {
        syn::Lit::Int(lit) => lit.base10_parse::<usize>().map_err(|e| {
            syn::Error::new(span, format!("Failed to parse value of `{field}` as integer: {e}"))
        }),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer."),
        )),
    }
}

/// `#[test]`, `#[core::prelude::*::test]` or `#[std::prelude::*::test]`.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };
    if path.segments.iter().any(|segment| !segment.arguments.is_none()) {
        return false;
    }

    let segments = path
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect::<Vec<_>>();

    match segments.as_slice() {
        [test] => path.leading_colon.is_none() && test == "test",
        [root, prelude, _, test] => {
            (root == "core" || root == "std") && prelude == "prelude" && test == "test"
        }
        _ => false,
    }
}

pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognizes_test_attributes() {
        let attrs: Vec<Attribute> = vec![
            syn::parse_quote!(#[test]),
            syn::parse_quote!(#[core::prelude::v1::test]),
            syn::parse_quote!(#[std::prelude::rust_2024::test]),
            syn::parse_quote!(#[tokio::test]),
            syn::parse_quote!(#[test(arg)]),
        ];
        let found = attrs.iter().map(is_test_attribute).collect::<Vec<_>>();
        assert_eq!(found, vec![true, true, true, false, false]);
    }

    #[test]
    fn test_parse_int_rejects_strings() {
        let span = Span::call_site();
        assert_eq!(parse_int(&syn::parse_quote!(4), span, "n").unwrap(), 4);
        assert!(parse_int(&syn::parse_quote!("4"), span, "n").is_err());
    }
}
