// Copyright (C) Microsoft Corporation. All rights reserved.

//! Attribute macro behind `test_with_tracing::test`.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Nothing;
use syn::parse_macro_input;
use syn::parse_quote;
use syn::ItemFn;

/// Marks a function as a test and installs the tracing subscriber before the
/// body runs.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    parse_macro_input!(attr as Nothing);
    let mut item = parse_macro_input!(item as ItemFn);

    let body = &item.block;
    item.block = parse_quote!({
        ::test_with_tracing::init();
        #body
    });

    quote! {
        #[::core::prelude::v1::test]
        #item
    }
    .into()
}
