//! Derives for AquaRelay's packet codec.

use proc_macro::TokenStream;
use syn::DeriveInput;

mod from_variants;
mod protocol;

/// Derives `Encode` for a game packet body or a tagged enum.
#[proc_macro_derive(Encode, attributes(encoding))]
pub fn derive_encode(input: TokenStream) -> TokenStream {
    expand(input, protocol::derive_encode_on)
}

/// Derives `Decode` for a game packet body or a tagged enum.
#[proc_macro_derive(Decode, attributes(encoding))]
pub fn derive_decode(input: TokenStream) -> TokenStream {
    expand(input, protocol::derive_decode_on)
}

/// Generates `From<Variant>` for every single-field tuple variant.
#[proc_macro_derive(FromVariants)]
pub fn derive_from_variants(input: TokenStream) -> TokenStream {
    expand(input, from_variants::derive_from_variants_on)
}

fn expand(
    input: TokenStream,
    derive: fn(&DeriveInput) -> syn::Result<proc_macro2::TokenStream>,
) -> TokenStream {
    match syn::parse::<DeriveInput>(input) {
        Ok(input) => derive(&input).unwrap_or_else(syn::Error::into_compile_error).into(),
        Err(e) => e.into_compile_error().into(),
    }
}
