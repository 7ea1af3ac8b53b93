use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields};

/// Emits `impl From<Payload> for Enum` for each `Variant(Payload)`.
///
/// Variants with zero or several fields are skipped, as are payload types
/// that appear in more than one variant (the impls would conflict).
pub fn derive_from_variants_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "FromVariants can only be derived on enums",
        ));
    };

    let single_field_variants: Vec<_> = data
        .variants
        .iter()
        .filter_map(|variant| match &variant.fields {
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                let ty = &fields.unnamed[0].ty;
                Some((&variant.ident, ty, quote!(#ty).to_string()))
            }
            _ => None,
        })
        .collect();

    let enum_ident = &input.ident;
    let impls = single_field_variants
        .iter()
        .filter(|(_, _, key)| {
            single_field_variants
                .iter()
                .filter(|(_, _, other)| other == key)
                .count()
                == 1
        })
        .map(|(variant_ident, ty, _)| {
            quote! {
                impl ::std::convert::From<#ty> for #enum_ident {
                    fn from(value: #ty) -> Self {
                        Self::#variant_ident(value)
                    }
                }
            }
        });

    Ok(quote! {
        #(#impls)*
    })
}
