//! `Encode` / `Decode` derives for game packet bodies.
//!
//! Each field is classified into a [`Codec`] once, and both derives render
//! from that classification. Fields without attributes go through their
//! type's own impl (little-endian for fixed width integers); the
//! `#[encoding(..)]` attribute picks the variable-length forms Bedrock uses.
//!
//! Every body is destructured by reference first, so structs and enum
//! variants share the same field code.

use darling::{FromDeriveInput, FromField, FromMeta, FromVariant};
use proc_macro2::{Ident, TokenStream};
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Field, Fields};

#[derive(Default, Debug, FromField)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg), default)]
struct FieldAttrs {
    varuint: bool,
    varulong: bool,
    varint: bool,
    varlong: bool,
    /// `Option<T>` preceded by a presence flag.
    bool_prefixed: bool,
    length_prefix: Option<LengthPrefix>,
}

#[derive(Debug, Clone, Copy, FromMeta)]
enum LengthPrefix {
    #[darling(rename = "varuint")]
    VarUInt,
    #[darling(rename = "u16")]
    U16,
    #[darling(rename = "u32")]
    U32,
    /// Items run to the end of the packet. Last field only.
    #[darling(rename = "inferred")]
    Inferred,
}

#[derive(Debug, FromDeriveInput)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg))]
struct EnumAttrs {
    discriminant: Discriminant,
}

#[derive(Debug, Clone, Copy, FromMeta)]
enum Discriminant {
    #[darling(rename = "byte")]
    Byte,
    #[darling(rename = "varuint")]
    VarUInt,
}

#[derive(Debug, FromVariant)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg))]
struct VariantAttrs {
    id: i64,
}

#[derive(Debug, Clone, Copy)]
enum VarKind {
    UInt,
    ULong,
    Int,
    Long,
}

impl VarKind {
    fn write(self, value: TokenStream) -> TokenStream {
        let (method, ty) = match self {
            VarKind::UInt => (quote!(write_var_uint), quote!(u32)),
            VarKind::ULong => (quote!(write_var_ulong), quote!(u64)),
            VarKind::Int => (quote!(write_var_int), quote!(i32)),
            VarKind::Long => (quote!(write_var_long), quote!(i64)),
        };
        quote! { encoder.#method(#value.try_into().unwrap_or(#ty::MAX)); }
    }

    fn read(self) -> TokenStream {
        let method = match self {
            VarKind::UInt => quote!(read_var_uint),
            VarKind::ULong => quote!(read_var_ulong),
            VarKind::Int => quote!(read_var_int),
            VarKind::Long => quote!(read_var_long),
        };
        quote! { decoder.#method()?.try_into()? }
    }
}

/// How a single field is laid out on the wire.
#[derive(Debug, Clone, Copy)]
enum Codec {
    Plain,
    Var(VarKind),
    Optional,
    List(LengthPrefix),
}

impl Codec {
    fn classify(field: &Field) -> syn::Result<Self> {
        let attrs = FieldAttrs::from_field(field)?;
        let mut chosen = Vec::new();
        for (set, codec) in [
            (attrs.varuint, Codec::Var(VarKind::UInt)),
            (attrs.varulong, Codec::Var(VarKind::ULong)),
            (attrs.varint, Codec::Var(VarKind::Int)),
            (attrs.varlong, Codec::Var(VarKind::Long)),
            (attrs.bool_prefixed, Codec::Optional),
        ] {
            if set {
                chosen.push(codec);
            }
        }
        if let Some(prefix) = attrs.length_prefix {
            chosen.push(Codec::List(prefix));
        }
        match chosen.as_slice() {
            [] => Ok(Codec::Plain),
            [codec] => Ok(*codec),
            _ => Err(syn::Error::new_spanned(
                field,
                "at most one encoding option can be set",
            )),
        }
    }

    /// Writes the field held by reference in `binding`.
    fn write(self, binding: &Ident) -> TokenStream {
        match self {
            Codec::Plain => quote! {
                crate::protocol::Encode::encode(#binding, encoder);
            },
            Codec::Var(kind) => kind.write(quote!((*#binding))),
            Codec::Optional => quote! {
                encoder.write_bool(#binding.is_some());
                if let Some(inner) = #binding {
                    crate::protocol::Encode::encode(inner, encoder);
                }
            },
            Codec::List(prefix) => {
                let len = match prefix {
                    LengthPrefix::Inferred => TokenStream::new(),
                    LengthPrefix::VarUInt => {
                        quote! { encoder.write_var_uint(#binding.len().try_into().unwrap_or(u32::MAX)); }
                    }
                    LengthPrefix::U16 => {
                        quote! { encoder.write_u16_le(#binding.len().try_into().unwrap_or(u16::MAX)); }
                    }
                    LengthPrefix::U32 => {
                        quote! { encoder.write_u32_le(#binding.len().try_into().unwrap_or(u32::MAX)); }
                    }
                };
                quote! {
                    #len
                    for item in #binding.iter() {
                        crate::protocol::Encode::encode(item, encoder);
                    }
                }
            }
        }
    }

    /// An expression reading the field.
    fn read(self) -> TokenStream {
        match self {
            Codec::Plain => quote! { crate::protocol::Decode::decode(decoder)? },
            Codec::Var(kind) => kind.read(),
            Codec::Optional => quote! {
                match decoder.read_bool()? {
                    true => Some(crate::protocol::Decode::decode(decoder)?),
                    false => None,
                }
            },
            Codec::List(LengthPrefix::Inferred) => quote! {{
                let mut items = Vec::new();
                while !decoder.is_finished() {
                    items.push(crate::protocol::Decode::decode(decoder)?);
                }
                items
            }},
            Codec::List(prefix) => {
                let count = match prefix {
                    LengthPrefix::VarUInt => quote! { decoder.read_var_uint()? as usize },
                    LengthPrefix::U16 => quote! { usize::from(decoder.read_u16_le()?) },
                    _ => quote! { decoder.read_u32_le()? as usize },
                };
                // Every item takes at least one byte, which bounds the allocation.
                quote! {{
                    let count = #count;
                    if count > decoder.buffer().len() {
                        return Err(crate::protocol::DecodeError::EndOfStream(count));
                    }
                    (0..count)
                        .map(|_| crate::protocol::Decode::decode(decoder))
                        .collect::<::std::result::Result<Vec<_>, _>>()?
                }}
            }
        }
    }
}

/// The fields of a struct or of one enum variant.
struct Body {
    fields: Fields,
    bindings: Vec<Ident>,
    codecs: Vec<Codec>,
}

impl Body {
    fn new(fields: &Fields) -> syn::Result<Self> {
        let mut bindings = Vec::new();
        let mut codecs = Vec::new();
        for (index, field) in fields.iter().enumerate() {
            bindings.push(match &field.ident {
                Some(ident) => ident.clone(),
                None => format_ident!("__field{}", index),
            });
            codecs.push(Codec::classify(field)?);
        }
        Ok(Self {
            fields: fields.clone(),
            bindings,
            codecs,
        })
    }

    /// `path { a, b }`, `path(__field0)` or `path`, usable both as a
    /// pattern and as a constructor.
    fn shape(&self, path: TokenStream) -> TokenStream {
        let bindings = &self.bindings;
        match &self.fields {
            Fields::Named(_) => quote! { #path { #(#bindings),* } },
            Fields::Unnamed(_) => quote! { #path ( #(#bindings),* ) },
            Fields::Unit => path,
        }
    }

    fn write(&self) -> TokenStream {
        let writes = self
            .codecs
            .iter()
            .zip(&self.bindings)
            .map(|(codec, binding)| codec.write(binding));
        quote! { #(#writes)* }
    }

    fn read(&self, path: TokenStream) -> TokenStream {
        let bindings = &self.bindings;
        let reads = self.codecs.iter().map(|codec| codec.read());
        let construct = self.shape(path);
        quote! {
            #(let #bindings = #reads;)*
            Ok(#construct)
        }
    }
}

struct Variant {
    ident: Ident,
    id: i64,
    body: Body,
}

enum Shape {
    Struct(Body),
    Enum {
        discriminant: Discriminant,
        variants: Vec<Variant>,
    },
}

impl Shape {
    fn parse(input: &DeriveInput) -> syn::Result<Self> {
        match &input.data {
            Data::Struct(data) => Body::new(&data.fields).map(Shape::Struct),
            Data::Enum(data) => {
                let discriminant = EnumAttrs::from_derive_input(input)?.discriminant;
                let variants = data
                    .variants
                    .iter()
                    .map(|variant| {
                        Ok(Variant {
                            ident: variant.ident.clone(),
                            id: VariantAttrs::from_variant(variant)?.id,
                            body: Body::new(&variant.fields)?,
                        })
                    })
                    .collect::<syn::Result<_>>()?;
                Ok(Shape::Enum {
                    discriminant,
                    variants,
                })
            }
            Data::Union(data) => Err(syn::Error::new_spanned(
                data.union_token,
                "cannot derive Encode/Decode on a union",
            )),
        }
    }
}

fn write_discriminant(discriminant: Discriminant, variant: &Variant) -> syn::Result<TokenStream> {
    let span = variant.ident.span();
    match discriminant {
        Discriminant::Byte => {
            let id = u8::try_from(variant.id)
                .map_err(|_| syn::Error::new(span, "id does not fit in a byte"))?;
            Ok(quote! { encoder.write_u8(#id); })
        }
        Discriminant::VarUInt => {
            let id = u32::try_from(variant.id)
                .map_err(|_| syn::Error::new(span, "id does not fit in a u32"))?;
            Ok(quote! { encoder.write_var_uint(#id); })
        }
    }
}

pub fn derive_encode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let body = match Shape::parse(input)? {
        Shape::Struct(body) if body.bindings.is_empty() => TokenStream::new(),
        Shape::Struct(body) => {
            let pattern = body.shape(quote!(Self));
            let write = body.write();
            quote! {
                let #pattern = self;
                #write
            }
        }
        Shape::Enum {
            discriminant,
            variants,
        } => {
            let mut arms = Vec::with_capacity(variants.len());
            for variant in &variants {
                let ident = &variant.ident;
                let pattern = variant.body.shape(quote!(Self::#ident));
                let tag = write_discriminant(discriminant, variant)?;
                let write = variant.body.write();
                arms.push(quote! {
                    #pattern => {
                        #tag
                        #write
                    }
                });
            }
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
    };

    let ident = &input.ident;
    Ok(quote! {
        impl crate::protocol::Encode for #ident {
            #[allow(unused_variables)]
            fn encode(&self, encoder: &mut crate::protocol::Encoder) {
                #body
            }
        }
    })
}

pub fn derive_decode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let body = match Shape::parse(input)? {
        Shape::Struct(body) => body.read(quote!(Self)),
        Shape::Enum {
            discriminant,
            variants,
        } => {
            let read_tag = match discriminant {
                Discriminant::Byte => quote! { decoder.read_u8()? },
                Discriminant::VarUInt => quote! { decoder.read_var_uint()? },
            };
            let arms = variants.iter().map(|variant| {
                let ident = &variant.ident;
                let id = variant.id;
                let read = variant.body.read(quote!(Self::#ident));
                quote! { #id => { #read } }
            });
            quote! {
                let tag = i64::from(#read_tag);
                match tag {
                    #(#arms)*
                    other => Err(crate::protocol::DecodeError::Other(
                        ::anyhow::format_err!("invalid discriminant '{}'", other),
                    )),
                }
            }
        }
    };

    let ident = &input.ident;
    Ok(quote! {
        impl crate::protocol::Decode for #ident {
            #[allow(unused_variables)]
            fn decode(decoder: &mut crate::protocol::Decoder) -> ::std::result::Result<Self, crate::protocol::DecodeError> {
                #body
            }
        }
    })
}
