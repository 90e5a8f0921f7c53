//! Message derive macro implementation.
//!
//! `#[derive(Message)]` generates:
//!
//! 1. `impl Message` with a `static` descriptor linked to its parent
//! 2. `view_as` delegating to the parent field, so handlers registered for an
//!    ancestor can borrow the ancestor's view
//! 3. `value_as` serializing that same view, which is what broker entities
//!    bound to an ancestor put on the wire
//! 4. `impl Deref` to the parent field, when one exists

use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitStr, Type, spanned::Spanned};

// ============================================================================
// Attribute structures
// ============================================================================

#[derive(Default)]
struct StructAttrs {
    kind: Option<(String, Span)>,
    name: Option<String>,
}

// ============================================================================
// Entry point
// ============================================================================

pub fn derive_message(input: &DeriveInput) -> syn::Result<TokenStream> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "Message cannot be derived for generic types",
        ));
    }

    let attrs = parse_struct_attrs(&input.attrs)?;
    match &input.data {
        Data::Struct(data) => {
            let parent = find_parent_field(&data.fields)?;
            generate_impl(&input.ident, &attrs, parent)
        }
        Data::Enum(_) => Err(syn::Error::new(
            input.span(),
            "Message does not support enums. Use structs with a parent field instead.",
        )),
        Data::Union(_) => Err(syn::Error::new(
            input.span(),
            "Message cannot be derived for unions",
        )),
    }
}

// ============================================================================
// Attribute parsing
// ============================================================================

fn parse_struct_attrs(attrs: &[Attribute]) -> syn::Result<StructAttrs> {
    let mut result = StructAttrs::default();

    for attr in attrs {
        if !attr.path().is_ident("message") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("kind") {
                let lit = meta.value()?.parse::<LitStr>()?;
                result.kind = Some((lit.value(), lit.span()));
            } else if meta.path.is_ident("name") {
                result.name = Some(meta.value()?.parse::<LitStr>()?.value());
            } else {
                return Err(meta.error("expected `kind` or `name`"));
            }
            Ok(())
        })?;
    }

    Ok(result)
}

fn is_parent_field(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut is_parent = false;

    for attr in attrs {
        if !attr.path().is_ident("message") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("parent") {
                is_parent = true;
                Ok(())
            } else {
                Err(meta.error("expected `parent`"))
            }
        })?;
    }

    Ok(is_parent)
}

fn find_parent_field(fields: &Fields) -> syn::Result<Option<(Ident, Type)>> {
    let mut parent: Option<(Ident, Type)> = None;

    let Fields::Named(named) = fields else {
        for field in fields {
            if is_parent_field(&field.attrs)? {
                return Err(syn::Error::new(
                    field.span(),
                    "#[message(parent)] requires a named field",
                ));
            }
        }
        return Ok(None);
    };

    for field in &named.named {
        if !is_parent_field(&field.attrs)? {
            continue;
        }
        if parent.is_some() {
            return Err(syn::Error::new(
                field.span(),
                "only one field can be marked #[message(parent)]",
            ));
        }
        let Some(ident) = field.ident.clone() else {
            continue;
        };
        parent = Some((ident, field.ty.clone()));
    }

    Ok(parent)
}

// ============================================================================
// Code generation
// ============================================================================

fn generate_impl(
    name: &Ident,
    attrs: &StructAttrs,
    parent: Option<(Ident, Type)>,
) -> syn::Result<TokenStream> {
    let short_name = name.to_string();
    let full_name = match &attrs.name {
        Some(custom) => quote! { #custom },
        None => quote! { concat!(module_path!(), "::", #short_name) },
    };

    let parent_fn = match (&parent, &attrs.kind) {
        (Some(_), Some((_, span))) => {
            return Err(syn::Error::new(
                *span,
                "`kind` is inherited from the parent field and cannot be set here",
            ));
        }
        (Some((_, ty)), None) => quote! { <#ty as ::courier_core::Message>::message_type },
        (None, Some((kind, span))) => match kind.as_str() {
            "command" => quote! { ::courier_core::command },
            "query" => quote! { ::courier_core::query },
            "event" | "domain_event" => quote! { ::courier_core::domain_event },
            other => {
                return Err(syn::Error::new(
                    *span,
                    format!("unknown message kind `{other}`, expected command, query or event"),
                ));
            }
        },
        (None, None) => {
            return Err(syn::Error::new(
                name.span(),
                "Message requires #[message(kind = \"...\")] or a #[message(parent)] field",
            ));
        }
    };

    let view_parent = match &parent {
        Some((field, ty)) => quote! {
            <#ty as ::courier_core::Message>::view_as(&self.#field, ty)
        },
        None => quote! { ::std::option::Option::None },
    };

    let value_parent = match &parent {
        Some((field, ty)) => quote! {
            <#ty as ::courier_core::Message>::value_as(&self.#field, ty)
        },
        None => quote! { ::std::option::Option::None },
    };

    let deref_impl = parent.as_ref().map(|(field, ty)| {
        quote! {
            impl ::std::ops::Deref for #name {
                type Target = #ty;

                fn deref(&self) -> &Self::Target {
                    &self.#field
                }
            }
        }
    });

    Ok(quote! {
        impl ::courier_core::Message for #name {
            fn message_type() -> &'static ::courier_core::MessageType {
                static TYPE: ::courier_core::MessageType =
                    ::courier_core::MessageType::new(#full_name, #short_name, #parent_fn);
                &TYPE
            }

            fn view_as(
                &self,
                ty: &::courier_core::MessageType,
            ) -> ::std::option::Option<&dyn ::std::any::Any> {
                if ty == <Self as ::courier_core::Message>::message_type() {
                    return ::std::option::Option::Some(self as &dyn ::std::any::Any);
                }
                #view_parent
            }

            fn value_as(
                &self,
                ty: &::courier_core::MessageType,
            ) -> ::std::option::Option<::courier_core::CodecResult<::courier_core::__JsonValue>> {
                if ty == <Self as ::courier_core::Message>::message_type() {
                    return ::std::option::Option::Some(
                        <Self as ::courier_core::AnyMessage>::to_value(self),
                    );
                }
                #value_parent
            }
        }

        #deref_impl
    })
}
