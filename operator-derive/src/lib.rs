use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Type, parse_macro_input};

/// Implements `crate::conditions::Conditions` for a status struct.
///
/// The struct must have a named `conditions: Option<Vec<Condition>>` field.
#[proc_macro_derive(Conditions)]
pub fn derive_conditions(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let field = match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => named
                .named
                .iter()
                .find(|f| f.ident.as_ref().is_some_and(|i| i == "conditions")),
            _ => None,
        },
        _ => None,
    };
    let Some(field) = field else {
        return syn::Error::new_spanned(
            name,
            "#[derive(Conditions)] requires a named `conditions` field",
        )
        .to_compile_error()
        .into();
    };
    if !is_option(&field.ty) {
        return syn::Error::new_spanned(
            &field.ty,
            "`conditions` must be an Option<Vec<Condition>>",
        )
        .to_compile_error()
        .into();
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let expanded = quote! {
        impl #impl_generics crate::conditions::Conditions for #name #ty_generics #where_clause {
            fn conditions(&self) -> &Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>> {
                &self.conditions
            }
            fn conditions_mut(&mut self) -> &mut Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>> {
                &mut self.conditions
            }
        }
    };

    TokenStream::from(expanded)
}

fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(p) => p.path.segments.last().is_some_and(|s| s.ident == "Option"),
        _ => false,
    }
}
