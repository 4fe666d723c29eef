use crate::utils::{apply_derives, has_field_named, prepend_managed_fields};
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    Expr, Item, Result, Token, Type,
    parse::{Parse, ParseStream},
    parse_macro_input,
};

const MANAGED_FIELDS: [&str; 2] = ["id", "creation_date"];

/// #[integration_event] 宏实现
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as IntegrationEventAttrConfig);
    let mut input = parse_macro_input!(item as Item);

    let st = match &mut input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(
                other.span(),
                "#[integration_event] can only be used on struct types",
            )
            .to_compile_error()
            .into();
        }
    };

    let Some(name) = cfg.name else {
        return syn::Error::new(
            st.ident.span(),
            "#[integration_event] requires an explicit name, e.g. #[integration_event(name = \"OrderCreated\")]",
        )
        .to_compile_error()
        .into();
    };

    if name.value().trim().is_empty() {
        return syn::Error::new(name.span(), "event name must not be empty")
            .to_compile_error()
            .into();
    }

    if !st.generics.params.is_empty() {
        return syn::Error::new(
            st.generics.span(),
            "#[integration_event] does not support generic structs",
        )
        .to_compile_error()
        .into();
    }

    // 单元结构体视为无业务字段的事件
    if matches!(st.fields, syn::Fields::Unit) {
        st.fields = syn::Fields::Named(syn::parse_quote!({}));
        st.semi_token = None;
    }

    let fields_named = match &mut st.fields {
        syn::Fields::Named(f) => f,
        other => {
            return syn::Error::new(
                other.span(),
                "#[integration_event] supports only named-field structs",
            )
            .to_compile_error()
            .into();
        }
    };

    // id / creation_date 由宏托管，禁止手写
    for managed in MANAGED_FIELDS {
        if has_field_named(fields_named, managed) {
            return syn::Error::new(
                fields_named.span(),
                format!("field `{managed}` is managed by #[integration_event]"),
            )
            .to_compile_error()
            .into();
        }
    }

    // 构造函数参数：按原字段顺序
    let ctor_params: Vec<_> = fields_named
        .named
        .iter()
        .map(|f| {
            let ident = &f.ident;
            let ty = &f.ty;
            quote! { #ident: #ty }
        })
        .collect();
    let ctor_fields: Vec<_> = fields_named
        .named
        .iter()
        .map(|f| f.ident.clone())
        .collect();

    let id_ty: Type = syn::parse_quote! { ::eventbus::__private::Uuid };
    let date_ty: Type = syn::parse_quote! {
        ::eventbus::__private::DateTime<::eventbus::__private::Utc>
    };
    prepend_managed_fields(
        fields_named,
        &[(MANAGED_FIELDS[0], &id_ty), (MANAGED_FIELDS[1], &date_ty)],
    );

    let required: Vec<syn::Path> = vec![
        syn::parse_quote!(Debug),
        syn::parse_quote!(Clone),
        syn::parse_quote!(PartialEq),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];
    apply_derives(&mut st.attrs, required);

    let ident = &st.ident;
    let vis = &st.vis;

    let out = quote! {
        #st

        impl #ident {
            /// 构造新事件，分配唯一标识与创建时间
            #[allow(clippy::too_many_arguments)]
            #vis fn new(#(#ctor_params),*) -> Self {
                Self {
                    id: ::eventbus::__private::Uuid::new_v4(),
                    creation_date: ::eventbus::__private::Utc::now(),
                    #(#ctor_fields,)*
                }
            }
        }

        impl ::eventbus::IntegrationEvent for #ident {
            const NAME: &'static str = #name;

            fn id(&self) -> ::eventbus::__private::Uuid {
                self.id
            }

            fn creation_date(&self) -> ::eventbus::__private::DateTime<::eventbus::__private::Utc> {
                self.creation_date
            }
        }
    };

    TokenStream::from(out)
}

// 解析宏键值参数：name = "<literal>"
struct IntegrationEventAttrConfig {
    name: Option<syn::LitStr>,
}

impl Parse for IntegrationEventAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name: Option<syn::LitStr> = None;

        if input.is_empty() {
            return Ok(Self { name });
        }

        let pairs: Punctuated<syn::MetaNameValue, Token![,]> =
            Punctuated::<syn::MetaNameValue, Token![,]>::parse_terminated(input)?;

        for kv in pairs {
            let Some(key) = kv.path.get_ident() else {
                return Err(syn::Error::new(kv.path.span(), "invalid attribute key"));
            };
            match key.to_string().as_str() {
                "name" => {
                    if name.is_some() {
                        return Err(syn::Error::new(
                            key.span(),
                            "duplicate key 'name' in attribute",
                        ));
                    }
                    let lit = match kv.value {
                        Expr::Lit(syn::ExprLit {
                            lit: syn::Lit::Str(lit),
                            ..
                        }) => lit,
                        other => {
                            return Err(syn::Error::new(
                                other.span(),
                                "expected string literal for 'name'",
                            ));
                        }
                    };
                    name = Some(lit);
                }
                _ => {
                    return Err(syn::Error::new(key.span(), "unknown key; expected 'name'"));
                }
            }
        }

        Ok(Self { name })
    }
}
