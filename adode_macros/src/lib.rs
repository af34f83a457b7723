use proc_macro::TokenStream;
use quote::quote;
use syn::{
    fold::Fold,
    parse::{ParseStream, Parser},
    parse_macro_input, parse_quote,
    punctuated::Punctuated,
    Expr, ExprCast, ExprLit, ExprMacro, FnArg, Ident, ItemFn, Lit, ReturnType, Token, Type,
};

/// Turns a plain right-hand side
///
/// ```ignore
/// #[ode_rhs(Lotka)]
/// fn lotka(t: f64, y: &[f64], p: &[f64]) -> Vec<f64> { ... }
/// ```
///
/// into the original function plus a unit struct `Lotka` implementing
/// `adode::ode::OdeRhs`. In the generated `eval`, every `f64` type becomes the
/// scalar parameter, float literals are lifted with `Scalar::from_f64` and
/// `expr as f64` casts are lifted likewise. Math must use method syntax
/// (`y[0].exp()`, not `f64::exp(y[0])`).
#[proc_macro_attribute]
pub fn ode_rhs(attr: TokenStream, item: TokenStream) -> TokenStream {
    let rhs_name = parse_macro_input!(attr as Ident);
    let item_fn = parse_macro_input!(item as ItemFn);
    expand_fn(rhs_name, item_fn)
}

fn expand_fn(rhs_name: Ident, item_fn: ItemFn) -> TokenStream {
    let vis = &item_fn.vis;

    if item_fn.sig.inputs.len() != 3 {
        return syn::Error::new_spanned(
            &item_fn.sig.inputs,
            "ode_rhs functions take exactly (t: f64, y: &[f64], params: &[f64])",
        )
        .to_compile_error()
        .into();
    }
    if let Some(receiver) = item_fn.sig.receiver() {
        return syn::Error::new_spanned(receiver, "ode_rhs cannot be applied to methods")
            .to_compile_error()
            .into();
    }
    let output = match &item_fn.sig.output {
        ReturnType::Type(_, ty) => ty.clone(),
        ReturnType::Default => {
            return syn::Error::new_spanned(
                &item_fn.sig,
                "ode_rhs functions must return Vec<f64>",
            )
            .to_compile_error()
            .into();
        }
    };

    let mut folder = ScalarFolder;
    let inputs: Vec<FnArg> = item_fn
        .sig
        .inputs
        .iter()
        .cloned()
        .map(|arg| folder.fold_fn_arg(arg))
        .collect();
    let output = folder.fold_type(*output);
    let body = folder.fold_block((*item_fn.block).clone());

    let expanded = quote! {
        #item_fn

        #[derive(Clone, Copy, Debug, Default)]
        #vis struct #rhs_name;

        impl ::adode::ode::OdeRhs for #rhs_name {
            #[allow(unused_parens, clippy::all)]
            fn eval<S: ::adode::Scalar>(&self, #(#inputs),*) -> #output {
                #[allow(unused_imports)]
                use ::adode::Scalar as _;
                #body
            }
        }
    };

    expanded.into()
}

fn is_f64(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path.qself.is_none() && path.path.is_ident("f64"),
        _ => false,
    }
}

/// Rewrites `f64` code into code generic over `S: Scalar`.
struct ScalarFolder;

impl Fold for ScalarFolder {
    fn fold_type(&mut self, ty: Type) -> Type {
        if is_f64(&ty) {
            parse_quote!(S)
        } else {
            syn::fold::fold_type(self, ty)
        }
    }

    fn fold_expr(&mut self, expr: Expr) -> Expr {
        match expr {
            Expr::Lit(ExprLit {
                lit: Lit::Float(lit),
                ..
            }) => parse_quote!(<S as ::adode::Scalar>::from_f64(#lit)),
            Expr::Cast(ExprCast { expr, ty, .. }) if is_f64(&ty) => {
                let inner = self.fold_expr(*expr);
                parse_quote!(<S as ::adode::Scalar>::from_f64((#inner) as f64))
            }
            Expr::Macro(mac) if mac.mac.path.is_ident("vec") => self.fold_vec(mac),
            other => syn::fold::fold_expr(self, other),
        }
    }
}

impl ScalarFolder {
    /// Folds the elements of `vec![a, b, ..]` and `vec![x; n]`, which the
    /// default fold leaves as opaque tokens.
    fn fold_vec(&mut self, mac: ExprMacro) -> Expr {
        let tokens: proc_macro2::TokenStream = mac.mac.tokens.clone();
        if let Ok((elem, len)) = parse_repeat.parse2(tokens.clone()) {
            let elem = self.fold_expr(elem);
            return parse_quote!(::std::vec![#elem; #len]);
        }
        match Punctuated::<Expr, Token![,]>::parse_terminated.parse2(tokens) {
            Ok(elems) => {
                let elems = elems.into_iter().map(|e| self.fold_expr(e));
                parse_quote!(::std::vec![#(#elems),*])
            }
            Err(_) => Expr::Macro(mac),
        }
    }
}

fn parse_repeat(input: ParseStream) -> syn::Result<(Expr, Expr)> {
    let elem: Expr = input.parse()?;
    input.parse::<Token![;]>()?;
    let len: Expr = input.parse()?;
    Ok((elem, len))
}
