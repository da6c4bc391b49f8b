use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, Type,
    TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive `SharedMemorySafe` for a type placed in a page both peers map.
///
/// Both peers may be separate processes, possibly built for different
/// targets, so the derive rejects at compile time what cannot mean the same
/// thing on both sides of the mapping:
///
/// 1. **Layout not pinned down.** The type needs `#[repr(C)]` or
///    `#[repr(transparent)]`, or a fixed-width integer repr for enums.
///    `#[repr(usize)]` and `#[repr(isize)]` are refused.
/// 2. **Addresses.** References, raw pointers, `AtomicPtr`, and owning or
///    counted pointers (`Vec`, `Box`, `String`, `Rc`, `Arc`, ...) are
///    refused anywhere in a field's type.
/// 3. **Pointer-width integers.** `usize`, `isize`, `AtomicUsize` and
///    `AtomicIsize` change size between 32- and 64-bit peers.
/// 4. **Process-local locks.** `Mutex`, `RwLock`, `Condvar`, `Barrier`,
///    `Once`.
///
/// Every field type must in turn implement `SharedMemorySafe`; the derive
/// adds that bound to the generated impl.
///
/// # Safety
///
/// The generated impl is `unsafe impl`: the macro cannot check that shared
/// mutable state is only touched through atomics, nor that the type does not
/// rely on `Drop` (a crashed peer never runs it).
///
/// # Example
///
/// ```
/// # use evring::SharedMemorySafe;
/// use std::sync::atomic::AtomicU32;
///
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct Mailbox {
///     prod: AtomicU32,
///     cons: AtomicU32,
///     slots: [u64; 16],
/// }
/// ```
///
/// ```compile_fail
/// # use evring::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// struct NoRepr {
///     x: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use evring::SharedMemorySafe;
/// use std::sync::atomic::AtomicUsize;
///
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct PointerWidth {
///     index: AtomicUsize,
/// }
/// ```
///
/// ```compile_fail
/// # use evring::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct Heap {
///     data: Vec<u8>,
/// }
/// ```
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

/// Path to the `evring` crate as seen from the deriving crate.
fn evring_path() -> proc_macro2::TokenStream {
    match crate_name("evring") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        // Inside evring itself `extern crate self as evring` makes this work.
        Ok(FoundCrate::Itself) | Err(_) => quote!(::evring),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    require_stable_repr(input)?;
    let field_types = field_types(&input.data)?;
    for ty in &field_types {
        reject_unshareable(ty)?;
    }

    let evring = evring_path();
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let existing = where_clause.into_iter().flat_map(|w| w.predicates.iter());

    Ok(quote! {
        unsafe impl #impl_generics #evring::__SharedMemorySafePrivate for #name #ty_generics
        where
            #(#existing,)*
            #(#field_types: #evring::__SharedMemorySafePrivate,)*
        {}
    })
}

const STABLE_REPRS: &[&str] = &[
    "C",
    "transparent",
    "u8",
    "u16",
    "u32",
    "u64",
    "i8",
    "i16",
    "i32",
    "i64",
];

fn is_stable_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }
    let mut stable = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident()
            && STABLE_REPRS.iter().any(|repr| ident == repr)
        {
            stable = true;
        }
        // Skip arguments such as `align(64)`.
        if meta.input.peek(syn::token::Paren) {
            let args;
            syn::parenthesized!(args in meta.input);
            args.parse::<proc_macro2::TokenStream>()?;
        }
        Ok(())
    })?;
    Ok(stable)
}

fn require_stable_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if is_stable_repr(attr)? {
            return Ok(());
        }
    }
    let msg = match input.data {
        Data::Enum(_) => {
            "SharedMemorySafe requires #[repr(C)] or a fixed-width integer repr such as \
             #[repr(u8)] or #[repr(u32)] on enums"
        }
        _ => "SharedMemorySafe requires #[repr(C)] or #[repr(transparent)]",
    };
    Err(Error::new(input.ident.span(), msg))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of(fields: &Fields) -> impl Iterator<Item = Type> + '_ {
        fields.iter().map(|field| field.ty.clone())
    }

    match data {
        Data::Struct(data) => Ok(of(&data.fields).collect()),
        Data::Enum(data) => Ok(data.variants.iter().flat_map(|v| of(&v.fields)).collect()),
        Data::Union(data) => Err(Error::new(
            data.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Why a type name cannot appear in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unshareable {
    Address,
    PointerWidth,
    ProcessLocal,
}

impl Unshareable {
    fn classify(ident: &Ident) -> Option<Self> {
        const ADDRESS: &[&str] = &[
            "Vec", "Box", "String", "PathBuf", "OsString", "CString", "Rc", "Arc", "AtomicPtr",
        ];
        const POINTER_WIDTH: &[&str] = &["usize", "isize", "AtomicUsize", "AtomicIsize"];
        const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier", "Once"];

        let listed = |names: &[&str]| names.iter().any(|name| ident == name);
        if listed(ADDRESS) {
            Some(Self::Address)
        } else if listed(POINTER_WIDTH) {
            Some(Self::PointerWidth)
        } else if listed(PROCESS_LOCAL) {
            Some(Self::ProcessLocal)
        } else {
            None
        }
    }

    fn help(self) -> &'static str {
        match self {
            Self::Address => {
                "holds an address, which means nothing in the peer's mapping\n\
                 help: store the data inline, e.g. `[u8; N]`"
            }
            Self::PointerWidth => {
                "changes size between 32- and 64-bit peers\n\
                 help: use a fixed-width type such as `u32` or `AtomicU64`"
            }
            Self::ProcessLocal => {
                "only synchronizes threads of one process\n\
                 help: use atomics such as `AtomicU32` for cross-process state"
            }
        }
    }
}

fn reject_unshareable(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        let fail = |span: proc_macro2::Span,
                    what: &dyn std::fmt::Display,
                    why: &str|
         -> syn::Result<()> {
            Err(Error::new(
                span,
                format!("field type `{}` contains {what}, which {why}", quote!(#field_ty)),
            ))
        };

        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    if let Some(kind) = Unshareable::classify(&segment.ident) {
                        let what = format!("`{}`", segment.ident);
                        return fail(segment.ident.span(), &what, kind.help());
                    }
                    if let PathArguments::AngleBracketed(args) = &segment.arguments {
                        for arg in &args.args {
                            if let GenericArgument::Type(inner) = arg {
                                walk(inner, field_ty)?;
                            }
                        }
                    }
                }
                Ok(())
            }
            Type::Reference(r) => fail(r.span(), &"a reference", Unshareable::Address.help()),
            Type::Ptr(p) => fail(p.span(), &"a raw pointer", Unshareable::Address.help()),
            Type::Tuple(tuple) => tuple.elems.iter().try_for_each(|elem| walk(elem, field_ty)),
            Type::Array(array) => walk(&array.elem, field_ty),
            Type::Group(group) => walk(&group.elem, field_ty),
            Type::Paren(paren) => walk(&paren.elem, field_ty),
            _ => Ok(()),
        }
    }

    walk(field_ty, field_ty)
}
