use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse,
    parse_macro_input,
    Data,
    DeriveInput,
    Expr,
    Fields,
};

/// Turns `TriggerPeriod` into `TRIGGER_PERIOD`, keeping existing underscores and digits attached
/// to the word they follow (`AdcAddress0Read` -> `ADC_ADDRESS0_READ`).
fn screaming_snake(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 8);
    let chars: Vec<char> = ident.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev != '_' && (prev.is_lowercase() || prev.is_ascii_digit() || next_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_uppercase());
    }
    out
}

#[proc_macro_derive(RegisterMap)]
/// Derived on a fieldless `#[repr(u8)]` enum whose discriminants are register addresses. Generates
/// the `RegisterMap` impl: the full register list, address and name lookups.
pub fn derive_register_map(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let name = input.ident;
    let Data::Enum(data) = input.data else {
        return syn::Error::new_spanned(&name, "RegisterMap can only be derived on enums")
            .to_compile_error()
            .into();
    };

    let mut variants = vec![];
    let mut names = vec![];
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return syn::Error::new_spanned(variant, "Register variants can't carry data")
                .to_compile_error()
                .into();
        }
        if !matches!(variant.discriminant, Some((_, Expr::Lit(_)))) {
            return syn::Error::new_spanned(variant, "Registers need a literal address")
                .to_compile_error()
                .into();
        }
        variants.push(variant.ident.clone());
        names.push(screaming_snake(&variant.ident.to_string()));
    }

    let generated = quote! {
        impl RegisterMap for #name {
            const ALL: &'static [Self] = &[#(Self::#variants),*];

            fn addr(self) -> u8 {
                self as u8
            }

            fn name(self) -> &'static str {
                match self {
                    #(Self::#variants => #names),*
                }
            }
        }
    };
    TokenStream::from(generated)
}

#[proc_macro_attribute]
/// Attaches a register address to a packed register struct by implementing `Address`
pub fn address(attr: TokenStream, item: TokenStream) -> TokenStream {
    let num = match parse::<syn::Lit>(attr) {
        Ok(syn::Lit::Int(v)) => v,
        Ok(other) => {
            return syn::Error::new_spanned(other, "The address must be a literal integer")
                .to_compile_error()
                .into()
        }
        Err(e) => return e.to_compile_error().into(),
    };
    let item = parse_macro_input!(item as DeriveInput);
    let ident = item.ident.clone();

    let generated = quote! {
        impl Address for #ident {
            fn addr() -> u8 {
                #num as u8
            }
        }
        #item
    };
    TokenStream::from(generated)
}

#[cfg(test)]
mod tests {
    use super::screaming_snake;

    #[test]
    fn test_names() {
        assert_eq!(screaming_snake("TriggerPeriod"), "TRIGGER_PERIOD");
        assert_eq!(screaming_snake("PulseNTrigger"), "PULSE_N_TRIGGER");
        assert_eq!(screaming_snake("AdcAddress0Read"), "ADC_ADDRESS0_READ");
        assert_eq!(screaming_snake("ThresCurr0"), "THRES_CURR0");
        assert_eq!(screaming_snake("GITHASH_LSB"), "GITHASH_LSB");
        assert_eq!(screaming_snake("Adc00"), "ADC00");
        assert_eq!(screaming_snake("IOExpanderBias"), "IO_EXPANDER_BIAS");
    }
}
