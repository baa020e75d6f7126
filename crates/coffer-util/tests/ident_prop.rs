//! Property tests for identity parsing.

use bstr::ByteSlice;
use coffer_util::{Ident, When};
use proptest::prelude::*;

proptest! {
    #[test]
    fn when_roundtrips_through_ident(seconds in 0i64..=4_000_000_000, hours in -14i32..=14, minutes in 0i32..=59) {
        let offset = if hours < 0 {
            -(hours.abs() * 60 + minutes)
        } else {
            hours * 60 + minutes
        };
        let ident = Ident::new("Prop Tester", "prop@example.com", When::new(seconds, offset));
        let parsed = Ident::parse(ident.to_bytes().as_bstr()).unwrap();
        prop_assert_eq!(parsed.when.seconds, seconds);
        prop_assert_eq!(parsed.when.offset_minutes, offset);
    }

    #[test]
    fn arbitrary_names_roundtrip(name in "[a-zA-Z][a-zA-Z ._-]{0,30}[a-zA-Z]") {
        let ident = Ident::new(name.as_str(), "n@example.com", When::new(10, 0));
        let parsed = Ident::parse(ident.to_bytes().as_bstr()).unwrap();
        prop_assert_eq!(parsed.name, name.trim().as_bytes());
    }
}
