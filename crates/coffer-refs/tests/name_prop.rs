//! Property tests over ref-name rules.

use coffer_refs::RefName;
use proptest::prelude::*;

fn component() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9_-]{0,8}"
}

proptest! {
    #[test]
    fn generated_branch_names_validate(a in component(), b in component()) {
        let name = format!("refs/heads/{a}/{b}");
        prop_assert!(RefName::new(name).is_ok());
    }

    #[test]
    fn prefixes_are_exactly_the_slash_cuts(a in component(), b in component(), c in component()) {
        let name = RefName::new(format!("refs/{a}/{b}/{c}")).unwrap();
        let prefixes = name.prefixes();
        prop_assert_eq!(prefixes.len(), 3);
        prop_assert_eq!(&prefixes[0], "refs");
        prop_assert_eq!(&prefixes[1], &format!("refs/{a}"));
        prop_assert_eq!(&prefixes[2], &format!("refs/{a}/{b}"));
    }

    #[test]
    fn a_name_overlaps_everything_it_prefixes(a in component(), b in component()) {
        let parent = RefName::new(format!("refs/heads/{a}")).unwrap();
        let child = RefName::new(format!("refs/heads/{a}/{b}")).unwrap();
        prop_assert!(parent.overlaps(&child));
        prop_assert!(child.overlaps(&parent));
        prop_assert!(!parent.overlaps(&parent));

        // Sibling with a joined name does not overlap.
        let sibling = RefName::new(format!("refs/heads/{a}{b}x")).unwrap();
        let joined = format!("{a}{b}x");
        let prefix = format!("{a}/");
        prop_assert!(!parent.overlaps(&sibling) || joined.starts_with(&prefix));
    }

    #[test]
    fn forbidden_bytes_always_reject(a in component(), bad in prop::sample::select(vec![' ', '~', '^', ':', '?', '*', '[', '\\'])) {
        let name = format!("refs/heads/{a}{bad}tail");
        prop_assert!(RefName::new(name).is_err());
    }
}
