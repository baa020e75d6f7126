//! Property tests for id hex codecs and abbreviation matching.

use coffer_id::{AbbreviatedId, ObjectId};
use proptest::prelude::*;

proptest! {
    #[test]
    fn id_hex_roundtrip(raw in proptest::array::uniform20(any::<u8>())) {
        let id = ObjectId::from_raw(raw);
        let parsed = ObjectId::from_hex(&id.to_hex()).unwrap();
        prop_assert_eq!(parsed, id);
    }

    #[test]
    fn every_prefix_of_an_id_matches_it(raw in proptest::array::uniform20(any::<u8>()), len in 1usize..=40) {
        let id = ObjectId::from_raw(raw);
        let abbrev = AbbreviatedId::new(&id.to_hex()[..len]).unwrap();
        prop_assert!(abbrev.matches(&id));
    }

    #[test]
    fn prefix_cmp_agrees_with_hex_ordering(a in proptest::array::uniform20(any::<u8>()), b in proptest::array::uniform20(any::<u8>()), len in 1usize..=40) {
        let id_a = ObjectId::from_raw(a);
        let id_b = ObjectId::from_raw(b);
        let abbrev = AbbreviatedId::new(&id_a.to_hex()[..len]).unwrap();
        let expected = id_a.to_hex()[..len].cmp(&id_b.to_hex()[..len]);
        prop_assert_eq!(abbrev.prefix_cmp(&id_b), expected);
    }
}
