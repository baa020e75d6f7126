use std::cmp::Ordering;
use std::fmt;

use crate::{hex, IdError, ObjectId, HEX_LEN, RAW_LEN};

/// A leading prefix of an object id: 1 to 40 hex digits.
///
/// Used to refine binary searches over sorted id tables and to resolve
/// user-supplied short ids. The unfilled tail is zero-padded internally;
/// only the first `len` nibbles take part in comparisons.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AbbreviatedId {
    bytes: [u8; RAW_LEN],
    len: usize,
}

impl AbbreviatedId {
    /// Parse a hex prefix of 1..=40 digits.
    pub fn new(hex_prefix: &str) -> Result<Self, IdError> {
        let len = hex_prefix.len();
        if len == 0 || len > HEX_LEN {
            return Err(IdError::InvalidAbbrevLength(len));
        }
        let mut bytes = [0u8; RAW_LEN];
        for (i, b) in hex_prefix.bytes().enumerate() {
            let nib = hex::nibble(b).ok_or(IdError::InvalidHex {
                position: i,
                character: b as char,
            })?;
            if i % 2 == 0 {
                bytes[i / 2] = nib << 4;
            } else {
                bytes[i / 2] |= nib;
            }
        }
        Ok(Self { bytes, len })
    }

    /// The leading `len` digits of a full id.
    pub fn from_id(id: &ObjectId, len: usize) -> Result<Self, IdError> {
        if len == 0 || len > HEX_LEN {
            return Err(IdError::InvalidAbbrevLength(len));
        }
        let mut bytes = [0u8; RAW_LEN];
        bytes.copy_from_slice(id.as_bytes());
        // Zero the nibbles past the prefix so equality stays well-defined.
        if len % 2 == 1 {
            bytes[len / 2] &= 0xf0;
        }
        for b in bytes.iter_mut().skip(len.div_ceil(2)) {
            *b = 0;
        }
        Ok(Self { bytes, len })
    }

    /// Number of hex digits in the prefix.
    pub fn hex_len(&self) -> usize {
        self.len
    }

    /// True when all 40 digits are present.
    pub fn is_complete(&self) -> bool {
        self.len == HEX_LEN
    }

    /// Convert to a full id. Only valid when [`is_complete`](Self::is_complete).
    pub fn to_object_id(&self) -> Option<ObjectId> {
        self.is_complete().then(|| ObjectId::from_raw(self.bytes))
    }

    /// Compare this prefix against a full id for binary-search refinement.
    ///
    /// Returns `Equal` when `id` starts with this prefix, otherwise the
    /// ordering of the prefix relative to `id`.
    pub fn prefix_cmp(&self, id: &ObjectId) -> Ordering {
        self.cmp_raw(id.as_bytes())
    }

    /// As [`prefix_cmp`](Self::prefix_cmp), against raw digest bytes.
    pub fn cmp_raw(&self, raw: &[u8]) -> Ordering {
        let full = self.len / 2;
        match self.bytes[..full].cmp(&raw[..full]) {
            Ordering::Equal if self.len % 2 == 1 => {
                (self.bytes[full] >> 4).cmp(&(raw[full] >> 4))
            }
            ord => ord,
        }
    }

    /// True when `id` begins with this prefix.
    pub fn matches(&self, id: &ObjectId) -> bool {
        self.prefix_cmp(id) == Ordering::Equal
    }

    /// The prefix as lowercase hex.
    pub fn to_hex(&self) -> String {
        let mut s = hex::encode(&self.bytes);
        s.truncate(self.len);
        s
    }
}

impl fmt::Display for AbbreviatedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AbbreviatedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbbreviatedId({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "9d8f3c1a2b4e5d6f708192a3b4c5d6e7f8091a2b";

    fn id() -> ObjectId {
        ObjectId::from_hex(ID).unwrap()
    }

    #[test]
    fn matches_even_and_odd_lengths() {
        for len in 1..=HEX_LEN {
            let abbrev = AbbreviatedId::new(&ID[..len]).unwrap();
            assert_eq!(abbrev.hex_len(), len);
            assert!(abbrev.matches(&id()), "length {len} should match");
            assert_eq!(abbrev.to_hex(), &ID[..len]);
        }
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(matches!(
            AbbreviatedId::new(""),
            Err(IdError::InvalidAbbrevLength(0))
        ));
        assert!(matches!(
            AbbreviatedId::new(&"a".repeat(41)),
            Err(IdError::InvalidAbbrevLength(41))
        ));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(AbbreviatedId::new("9d8z").is_err());
    }

    #[test]
    fn prefix_cmp_orders_around_match() {
        let abbrev = AbbreviatedId::new("9d8f").unwrap();
        let below = ObjectId::from_hex("9d8e0000000000000000000000000000000000ff").unwrap();
        let above = ObjectId::from_hex("9d900000000000000000000000000000000000ff").unwrap();
        assert_eq!(abbrev.prefix_cmp(&below), Ordering::Greater);
        assert_eq!(abbrev.prefix_cmp(&id()), Ordering::Equal);
        assert_eq!(abbrev.prefix_cmp(&above), Ordering::Less);
    }

    #[test]
    fn odd_length_compares_high_nibble() {
        let abbrev = AbbreviatedId::new("9d8").unwrap();
        let same_nibble = ObjectId::from_hex("9d8f0000000000000000000000000000000000ff").unwrap();
        let next_nibble = ObjectId::from_hex("9d900000000000000000000000000000000000ff").unwrap();
        assert!(abbrev.matches(&same_nibble));
        assert!(!abbrev.matches(&next_nibble));
    }

    #[test]
    fn complete_abbreviation_converts() {
        let abbrev = AbbreviatedId::new(ID).unwrap();
        assert!(abbrev.is_complete());
        assert_eq!(abbrev.to_object_id(), Some(id()));
        assert!(AbbreviatedId::new("9d8f").unwrap().to_object_id().is_none());
    }

    #[test]
    fn from_id_equals_parsed() {
        for len in [1, 2, 7, 39, 40] {
            let a = AbbreviatedId::from_id(&id(), len).unwrap();
            let b = AbbreviatedId::new(&ID[..len]).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn binary_search_with_prefix_cmp() {
        let mut ids: Vec<ObjectId> = ["1111", "9d8e", "9d8f", "9d90", "ffff"]
            .iter()
            .map(|p| ObjectId::from_hex(&format!("{p:0<40}")).unwrap())
            .collect();
        ids.sort();
        let abbrev = AbbreviatedId::new("9d8f").unwrap();
        let hit = ids
            .binary_search_by(|probe| abbrev.prefix_cmp(probe).reverse())
            .unwrap();
        assert!(abbrev.matches(&ids[hit]));
    }
}
