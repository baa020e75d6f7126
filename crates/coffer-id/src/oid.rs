use std::fmt;
use std::str::FromStr;

use crate::hex;
use crate::{IdError, HEX_LEN, RAW_LEN};

/// A 20-byte SHA-1 object identifier.
///
/// Equality is raw-byte equality and ordering is unsigned lexicographic,
/// matching the sort order of pack indexes. The all-zero id stands for
/// "no object" in ref updates and reflog lines.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; RAW_LEN]);

impl ObjectId {
    /// The distinguished "absent" id.
    pub const ZERO: Self = Self([0u8; RAW_LEN]);

    /// Wrap raw digest bytes.
    pub const fn from_raw(bytes: [u8; RAW_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy an id out of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != RAW_LEN {
            return Err(IdError::InvalidIdLength {
                expected: RAW_LEN,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; RAW_LEN];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Parse 40 hex digits (either case).
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        if s.len() != HEX_LEN {
            return Err(IdError::InvalidHexLength {
                expected: HEX_LEN,
                actual: s.len(),
            });
        }
        let mut raw = [0u8; RAW_LEN];
        hex::decode(s, &mut raw)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for the all-zero id.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Lowercase 40-digit hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// First raw byte, the fan-out bucket.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// Relative path of the loose object file: `"xx/yyy…"`.
    pub fn loose_path(&self) -> String {
        let h = self.to_hex();
        format!("{}/{}", &h[..2], &h[2..])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..8])
    }
}

impl FromStr for ObjectId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const EMPTY_BLOB: &str = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";

    #[test]
    fn hex_roundtrip() {
        let id = ObjectId::from_hex(EMPTY_BLOB).unwrap();
        assert_eq!(id.to_string(), EMPTY_BLOB);
        let again: ObjectId = EMPTY_BLOB.parse().unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn uppercase_accepted() {
        let lower = ObjectId::from_hex(EMPTY_BLOB).unwrap();
        let upper = ObjectId::from_hex(&EMPTY_BLOB.to_uppercase()).unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn zero_id() {
        assert!(ObjectId::ZERO.is_zero());
        assert_eq!(
            ObjectId::ZERO.to_hex(),
            "0000000000000000000000000000000000000000"
        );
        assert!(!ObjectId::from_hex(EMPTY_BLOB).unwrap().is_zero());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        let b = ObjectId::from_hex("00000000000000000000000000000000000000ff").unwrap();
        let c = ObjectId::from_hex("0100000000000000000000000000000000000000").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn usable_as_map_key() {
        let id = ObjectId::from_hex(EMPTY_BLOB).unwrap();
        let mut map = HashMap::new();
        map.insert(id, 1);
        assert_eq!(map[&id], 1);
    }

    #[test]
    fn debug_is_abbreviated() {
        let id = ObjectId::from_hex(EMPTY_BLOB).unwrap();
        assert_eq!(format!("{id:?}"), "ObjectId(e69de29b)");
    }

    #[test]
    fn first_byte_and_loose_path() {
        let id = ObjectId::from_hex(EMPTY_BLOB).unwrap();
        assert_eq!(id.first_byte(), 0xe6);
        assert_eq!(id.loose_path(), format!("e6/{}", &EMPTY_BLOB[2..]));
    }

    #[test]
    fn from_bytes_validates_length() {
        assert!(matches!(
            ObjectId::from_bytes(&[0u8; 19]),
            Err(IdError::InvalidIdLength {
                expected: 20,
                actual: 19
            })
        ));
    }

    #[test]
    fn bad_hex_rejected() {
        assert!(ObjectId::from_hex("zz").is_err());
        assert!(ObjectId::from_hex(&"g".repeat(40)).is_err());
    }
}
