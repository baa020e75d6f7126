use crate::{IdError, ObjectId, RAW_LEN};

/// Streaming SHA-1 with collision detection.
///
/// Data can be fed incrementally with [`update`](Hasher::update) or through
/// the [`std::io::Write`] implementation, then finalised into an
/// [`ObjectId`]. Finalisation fails if the collision detector fires.
pub struct Hasher {
    inner: Box<sha1_checked::Sha1>,
}

impl Hasher {
    pub fn new() -> Self {
        use digest::Digest;
        Self {
            inner: Box::new(sha1_checked::Sha1::new()),
        }
    }

    /// A hasher pre-seeded with the object header `"<type> <size>\0"`.
    ///
    /// Streaming the payload afterwards yields the object's id without
    /// buffering the whole object.
    pub fn for_object(type_name: &str, payload_len: u64) -> Self {
        let mut h = Self::new();
        h.update(format!("{type_name} {payload_len}\0").as_bytes());
        h
    }

    pub fn update(&mut self, data: &[u8]) {
        use digest::Digest;
        self.inner.update(data);
    }

    pub fn finalize(self) -> Result<ObjectId, IdError> {
        let result = self.inner.try_finalize();
        if result.has_collision() {
            return Err(IdError::Collision);
        }
        let mut raw = [0u8; RAW_LEN];
        raw.copy_from_slice(result.hash().as_slice());
        Ok(ObjectId::from_raw(raw))
    }

    /// Hash a complete buffer in one call.
    pub fn digest(data: &[u8]) -> Result<ObjectId, IdError> {
        let mut h = Self::new();
        h.update(data);
        h.finalize()
    }

    /// The id of a whole object: `SHA-1("<type> <size>\0" || payload)`.
    pub fn object_id(type_name: &str, payload: &[u8]) -> Result<ObjectId, IdError> {
        let mut h = Self::for_object(type_name, payload.len() as u64);
        h.update(payload);
        h.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_input() {
        let id = Hasher::digest(b"").unwrap();
        assert_eq!(id.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn object_id_of_empty_blob() {
        // `git hash-object -t blob /dev/null`
        let id = Hasher::object_id("blob", b"").unwrap();
        assert_eq!(id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn object_id_of_hello_blob() {
        // `echo 'hello world' | git hash-object -t blob --stdin`
        let id = Hasher::object_id("blob", b"hello world\n").unwrap();
        assert_eq!(id.to_hex(), "3b18e512dba79e4c8300dd08aeb37f8e728b8dad");
    }

    #[test]
    fn streaming_matches_one_shot() {
        let payload = b"some larger payload split across updates";
        let one_shot = Hasher::object_id("blob", payload).unwrap();

        let mut h = Hasher::for_object("blob", payload.len() as u64);
        for chunk in payload.chunks(7) {
            h.update(chunk);
        }
        assert_eq!(h.finalize().unwrap(), one_shot);
    }

    #[test]
    fn write_impl_feeds_hasher() {
        use std::io::Write;
        let mut h = Hasher::new();
        h.write_all(b"abc").unwrap();
        let id = h.finalize().unwrap();
        assert_eq!(id, Hasher::digest(b"abc").unwrap());
    }
}
