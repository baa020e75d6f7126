use bstr::{BString, ByteSlice, ByteVec};
use coffer_id::ObjectId;
use coffer_util::Ident;

use crate::{Kind, ObjectError};

/// A parsed annotated tag payload.
///
/// The ref layer peels tags by chasing `target` until `target_kind` stops
/// being [`Kind::Tag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub target: ObjectId,
    pub target_kind: Kind,
    pub name: BString,
    pub tagger: Option<Ident>,
    pub message: BString,
}

impl Tag {
    /// Parse a tag payload (no object header).
    pub fn parse(payload: &[u8]) -> Result<Self, ObjectError> {
        let mut target = None;
        let mut target_kind = None;
        let mut name = None;
        let mut tagger = None;

        let mut pos = 0;
        while pos < payload.len() {
            if payload[pos] == b'\n' {
                pos += 1;
                break;
            }
            let line_end = payload[pos..]
                .find_byte(b'\n')
                .map(|p| pos + p)
                .unwrap_or(payload.len());
            let line = &payload[pos..line_end];
            pos = line_end + 1;

            let space = line.find_byte(b' ').ok_or_else(|| {
                ObjectError::InvalidHeader(format!("tag header without value: {:?}", line.as_bstr()))
            })?;
            let (key, value) = (&line[..space], &line[space + 1..]);

            match key {
                b"object" => {
                    let hex = std::str::from_utf8(value)
                        .map_err(|_| ObjectError::InvalidHeader("non-UTF-8 id".into()))?;
                    target = Some(ObjectId::from_hex(hex)?);
                }
                b"type" => target_kind = Some(Kind::from_name(value)?),
                b"tag" => name = Some(BString::from(value)),
                b"tagger" => tagger = Some(Ident::parse(value.as_bstr())?),
                _ => {} // signatures and unknown headers are opaque here
            }
        }

        Ok(Self {
            target: target.ok_or(ObjectError::MissingTagField { field: "object" })?,
            target_kind: target_kind.ok_or(ObjectError::MissingTagField { field: "type" })?,
            name: name.ok_or(ObjectError::MissingTagField { field: "tag" })?,
            tagger,
            message: BString::from(&payload[pos.min(payload.len())..]),
        })
    }
}

/// Assembles a tag payload for the object inserter.
#[derive(Debug, Clone)]
pub struct TagBuilder {
    pub target: ObjectId,
    pub target_kind: Kind,
    pub name: BString,
    pub tagger: Ident,
    pub message: BString,
}

impl TagBuilder {
    pub fn new(
        target: ObjectId,
        target_kind: Kind,
        name: impl Into<BString>,
        tagger: Ident,
    ) -> Self {
        Self {
            target,
            target_kind,
            name: name.into(),
            tagger,
            message: BString::from(""),
        }
    }

    pub fn message(mut self, message: impl Into<BString>) -> Self {
        self.message = message.into();
        self
    }

    /// The canonical tag payload.
    pub fn build(&self) -> Vec<u8> {
        let mut out = BString::new(Vec::with_capacity(160));
        out.push_str(format!("object {}\n", self.target).as_bytes());
        out.push_str(format!("type {}\n", self.target_kind).as_bytes());
        out.push_str(b"tag ");
        out.push_str(&self.name);
        out.push(b'\n');
        out.push_str(b"tagger ");
        out.push_str(self.tagger.to_bytes());
        out.push(b'\n');
        out.push(b'\n');
        out.push_str(&self.message);
        out.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_util::When;

    fn tagger() -> Ident {
        Ident::new("T Agger", "tagger@example.com", When::new(1465818000, 0))
    }

    fn target() -> ObjectId {
        ObjectId::from_hex("5555555555555555555555555555555555555555").unwrap()
    }

    #[test]
    fn build_parse_roundtrip() {
        let payload = TagBuilder::new(target(), Kind::Commit, "v1.0", tagger())
            .message("release 1.0\n")
            .build();
        let tag = Tag::parse(&payload).unwrap();
        assert_eq!(tag.target, target());
        assert_eq!(tag.target_kind, Kind::Commit);
        assert_eq!(tag.name, "v1.0");
        assert_eq!(tag.tagger, Some(tagger()));
        assert_eq!(tag.message, "release 1.0\n");
    }

    #[test]
    fn tag_of_tag_parses() {
        let payload = TagBuilder::new(target(), Kind::Tag, "meta", tagger()).build();
        let tag = Tag::parse(&payload).unwrap();
        assert_eq!(tag.target_kind, Kind::Tag);
    }

    #[test]
    fn tagger_is_optional() {
        let payload = b"object 5555555555555555555555555555555555555555\ntype blob\ntag raw\n\nmsg";
        let tag = Tag::parse(payload).unwrap();
        assert!(tag.tagger.is_none());
        assert_eq!(tag.target_kind, Kind::Blob);
    }

    #[test]
    fn missing_object_rejected() {
        let payload = b"type commit\ntag broken\n\n";
        assert!(matches!(
            Tag::parse(payload),
            Err(ObjectError::MissingTagField { field: "object" })
        ));
    }
}
