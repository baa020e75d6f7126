use bstr::{BString, ByteSlice, ByteVec};
use coffer_id::ObjectId;
use coffer_util::Ident;

use crate::ObjectError;

/// A parsed commit payload.
///
/// Only the fields the storage engine itself consumes are broken out:
/// the tree, the parent list (fast-forward classification) and the two
/// identities. Any further headers are preserved verbatim so the payload
/// re-serializes byte-identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Ident,
    pub committer: Ident,
    /// Headers after `committer`, raw, including continuation lines.
    pub extra_headers: Vec<(BString, BString)>,
    pub message: BString,
}

impl Commit {
    /// Parse a commit payload (no object header).
    pub fn parse(payload: &[u8]) -> Result<Self, ObjectError> {
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers = Vec::new();

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
                ObjectError::InvalidHeader(format!("commit header without value: {:?}", line.as_bstr()))
            })?;
            let (key, value) = (&line[..space], &line[space + 1..]);

            match key {
                b"tree" => tree = Some(parse_id(value)?),
                b"parent" => parents.push(parse_id(value)?),
                b"author" => author = Some(Ident::parse(value.as_bstr())?),
                b"committer" => committer = Some(Ident::parse(value.as_bstr())?),
                _ => {
                    // Fold continuation lines (leading space) into the value.
                    let mut folded = BString::from(value);
                    while pos < payload.len() && payload[pos] == b' ' {
                        let cont_end = payload[pos..]
                            .find_byte(b'\n')
                            .map(|p| pos + p)
                            .unwrap_or(payload.len());
                        folded.push(b'\n');
                        folded.push_str(&payload[pos + 1..cont_end]);
                        pos = cont_end + 1;
                    }
                    extra_headers.push((BString::from(key), folded));
                }
            }
        }

        Ok(Self {
            tree: tree.ok_or(ObjectError::MissingCommitField { field: "tree" })?,
            parents,
            author: author.ok_or(ObjectError::MissingCommitField { field: "author" })?,
            committer: committer.ok_or(ObjectError::MissingCommitField { field: "committer" })?,
            extra_headers,
            message: BString::from(&payload[pos.min(payload.len())..]),
        })
    }

    /// Serialize back to the canonical payload.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = BString::new(Vec::with_capacity(256));
        out.push_str(format!("tree {}\n", self.tree).as_bytes());
        for p in &self.parents {
            out.push_str(format!("parent {p}\n").as_bytes());
        }
        out.push_str(b"author ");
        out.push_str(self.author.to_bytes());
        out.push(b'\n');
        out.push_str(b"committer ");
        out.push_str(self.committer.to_bytes());
        out.push(b'\n');
        for (key, value) in &self.extra_headers {
            out.push_str(key);
            out.push(b' ');
            // Continuation lines are re-folded with a leading space.
            let mut first = true;
            for part in value.split_str(b"\n") {
                if !first {
                    out.push_str(b"\n ");
                }
                out.push_str(part);
                first = false;
            }
            out.push(b'\n');
        }
        out.push(b'\n');
        out.push_str(&self.message);
        out.into()
    }
}

fn parse_id(value: &[u8]) -> Result<ObjectId, ObjectError> {
    let hex = std::str::from_utf8(value)
        .map_err(|_| ObjectError::InvalidHeader("non-UTF-8 id".into()))?;
    Ok(ObjectId::from_hex(hex)?)
}

/// Assembles a commit payload for the object inserter.
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Ident,
    pub committer: Ident,
    pub message: BString,
}

impl CommitBuilder {
    pub fn new(tree: ObjectId, author: Ident, committer: Ident) -> Self {
        Self {
            tree,
            parents: Vec::new(),
            author,
            committer,
            message: BString::from(""),
        }
    }

    pub fn parent(mut self, parent: ObjectId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn message(mut self, message: impl Into<BString>) -> Self {
        self.message = message.into();
        self
    }

    /// The canonical commit payload.
    pub fn build(&self) -> Vec<u8> {
        Commit {
            tree: self.tree,
            parents: self.parents.clone(),
            author: self.author.clone(),
            committer: self.committer.clone(),
            extra_headers: Vec::new(),
            message: self.message.clone(),
        }
        .to_payload()
    }
}
