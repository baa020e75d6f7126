use std::fmt;

use bstr::{BStr, BString, ByteSlice};

use crate::RefError;

/// A validated reference name.
///
/// Names are `/`-separated paths. Within `refs/` at least two
/// components are required (`refs/heads/x`, never a bare `refs/x`
/// namespace entry — `refs/x` itself is tolerated for historical refs
/// like `refs/stash`). A handful of ALL_CAPS root names (`HEAD`, …)
/// are valid without any slash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefName(BString);

/// Bytes that may never appear in a ref name.
const FORBIDDEN: &[u8] = b" \t\n~^:?*[\\";

/// Root refs that need no `/`.
pub const ROOT_REFS: &[&str] = &[
    "HEAD",
    "FETCH_HEAD",
    "MERGE_HEAD",
    "ORIG_HEAD",
    "CHERRY_PICK_HEAD",
    "REVERT_HEAD",
];

impl RefName {
    /// Validate and wrap a name.
    pub fn new(name: impl Into<BString>) -> Result<Self, RefError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    pub(crate) fn new_unchecked(name: impl Into<BString>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("<non-utf8 ref>")
    }

    pub fn as_bstr(&self) -> &BStr {
        self.0.as_bstr()
    }

    pub fn is_branch(&self) -> bool {
        self.0.starts_with(b"refs/heads/")
    }

    pub fn is_tag(&self) -> bool {
        self.0.starts_with(b"refs/tags/")
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with(b"refs/remotes/")
    }

    /// The short, human form: `main` for `refs/heads/main`.
    pub fn short(&self) -> &str {
        let s = self.as_str();
        for prefix in ["refs/heads/", "refs/tags/", "refs/remotes/"] {
            if let Some(rest) = s.strip_prefix(prefix) {
                return rest;
            }
        }
        s
    }

    /// Every strict path prefix: `refs/heads/a/b` → `refs`,
    /// `refs/heads`, `refs/heads/a`.
    pub fn prefixes(&self) -> Vec<String> {
        let s = self.as_str();
        s.char_indices()
            .filter(|&(_, c)| c == '/')
            .map(|(i, _)| s[..i].to_string())
            .collect()
    }

    /// Does `self` overlap `other`: is one a strict path prefix of the
    /// other? Overlapping names cannot coexist because one needs a file
    /// where the other needs a directory.
    pub fn overlaps(&self, other: &RefName) -> bool {
        let a = self.as_str();
        let b = other.as_str();
        (a.len() < b.len() && b.as_bytes()[a.len()] == b'/' && b.starts_with(a))
            || (b.len() < a.len() && a.as_bytes()[b.len()] == b'/' && a.starts_with(b))
    }
}

/// The lookup order for short names: exact first, then the standard
/// namespaces.
pub const SEARCH_PATH: [&str; 5] = ["", "refs/", "refs/tags/", "refs/heads/", "refs/remotes/"];

fn validate(name: &[u8]) -> Result<(), RefError> {
    let shown = || String::from_utf8_lossy(name).into_owned();
    let fail = |why: &str| Err(RefError::InvalidName(format!("'{}': {why}", shown())));

    if name.is_empty() {
        return fail("empty");
    }
    for &b in name {
        if b < 0x20 || b == 0x7f {
            return fail("contains a control character");
        }
        if FORBIDDEN.contains(&b) {
            return fail("contains a forbidden character");
        }
    }
    if name.find(b"..").is_some() {
        return fail("contains '..'");
    }
    if name.starts_with(b"/") || name.ends_with(b"/") {
        return fail("starts or ends with '/'");
    }
    if name.ends_with(b".") {
        return fail("ends with '.'");
    }
    if name.ends_with(b".lock") {
        return fail("ends with '.lock'");
    }
    for component in name.split_str(b"/") {
        if component.is_empty() {
            return fail("has an empty component");
        }
        if component.starts_with(b".") {
            return fail("component starts with '.'");
        }
        if component.ends_with(b".lock") {
            return fail("component ends with '.lock'");
        }
    }

    if !name.contains(&b'/') {
        let as_str = std::str::from_utf8(name).unwrap_or("");
        if !ROOT_REFS.contains(&as_str) {
            return fail("single-component name is not a known root ref");
        }
    }
    Ok(())
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<BStr> for RefName {
    fn as_ref(&self) -> &BStr {
        self.0.as_bstr()
    }
}

impl std::str::FromStr for RefName {
    type Err = RefError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        for ok in [
            "refs/heads/main",
            "refs/heads/feature/nested-topic",
            "refs/tags/v1.0.2",
            "refs/remotes/origin/main",
            "refs/stash",
            "HEAD",
            "MERGE_HEAD",
        ] {
            assert!(RefName::new(ok).is_ok(), "{ok} should validate");
        }
    }

    #[test]
    fn rejects_forbidden_shapes() {
        for bad in [
            "",
            "main",                    // not a root ref
            "refs/heads/with space",
            "refs/heads/tab\there",
            "refs/heads/a..b",
            "refs/heads/a~1",
            "refs/heads/a^2",
            "refs/heads/a:b",
            "refs/heads/a?b",
            "refs/heads/a*b",
            "refs/heads/a[b",
            "refs/heads/a\\b",
            "/refs/heads/a",
            "refs/heads/a/",
            "refs//heads/a",
            "refs/heads/a.",
            "refs/heads/a.lock",
            "refs/heads/a.lock/b",
            "refs/heads/.hidden",
        ] {
            assert!(RefName::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn prefixes_of_nested_name() {
        let name = RefName::new("refs/heads/foo").unwrap();
        assert_eq!(name.prefixes(), ["refs", "refs/heads"]);

        let deep = RefName::new("refs/heads/a/b/c").unwrap();
        assert_eq!(
            deep.prefixes(),
            ["refs", "refs/heads", "refs/heads/a", "refs/heads/a/b"]
        );
        assert!(RefName::new("HEAD").unwrap().prefixes().is_empty());
    }

    #[test]
    fn overlap_is_strict_prefixing() {
        let a = RefName::new("refs/heads/foo").unwrap();
        let b = RefName::new("refs/heads/foo/bar").unwrap();
        let c = RefName::new("refs/heads/foobar").unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&a));
    }

    #[test]
    fn short_names() {
        assert_eq!(RefName::new("refs/heads/main").unwrap().short(), "main");
        assert_eq!(RefName::new("refs/tags/v1").unwrap().short(), "v1");
        assert_eq!(
            RefName::new("refs/remotes/origin/dev").unwrap().short(),
            "origin/dev"
        );
        assert_eq!(RefName::new("HEAD").unwrap().short(), "HEAD");
    }

    #[test]
    fn namespace_predicates() {
        assert!(RefName::new("refs/heads/x").unwrap().is_branch());
        assert!(RefName::new("refs/tags/x").unwrap().is_tag());
        assert!(RefName::new("refs/remotes/o/x").unwrap().is_remote());
        assert!(!RefName::new("refs/tags/x").unwrap().is_branch());
    }
}
