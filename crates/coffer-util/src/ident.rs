use bstr::{BStr, BString, ByteSlice, ByteVec};
use chrono::{Local, Offset};

use crate::error::UtilError;
use crate::Result;

/// A point in time as git records it: epoch seconds plus the local
/// timezone offset in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct When {
    pub seconds: i64,
    pub offset_minutes: i32,
}

impl When {
    pub fn new(seconds: i64, offset_minutes: i32) -> Self {
        Self {
            seconds,
            offset_minutes,
        }
    }

    /// The current wall-clock time with the local timezone offset.
    pub fn now() -> Self {
        let now = Local::now();
        Self {
            seconds: now.timestamp(),
            offset_minutes: now.offset().fix().local_minus_utc() / 60,
        }
    }

    /// Parse the raw `"<seconds> <±HHMM>"` form.
    pub fn parse_raw(input: &str) -> Result<Self> {
        let mut parts = input.split_ascii_whitespace();
        let seconds: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| UtilError::IdentParse(format!("bad timestamp in '{input}'")))?;
        let offset_minutes = match parts.next() {
            None => 0,
            Some(tz) => {
                let decimal: i32 = tz
                    .parse()
                    .map_err(|_| UtilError::IdentParse(format!("bad timezone in '{input}'")))?;
                // ±HHMM decimal form: -0530 means -(5h30m).
                let sign = if decimal < 0 { -1 } else { 1 };
                let abs = decimal.abs();
                sign * (abs / 100 * 60 + abs % 100)
            }
        };
        Ok(Self {
            seconds,
            offset_minutes,
        })
    }

    /// Render the offset back into the ±HHMM decimal form.
    fn offset_decimal(&self) -> i32 {
        let sign = if self.offset_minutes < 0 { -1 } else { 1 };
        let abs = self.offset_minutes.abs();
        sign * (abs / 60 * 100 + abs % 60)
    }
}

/// Who performed a ref update: the identity written into reflog lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: BString,
    pub email: BString,
    pub when: When,
}

impl Ident {
    pub fn new(name: impl Into<BString>, email: impl Into<BString>, when: When) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when,
        }
    }

    /// Parse the canonical `Name <email> seconds ±HHMM` form.
    pub fn parse(input: &BStr) -> Result<Self> {
        let bytes = input.as_bytes();
        let gt = bytes
            .iter()
            .rposition(|&b| b == b'>')
            .ok_or_else(|| UtilError::IdentParse("missing '>'".into()))?;
        let lt = bytes[..gt]
            .iter()
            .rposition(|&b| b == b'<')
            .ok_or_else(|| UtilError::IdentParse("missing '<'".into()))?;

        let name = bytes[..lt].trim();
        let email = &bytes[lt + 1..gt];
        let when_str = std::str::from_utf8(bytes[gt + 1..].trim())
            .map_err(|_| UtilError::IdentParse("non-UTF-8 timestamp".into()))?;

        Ok(Self {
            name: BString::from(name),
            email: BString::from(email),
            when: When::parse_raw(when_str)?,
        })
    }

    /// Render in the canonical form used by reflog lines.
    pub fn to_bytes(&self) -> BString {
        let mut out = BString::new(Vec::with_capacity(64));
        out.push_str(&self.name);
        out.push_str(b" <");
        out.push_str(&self.email);
        out.push_str(b"> ");
        out.push_str(
            format!("{} {:+05}", self.when.seconds, self.when.offset_decimal()).as_bytes(),
        );
        out
    }
}
