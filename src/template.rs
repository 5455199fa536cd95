//! Expanding `${KEY}` tokens in fixed message templates.
//!
//! Lookup goes through a chain of [`Vars`] frames, searched front to
//! back; a key one frame cannot answer falls through to the next. The
//! expansion writes into a caller-provided buffer, so one scratch
//! buffer bounds the size of every message built from it.

use std::borrow::Cow;
use std::io::{Cursor, Write};

/// One frame of template variables
pub trait Vars {
    /// The value of `key`, or `None` to fall through to the next frame
    fn get(&self, key: &str) -> Option<Cow<'_, str>>;
}

/// The ways an expansion can fail
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// A `${KEY}` was answered by no frame in the chain
    UnknownKey,

    /// A `${` with no closing `}`
    Unterminated,

    /// The output buffer is too small for the expanded text
    Overflow,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnknownKey => f.write_str("unknown template key"),
            Self::Unterminated => f.write_str("unterminated template key"),
            Self::Overflow => f.write_str("template output too large"),
        }
    }
}

impl std::error::Error for Error {}

/// Expand `template` into `out`, returning the number of bytes written
///
/// Everything outside `${...}` is copied verbatim; a lone `$` has no
/// special meaning.
///
/// # Errors
///
/// Fails on an unresolvable or unterminated key, or when `out` cannot
/// hold the expanded text.
#[allow(clippy::cast_possible_truncation)]
pub fn expand(
    out: &mut [u8],
    template: &str,
    vars: &[&dyn Vars],
) -> Result<usize, Error> {
    let mut cursor = Cursor::new(out);
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        put(&mut cursor, &rest[..start])?;
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or(Error::Unterminated)?;
        let key = &tail[..end];
        let value = vars
            .iter()
            .find_map(|v| v.get(key))
            .ok_or(Error::UnknownKey)?;
        put(&mut cursor, &value)?;
        rest = &tail[end + 1..];
    }
    put(&mut cursor, rest)?;
    Ok(cursor.position() as usize)
}

fn put(cursor: &mut Cursor<&mut [u8]>, text: &str) -> Result<(), Error> {
    cursor
        .write_all(text.as_bytes())
        .map_err(|_| Error::Overflow)
}
