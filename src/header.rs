//! Parsing HTTP-shaped header blocks, in both directions.
//!
//! SSDP datagrams and description-endpoint requests share the same
//! wire shape: a start line, then `KEY: VALUE` lines, then a blank
//! line. Requests and responses differ only in the start line, so there
//! are two entry points over one header walker. Keys are handed to the
//! caller untouched (consumers uppercase before comparing); values are
//! stripped of surrounding whitespace.

/// The input is not a well-formed header block
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Malformed;

impl core::fmt::Display for Malformed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("malformed header block")
    }
}

/// Parse `METHOD TARGET HTTP/MAJOR.MINOR` plus headers
///
/// `on_request` receives the request line fields; `on_header` receives
/// each `(key, value)` pair. Anything after the terminating blank line
/// (a body) is ignored.
pub(crate) fn parse_request<R, H>(
    buf: &[u8],
    on_request: R,
    on_header: H,
) -> Result<(), Malformed>
where
    R: FnOnce(&str, &str, u8, u8),
    H: FnMut(&str, &str),
{
    let mut lines = lines_of(buf)?;
    let start = lines.next().ok_or(Malformed)?;
    let mut parts = start.splitn(3, ' ');
    let method = parts.next().filter(|s| !s.is_empty()).ok_or(Malformed)?;
    let target = parts.next().filter(|s| !s.is_empty()).ok_or(Malformed)?;
    let (major, minor) = version(parts.next().ok_or(Malformed)?)?;
    on_request(method, target, major, minor);
    headers(lines, on_header)
}

/// Parse `HTTP/MAJOR.MINOR STATUS REASON` plus headers
///
/// The reason phrase may be absent.
pub(crate) fn parse_response<R, H>(
    buf: &[u8],
    on_status: R,
    on_header: H,
) -> Result<(), Malformed>
where
    R: FnOnce(u8, u8, u16),
    H: FnMut(&str, &str),
{
    let mut lines = lines_of(buf)?;
    let start = lines.next().ok_or(Malformed)?;
    let mut parts = start.splitn(3, ' ');
    let (major, minor) = version(parts.next().ok_or(Malformed)?)?;
    let status = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Malformed)?;
    on_status(major, minor, status);
    headers(lines, on_header)
}

fn lines_of(buf: &[u8]) -> Result<core::str::Lines<'_>, Malformed> {
    Ok(core::str::from_utf8(buf).map_err(|_| Malformed)?.lines())
}

fn version(token: &str) -> Result<(u8, u8), Malformed> {
    let (major, minor) = token
        .strip_prefix("HTTP/")
        .and_then(|v| v.split_once('.'))
        .ok_or(Malformed)?;
    Ok((
        major.parse().map_err(|_| Malformed)?,
        minor.parse().map_err(|_| Malformed)?,
    ))
}

fn headers<'a, H>(
    lines: impl Iterator<Item = &'a str>,
    mut on_header: H,
) -> Result<(), Malformed>
where
    H: FnMut(&str, &str),
{
    for line in lines {
        if line.is_empty() {
            return Ok(());
        }
        let (key, value) = line.split_once(':').ok_or(Malformed)?;
        on_header(key, value.trim());
    }
    // Never saw the terminating blank line
    Err(Malformed)
}
