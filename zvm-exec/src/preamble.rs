use std::collections::HashMap;

/// A parsed status line + headers prefix of a `message/http` or `message/cgi` channel file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    /// The status line, e.g. `HTTP/1.1 200 OK`.
    pub status_line: String,
    /// Headers declared before the blank line, in declaration order.
    pub headers: Vec<(String, String)>,
    /// Byte offset into the channel file where the body starts (right after the blank line).
    pub offset: u64,
}

/// `message/cgi` has no status line of its own; one is synthesized before parsing proceeds exactly
/// like `message/http`.
const SYNTHETIC_CGI_STATUS_LINE: &str = "HTTP/1.1 200 OK";

/// Parse a channel file's CGI/HTTP preamble out of its raw bytes. `is_cgi` selects whether a
/// status line must be synthesized (`message/cgi`) or is expected to already be present
/// (`message/http`). Returns `None` if the bytes don't look like a preamble at all (no header
/// terminator found), which the caller treats as "no preamble, handle the file opaquely".
pub fn parse(content_type: &str, data: &[u8]) -> Option<Preamble> {
    let is_cgi = content_type.eq_ignore_ascii_case("message/cgi");
    if !is_cgi && !content_type.eq_ignore_ascii_case("message/http") {
        return None;
    }

    let terminator = find_header_terminator(data)?;
    let head = std::str::from_utf8(&data[..terminator]).ok()?;
    let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));

    let status_line = if is_cgi {
        SYNTHETIC_CGI_STATUS_LINE.to_string()
    } else {
        lines.next()?.trim_end_matches('\r').to_string()
    };

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some(Preamble {
        status_line,
        headers,
        offset: terminator as u64,
    })
}

/// Collect the `x-object-meta-*` headers out of a parsed preamble, stripping the prefix.
pub fn object_meta(preamble: &Preamble) -> HashMap<String, String> {
    preamble
        .headers
        .iter()
        .filter_map(|(name, value)| {
            name.to_ascii_lowercase()
                .strip_prefix("x-object-meta-")
                .map(|key| (key.to_string(), value.clone()))
        })
        .collect()
}

fn find_header_terminator(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| data.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}
