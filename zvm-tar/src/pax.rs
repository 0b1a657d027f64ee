use std::collections::BTreeMap;

/// Render one PAX extended header record (`"<len> key=value\n"`), where `<len>` counts its own
/// digits. The length is only stable once a candidate's rendered length matches the length it
/// declares, so this iterates to a fixed point, the standard PAX record encoding algorithm.
pub fn record(key: &str, value: &str) -> String {
    let mut len = key.len() + value.len() + 3; // b' ' + b'=' + b'\n'
    loop {
        let candidate = format!("{len} {key}={value}\n");
        if candidate.len() == len {
            return candidate;
        }
        len = candidate.len();
    }
}

/// Render a full PAX extended header body from a set of key/value pairs, in the given order.
pub fn body(headers: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in headers {
        out.extend_from_slice(record(key, value).as_bytes());
    }
    out
}

/// Parse a PAX extended header body into key/value pairs, skipping any record that is malformed
/// rather than failing the whole parse (a generator-crafted extra key is not fatal to the entries
/// that matter to this system).
pub fn parse(data: &[u8]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    let text = String::from_utf8_lossy(data);
    let mut rest = text.as_ref();
    while !rest.is_empty() {
        let Some(space) = rest.find(' ') else { break };
        let Ok(len) = rest[..space].parse::<usize>() else {
            break;
        };
        if len == 0 || len > rest.len() {
            break;
        }
        let record = &rest[space + 1..len];
        if let Some((key, value)) = record.trim_end_matches('\n').split_once('=') {
            headers.insert(key.to_string(), value.to_string());
        }
        rest = &rest[len..];
    }
    headers
}
