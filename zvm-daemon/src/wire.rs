/// Every frame (request manifest or response report) is prefixed by exactly this many ASCII
/// bytes spelling out the payload length as `0x%06x`.
pub const FRAME_PREFIX_LEN: usize = 8;

/// Prefix `payload` with its `0x%06x`-formatted length.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
    out.extend_from_slice(length_prefix(payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Render a length as the wire's `0x%06x` prefix.
pub fn length_prefix(len: usize) -> String {
    format!("0x{len:06x}")
}

/// Parse an 8-byte length prefix (`int(..., 0)` on the other end, i.e. hex with an `0x` prefix).
pub fn parse_length(prefix: &[u8; FRAME_PREFIX_LEN]) -> Option<usize> {
    let text = std::str::from_utf8(prefix).ok()?;
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    usize::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_parse_length() {
        let payload = b"hello";
        let framed = frame(payload);
        let prefix: [u8; FRAME_PREFIX_LEN] = framed[..FRAME_PREFIX_LEN].try_into().unwrap();
        assert_eq!(parse_length(&prefix), Some(payload.len()));
        assert_eq!(&framed[FRAME_PREFIX_LEN..], payload);
    }

    #[test]
    fn length_prefix_is_always_exactly_8_bytes() {
        assert_eq!(length_prefix(0).len(), FRAME_PREFIX_LEN);
        assert_eq!(length_prefix(65536).len(), FRAME_PREFIX_LEN);
    }

    #[test]
    fn rejects_a_prefix_without_the_0x_marker() {
        let prefix = *b"00000010";
        assert_eq!(parse_length(&prefix), None);
    }
}
