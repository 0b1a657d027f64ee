use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Reply to a co-location probe (`x-nexe-colocated: <salt>:<addr>`) with `HMAC-SHA1(salt, addr)`
/// so a peer can confirm co-location without this node revealing its own address.
pub fn reply(probe: &str) -> Option<String> {
    let (salt, addr) = probe.split_once(':')?;
    let mut mac = HmacSha1::new_from_slice(salt.as_bytes()).ok()?;
    mac.update(addr.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_with_a_deterministic_hex_digest() {
        let a = reply("saltvalue:10.0.0.1:8080").unwrap();
        let b = reply("saltvalue:10.0.0.1:8080").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn different_addresses_produce_different_replies() {
        let a = reply("salt:10.0.0.1").unwrap();
        let b = reply("salt:10.0.0.2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_probe_without_a_colon_is_rejected() {
        assert_eq!(reply("no-colon-here"), None);
    }
}
