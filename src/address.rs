use sha2::{Digest, Sha256};

/// Extract the version byte of a base58check address, or `None` if the
/// string is not valid base58check. The coordinator is trusted for amounts
/// but never for addresses; every pulled address goes through this.
pub fn address_version(address: &str) -> Option<u8> {
    let raw = bs58::decode(address).into_vec().ok()?;
    if raw.len() < 5 {
        return None;
    }
    let (payload, checksum) = raw.split_at(raw.len() - 4);
    let digest = Sha256::digest(&Sha256::digest(payload));
    if digest[..4] != checksum[..] {
        return None;
    }
    Some(payload[0])
}

pub fn version_matches(address: &str, valid_versions: &[u8]) -> bool {
    match address_version(address) {
        Some(version) => valid_versions.contains(&version),
        None => false,
    }
}

#[cfg(test)]
pub(crate) fn encode_with_version(version: u8, body: &[u8]) -> String {
    let mut payload = Vec::with_capacity(body.len() + 5);
    payload.push(version);
    payload.extend_from_slice(body);
    let digest = Sha256::digest(&Sha256::digest(&payload));
    payload.extend_from_slice(&digest[..4]);
    bs58::encode(payload).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_mainnet_versions() {
        // Genesis block coinbase address, version 0.
        assert_eq!(
            address_version("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            Some(0)
        );
        // Classic pay-to-script-hash example, version 5.
        assert_eq!(
            address_version("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"),
            Some(5)
        );
    }

    #[test]
    fn round_trips_synthetic_versions() {
        let addr = encode_with_version(48, &[7u8; 20]);
        assert_eq!(address_version(&addr), Some(48));
        assert!(version_matches(&addr, &[48]));
        assert!(!version_matches(&addr, &[0, 5]));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(address_version(""), None);
        assert_eq!(address_version("0OIl-not-base58"), None);
        // Valid base58 but wrong checksum.
        assert_eq!(address_version("1A1zP1eP5QGefi2DMPTfTL5SLmv7Divfxx"), None);
        // Too short to carry a checksum.
        assert_eq!(address_version("2g"), None);
    }
}
