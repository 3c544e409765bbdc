use crate::errors::Error;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Keyed, timestamped envelope shared with the coordinator. A signed message
/// is `<json>.<unix-seconds>.<hex hmac-sha256>`, where the MAC covers
/// everything before the final dot. Verification enforces a maximum age in
/// seconds, with the same tolerance applied to clock skew in either
/// direction.
pub struct TimedSigner {
    key: Vec<u8>,
}

impl TimedSigner {
    pub fn new(key: &str) -> Self {
        TimedSigner {
            key: key.as_bytes().to_vec(),
        }
    }

    pub fn dumps(&self, payload: &Value) -> Result<String, Error> {
        self.dumps_at(payload, Utc::now().timestamp())
    }

    pub(crate) fn dumps_at(&self, payload: &Value, timestamp: i64) -> Result<String, Error> {
        let body = format!("{}.{}", serde_json::to_string(payload)?, timestamp);
        let signature = hex::encode(self.mac_of(&body).finalize().into_bytes());
        Ok(format!("{}.{}", body, signature))
    }

    pub fn loads(&self, text: &str, max_age: i64) -> Result<Value, Error> {
        self.loads_at(text, max_age, Utc::now().timestamp())
    }

    pub(crate) fn loads_at(&self, text: &str, max_age: i64, now: i64) -> Result<Value, Error> {
        // The payload may contain dots, so split from the right.
        let mut parts = text.trim().rsplitn(3, '.');
        let signature = parts.next();
        let timestamp = parts.next();
        let payload = parts.next();
        let (signature, timestamp, payload) = match (signature, timestamp, payload) {
            (Some(s), Some(t), Some(p)) => (s, t, p),
            _ => return Err(Error::SignatureInvalid(s!("malformed envelope"))),
        };

        let raw_signature = hex::decode(signature)
            .map_err(|_| Error::SignatureInvalid(s!("signature is not hex")))?;
        let body = format!("{}.{}", payload, timestamp);
        self.mac_of(&body)
            .verify_slice(&raw_signature)
            .map_err(|_| Error::SignatureInvalid(s!("signature mismatch")))?;

        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| Error::SignatureInvalid(s!("bad timestamp")))?;
        if now - timestamp > max_age {
            return Err(Error::SignatureInvalid(format!(
                "stale message: {}s old, max {}s",
                now - timestamp,
                max_age
            )));
        }
        if timestamp - now > max_age {
            return Err(Error::SignatureInvalid(format!(
                "message from the future: {}s ahead",
                timestamp - now
            )));
        }

        serde_json::from_str(payload).map_err(|e| e.into())
    }

    fn mac_of(&self, body: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(body.as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip() {
        let signer = TimedSigner::new("secret");
        let payload = json!({"currency": "LTC", "pids": ["p1", "p2"]});
        let signed = signer.dumps(&payload).unwrap();
        assert_eq!(signer.loads(&signed, 10).unwrap(), payload);
    }

    #[test]
    fn payload_dots_survive() {
        let signer = TimedSigner::new("secret");
        let payload = json!({"amount": "0.50000000"});
        let signed = signer.dumps(&payload).unwrap();
        assert_eq!(signer.loads(&signed, 10).unwrap(), payload);
    }

    #[test]
    fn tampering_is_detected() {
        let signer = TimedSigner::new("secret");
        let signed = signer.dumps(&json!({"result": true})).unwrap();
        let tampered = signed.replace("true", "altered");
        match signer.loads(&tampered, 10) {
            Err(Error::SignatureInvalid(_)) => {}
            other => panic!("expected SignatureInvalid, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = TimedSigner::new("secret");
        let signed = signer.dumps(&json!({"result": true})).unwrap();
        assert!(TimedSigner::new("other").loads(&signed, 10).is_err());
    }

    #[test]
    fn stale_and_future_messages_are_rejected() {
        let signer = TimedSigner::new("secret");
        let now = Utc::now().timestamp();
        let old = signer.dumps_at(&json!({}), now - 60).unwrap();
        assert!(signer.loads_at(&old, 10, now).is_err());
        let fresh = signer.dumps_at(&json!({}), now - 5).unwrap();
        assert!(signer.loads_at(&fresh, 10, now).is_ok());
        let future = signer.dumps_at(&json!({}), now + 60).unwrap();
        assert!(signer.loads_at(&future, 10, now).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let signer = TimedSigner::new("secret");
        assert!(signer.loads("no dots here", 10).is_err());
        assert!(signer.loads("{}.123", 10).is_err());
    }
}
