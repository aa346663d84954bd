use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Hash method accepted in the signature header
const SIGNATURE_METHOD: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header must look like `sha256=<hex digest>`")]
    MalformedHeader,
    #[error("unsupported signature hash method `{0}`")]
    UnsupportedMethod(String),
    #[error("signature does not match the request body")]
    Mismatch,
}

/// Verify a `sha256=<hex>` header value against the HMAC-SHA256 of the raw
/// request body keyed with the subscription secret.
///
/// The digest comparison is constant-time.
pub fn verify(secret: &str, body: &[u8], header: &str) -> Result<(), SignatureError> {
    let (method, hex_digest) = header
        .split_once('=')
        .ok_or(SignatureError::MalformedHeader)?;

    if method != SIGNATURE_METHOD {
        return Err(SignatureError::UnsupportedMethod(method.to_owned()));
    }

    let digest = hex::decode(hex_digest).map_err(|_| SignatureError::MalformedHeader)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| SignatureError::Mismatch)
}

/// Compute the `sha256=<hex>` header value for a body; the counterpart of
/// [`verify`], used by producers and tests.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!(
        "{SIGNATURE_METHOD}={}",
        hex::encode(mac.finalize().into_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "s3cret";
    const BODY: &[u8] = br#"{"event":"order.created","amount":42}"#;

    #[test]
    fn signed_body_verifies() {
        let header = sign(SECRET, BODY);
        assert_eq!(verify(SECRET, BODY, &header), Ok(()));
    }

    #[test]
    fn any_change_in_body_is_rejected() {
        let header = sign(SECRET, BODY);
        let mut tampered = BODY.to_vec();
        tampered[0] ^= 0x01;
        assert_eq!(
            verify(SECRET, &tampered, &header),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn any_change_in_secret_is_rejected() {
        let header = sign(SECRET, BODY);
        assert_eq!(
            verify("s3creT", BODY, &header),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn header_without_equals_sign_is_malformed() {
        assert_eq!(
            verify(SECRET, BODY, "deadbeef"),
            Err(SignatureError::MalformedHeader)
        );
    }

    #[test]
    fn header_with_non_hex_digest_is_malformed() {
        assert_eq!(
            verify(SECRET, BODY, "sha256=not-hex"),
            Err(SignatureError::MalformedHeader)
        );
    }

    #[test]
    fn other_hash_methods_are_rejected() {
        assert_eq!(
            verify(SECRET, BODY, "sha1=deadbeef"),
            Err(SignatureError::UnsupportedMethod("sha1".to_owned()))
        );
    }

    #[test]
    fn wrong_digest_of_the_right_length_is_a_mismatch() {
        let header = format!("sha256={}", "ab".repeat(32));
        assert_eq!(verify(SECRET, BODY, &header), Err(SignatureError::Mismatch));
    }
}
