//! Stateless CSRF tokens.
//!
//! A token is `<nonce>.<hex HMAC-SHA256(secret, nonce)>`. The server embeds
//! a fresh token in the page it serves; clients echo it back in the
//! `X-CSRF-Token` header on state-changing requests.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER: &str = "X-CSRF-Token";

#[derive(Clone)]
pub struct CsrfKey {
    secret: Vec<u8>,
}

impl CsrfKey {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// A key that only lives as long as the process.
    pub fn random() -> Self {
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        let mut secret = a.as_bytes().to_vec();
        secret.extend_from_slice(b.as_bytes());
        Self { secret }
    }

    pub fn issue(&self) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let sig = self.sign(&nonce);
        format!("{}.{}", nonce, sig)
    }

    pub fn verify(&self, token: &str) -> bool {
        let Some((nonce, sig)) = token.split_once('.') else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(sig) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(nonce.as_bytes());
        mac.verify_slice(&sig_bytes).is_ok()
    }

    fn sign(&self, nonce: &str) -> String {
        let mut mac = self.mac();
        mac.update(nonce.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_token_verifies() {
        let key = CsrfKey::new("secret");
        let token = key.issue();
        assert!(key.verify(&token));
    }

    #[test]
    fn test_tampered_or_foreign_tokens_fail() {
        let key = CsrfKey::new("secret");
        let token = key.issue();
        let (nonce, _) = token.split_once('.').unwrap();
        assert!(!key.verify(&format!("{}.deadbeef", nonce)));
        assert!(!key.verify("no-dot"));
        assert!(!key.verify(""));
        assert!(!CsrfKey::new("other").verify(&token));
    }
}
