//! HMAC-SHA256 요청 서명.
//!
//! 서명 대상 쿼리는 `recvWindow`와 `timestamp`가 포함된 최종 문자열이며,
//! 서명 이후에는 `&signature=...`만 덧붙입니다.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// API 시크릿 기반 서명기.
pub struct RequestSigner {
    api_secret: SecretString,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_secret", &"***REDACTED***")
            .finish()
    }
}

impl RequestSigner {
    pub fn new(api_secret: SecretString) -> Self {
        Self { api_secret }
    }

    /// 쿼리 문자열 서명 (hex).
    pub fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.expose_secret().as_bytes())
            .map_err(|e| ExchangeError::SignatureInvalid(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// 파라미터를 서명하고 `signature`를 붙인 최종 쿼리를 만듭니다.
    pub fn signed_query(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let query = build_query(params);
        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }
}

/// `k=v&k=v` 쿼리 문자열 생성 (순서 유지).
pub fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
