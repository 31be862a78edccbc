//! 거래소 HTTP 전송 계층.
//!
//! 게이트웨이는 서명된 요청을 [`Transport`]에 넘기기만 하므로, 테스트에서는
//! 스크립트된 전송 계층으로 교체할 수 있습니다.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

use crate::ExchangeError;

/// HTTP 메서드.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// 전송할 요청. `query`는 이미 서명이 끝난 최종 문자열입니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: String,
    /// `X-MBX-APIKEY` 헤더 필요 여부
    pub with_api_key: bool,
}

/// 원시 응답.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// 요청 전송 trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// 요청을 보내고 원시 응답을 반환합니다. 네트워크 실패만 에러입니다.
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError>;
}

/// reqwest 기반 HTTP 전송 계층.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpTransport {
    /// 새 HTTP 전송 계층.
    pub fn new(base_url: impl Into<String>, api_key: SecretString, timeout: Duration) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!(method = %request.method, path = %request.path, "Sending exchange request");

        let builder = match request.method {
            HttpMethod::Get | HttpMethod::Delete => {
                let full_url = if request.query.is_empty() {
                    url
                } else {
                    format!("{}?{}", url, request.query)
                };
                if request.method == HttpMethod::Get {
                    self.client.get(full_url)
                } else {
                    self.client.delete(full_url)
                }
            }
            HttpMethod::Post | HttpMethod::Put => {
                let builder = if request.method == HttpMethod::Post {
                    self.client.post(url)
                } else {
                    self.client.put(url)
                };
                builder
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(request.query.clone())
            }
        };

        let builder = if request.with_api_key {
            builder.header("X-MBX-APIKEY", self.api_key.expose_secret())
        } else {
            builder
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ApiResponse { status, body })
    }
}
