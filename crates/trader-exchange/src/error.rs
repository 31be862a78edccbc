//! 거래소 에러 타입.

use thiserror::Error;
use trader_core::ErrorClass;

/// 거래소 관련 에러.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 거래소 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 인증/권한 에러 (잘못된 API 키)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 서명 불일치
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// 요청 한도 초과
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// 분류되지 않은 API 에러 코드
    #[error("API error {code}: {message}")]
    ApiError { code: i32, message: String },

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 유효하지 않은 수량
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// 타임스탬프가 recvWindow 밖
    #[error("Timestamp error: {0}")]
    TimestampError(String),

    /// 잔고 부족
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    /// 주문을 찾을 수 없음
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// 심볼을 찾을 수 없음
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// 중복 클라이언트 주문 ID
    #[error("Duplicate client order id: {0}")]
    DuplicateClientOrderId(String),

    /// 주문 거부됨
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// 회로 차단기 열림 (로컬 거부)
    #[error("Circuit open: retry in {remaining_ms}ms")]
    CircuitOpen { remaining_ms: u64 },

    /// WebSocket 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 서버 에러 (5xx)
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// 에러 분류.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExchangeError::NetworkError(_)
            | ExchangeError::Disconnected(_)
            | ExchangeError::RateLimited(_)
            | ExchangeError::TimestampError(_)
            | ExchangeError::WebSocket(_)
            | ExchangeError::Timeout(_)
            | ExchangeError::ServerError { .. }
            | ExchangeError::DuplicateClientOrderId(_) => ErrorClass::Transient,
            ExchangeError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            ExchangeError::Unauthorized(_)
            | ExchangeError::SignatureInvalid(_)
            | ExchangeError::ApiError { .. }
            | ExchangeError::ParseError(_)
            | ExchangeError::InvalidQuantity(_)
            | ExchangeError::InsufficientBalance(_)
            | ExchangeError::OrderNotFound(_)
            | ExchangeError::SymbolNotFound(_)
            | ExchangeError::OrderRejected(_)
            | ExchangeError::Unknown(_) => ErrorClass::Fatal,
        }
    }

    /// 재시도 가능한 에러인지 확인.
    ///
    /// 타임스탬프 에러와 중복 ID는 게이트웨이가 별도로 처리하므로 일반 재시도 대상이 아닙니다.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
            && !matches!(
                self,
                ExchangeError::TimestampError(_) | ExchangeError::DuplicateClientOrderId(_)
            )
    }

    /// 권장 재시도 대기 시간(밀리초) 반환.
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimited(_) => Some(5000),
            ExchangeError::NetworkError(_) => Some(1000),
            ExchangeError::Disconnected(_) => Some(5000),
            ExchangeError::Timeout(_) => Some(500),
            ExchangeError::WebSocket(_) => Some(2000),
            ExchangeError::ServerError { .. } => Some(1000),
            ExchangeError::TimestampError(_) => Some(100),
            _ => None,
        }
    }

    /// 재시도하면 안 되는 치명적 에러인지 확인.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// 회로 차단기 실패로 집계할 에러인지 확인.
    ///
    /// 주문 자체의 문제(잔고 부족, 수량 오류 등)는 거래소 장애가 아니므로 제외합니다.
    pub fn counts_as_outage(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::Disconnected(_)
                | ExchangeError::Timeout(_)
                | ExchangeError::RateLimited(_)
                | ExchangeError::ServerError { .. }
                | ExchangeError::Unknown(_)
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_connect() {
            ExchangeError::NetworkError(err.to_string())
        } else if err.is_decode() {
            ExchangeError::ParseError(err.to_string())
        } else {
            ExchangeError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<ExchangeError> for trader_core::TraderError {
    fn from(err: ExchangeError) -> Self {
        trader_core::TraderError::Exchange {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Binance 에러 코드를 거래소 에러로 변환.
pub fn map_binance_code(code: i32, message: &str) -> ExchangeError {
    let msg = message.to_string();
    match code {
        -1021 => ExchangeError::TimestampError(msg),
        -1022 => ExchangeError::SignatureInvalid(msg),
        -2014 | -2015 => ExchangeError::Unauthorized(msg),
        -1003 => ExchangeError::RateLimited(msg),
        -1121 => ExchangeError::SymbolNotFound(msg),
        -2019 | -2010 => ExchangeError::InsufficientBalance(msg),
        -4116 => ExchangeError::DuplicateClientOrderId(msg),
        -4015 => ExchangeError::OrderRejected(msg),
        -2011 | -2013 => ExchangeError::OrderNotFound(msg),
        -1111 | -4003 | -1013 => ExchangeError::InvalidQuantity(msg),
        -1001 => ExchangeError::Disconnected(msg),
        -1007 => ExchangeError::Timeout(msg),
        _ => ExchangeError::ApiError { code, message: msg },
    }
}
