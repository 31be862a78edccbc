//! 트레이딩 시스템의 에러 타입과 에러 분류 체계.
//!
//! 모든 크레이트의 에러는 [`ErrorClass`]로 분류되어, 운영자가
//! "스스로 복구됨"과 "개입 필요"를 구분할 수 있도록 합니다.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 에러 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 일시적 오류 (타임아웃, 요청 한도, 타임스탬프 드리프트) - 재시도 대상
    Transient,
    /// 서킷 브레이커가 열려 로컬에서 거부됨
    CircuitOpen,
    /// 치명적 오류 (서명 실패, 알 수 없는 심볼, 잔고 부족, 불변식 위반)
    Fatal,
    /// 로컬/원격 상태 불일치 - 원장 보정 후 계속
    Drift,
}

impl ErrorClass {
    /// 자동 복구가 기대되는 분류인지 확인.
    pub fn is_self_healing(&self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::CircuitOpen => write!(f, "circuit_open"),
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Drift => write!(f, "drift"),
        }
    }
}

/// 핵심 트레이딩 에러.
#[derive(Debug, Error)]
pub enum TraderError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 거래소 에러
    #[error("거래소 에러 ({class}): {message}")]
    Exchange { class: ErrorClass, message: String },

    /// 주문 에러
    #[error("주문 에러: {0}")]
    Order(String),

    /// 포지션 에러
    #[error("포지션 에러: {0}")]
    Position(String),

    /// 리스크 에러
    #[error("리스크 에러: {0}")]
    Risk(String),

    /// 불변식 위반
    #[error("불변식 위반: {0}")]
    Invariant(String),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),

    /// 입출력 에러
    #[error("입출력 에러: {0}")]
    Io(String),
}

/// 트레이딩 작업을 위한 Result 타입.
pub type TraderResult<T> = Result<T, TraderError>;

impl TraderError {
    /// 에러 분류.
    pub fn class(&self) -> ErrorClass {
        match self {
            TraderError::Exchange { class, .. } => *class,
            TraderError::Io(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<serde_json::Error> for TraderError {
    fn from(err: serde_json::Error) -> Self {
        TraderError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TraderError {
    fn from(err: std::io::Error) -> Self {
        TraderError::Io(err.to_string())
    }
}
