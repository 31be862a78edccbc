//! # Trader Core
//!
//! 포지션/주문 라이프사이클 엔진의 핵심 도메인 모델 및 공통 인프라.
//!
//! 이 크레이트는 워크스페이스 전반에서 사용되는 기본 타입을 제공합니다:
//! - 시그널, 주문 의도, 체결 이벤트
//! - 포지션, DCA 체결, 청산 주문, 아카이브 거래
//! - 계좌 상태
//! - 논리 시계 (라이브/백테스트 공용)
//! - 에러 분류 체계
//! - 설정 로딩 및 로깅 인프라

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod types;

pub use clock::*;
pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use types::*;
