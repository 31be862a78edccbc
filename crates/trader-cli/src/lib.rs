//! CLI 도구 모음.
//!
//! 이 crate는 다음 기능을 제공합니다:
//! - 계층형 애플리케이션 설정
//! - 재생 파일 백테스트
//! - 모의투자 / 실거래 실행 루프

pub mod commands;
pub mod config;

pub use config::AppConfig;
