//! 리스크 관리 시스템.
//!
//! 이 crate는 다음 기능을 제공합니다:
//! - 손절 거리 기반 포지션 사이징
//! - 최소 명목가 / 레버리지 상한 검증
//! - 일일 손실 한도와 명시적 거래일 롤오버
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_risk::{RiskManager, RiskConfig};
//!
//! let manager = RiskManager::new(RiskConfig::default(), equity, today);
//! let sized = manager.size_entry(&signal, entry_price, stop_distance_pct)?;
//! ```

pub mod config;
pub mod limits;
pub mod manager;
pub mod position_sizing;

// 주요 타입 재내보내기
pub use config::RiskConfig;
pub use limits::{DailyLimitStatus, DailyLossTracker, PnLRecord};
pub use manager::{RiskManager, RiskRejection};
pub use position_sizing::{PositionSizer, SizedOrder};
