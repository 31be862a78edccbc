//! 백테스팅 및 모의투자를 위한 시뮬레이션 거래소.
//!
//! - 시장가 주문 즉시 체결 (슬리피지 + 테이커 수수료)
//! - 지정가 익절/스탑 시장가 주문의 틱 기반 트리거
//! - 심볼별 포지션 및 지갑 잔고 추적
//!
//! # 예제
//!
//! ```ignore
//! use trader_exchange::simulated::{SimulatedExchange, SimulatedConfig};
//!
//! let mut exchange = SimulatedExchange::new(SimulatedConfig::default(), start);
//! let fills = exchange.on_tick(&tick);
//! ```

mod exchange;
mod matching_engine;

pub use exchange::{SimulatedConfig, SimulatedExchange};
pub use matching_engine::{MatchingEngine, OrderMatch, RestingOrder};
