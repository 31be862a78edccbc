//! 거래소 게이트웨이 및 시뮬레이션 거래소.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Binance USDT-M 선물 게이트웨이 (서명, 시계 동기화, 재시도, 회로 차단기)
//! - 시장 데이터 / 사용자 데이터 WebSocket 스트림 (자동 재연결)
//! - 모의투자/백테스트용 시뮬레이션 거래소
//! - 거래소 에러 분류

pub mod circuit_breaker;
pub mod error;
pub mod gateway;
pub mod market_stream;
pub mod rate_limiter;
pub mod retry;
pub mod signer;
pub mod simulated;
pub mod time_sync;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use error::*;
pub use gateway::{Credentials, ExchangeGateway, GatewayConfig, GatewayResult};
pub use market_stream::{
    parse_user_fill, MarketDataConfig, MarketDataStream, MarketMessageParser, ReconnectBackoff,
    UserDataStream,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{with_retry, RetryConfig};
pub use signer::RequestSigner;
pub use simulated::{MatchingEngine, OrderMatch, RestingOrder, SimulatedConfig, SimulatedExchange};
pub use time_sync::ClockOffset;
pub use transport::{ApiRequest, ApiResponse, HttpMethod, HttpTransport, Transport};
