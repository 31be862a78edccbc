//! Circuit Breaker pattern implementation.
//!
//! 거래소 장애 시 주문 폭주를 막고, 복구 여부를 단일 프로브 요청으로 확인합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[연속 실패 임계치 도달]──> Open
//!    ↑                                 │
//!    │                          [쿨다운 경과]
//!    │                                 ↓
//!    └──[프로브 성공]── HalfOpen ──[프로브 실패]──> Open
//! ```
//!
//! 시각은 주입된 [`Clock`](trader_core::Clock)에서 얻으므로 백테스트에서도
//! 논리 시각 기준으로 동작합니다. 취소 요청은 차단기를 거치지 않습니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use trader_core::SharedClock;

use crate::ExchangeError;

/// Circuit Breaker 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 정상 상태 - 모든 요청 허용
    Closed,
    /// 장애 상태 - 모든 요청 즉시 거부
    Open,
    /// 복구 테스트 상태 - 단일 프로브만 허용
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit Breaker 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 연속 실패 임계치
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Open 상태 유지 시간 (밀리초, 이후 HalfOpen으로 전이)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
} // 30초

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// 새 설정 생성.
    pub fn new(failure_threshold: u32, reset_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms: reset_timeout_secs * 1000,
        }
    }

    /// 쿨다운 기간.
    pub fn reset_timeout(&self) -> Duration {
        Duration::milliseconds(self.reset_timeout_ms as i64)
    }
}

/// Circuit Breaker 내부 상태.
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_state_change: DateTime<Utc>,
    trial_in_flight: bool,
}

/// Circuit Breaker.
///
/// # Example
///
/// ```ignore
/// let cb = CircuitBreaker::new("binance", CircuitBreakerConfig::default(), clock);
///
/// cb.try_acquire()?;
/// let result = transport.send(request).await;
/// cb.record_result(&result);
/// ```
pub struct CircuitBreaker {
    /// 서비스 이름 (로깅 및 메트릭용)
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    state: RwLock<CircuitBreakerState>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    open_count: AtomicU64,
}

impl CircuitBreaker {
    /// 새 Circuit Breaker 생성.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            state: RwLock::new(CircuitBreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_state_change: now,
                trial_in_flight: false,
            }),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
        }
    }

    /// 서비스 이름 반환.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 현재 상태 반환. 쿨다운이 지났으면 HalfOpen으로 보고합니다.
    pub fn state(&self) -> CircuitState {
        let mut state = self.write_state();
        self.maybe_transition_from_open(&mut state);
        state.state
    }

    /// 요청 허가 획득.
    ///
    /// HalfOpen에서는 진행 중인 프로브가 없을 때 한 건만 허가합니다.
    pub fn try_acquire(&self) -> Result<(), ExchangeError> {
        let mut state = self.write_state();
        self.maybe_transition_from_open(&mut state);

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = self.clock.now() - state.last_state_change;
                let remaining = (self.config.reset_timeout() - elapsed).num_milliseconds();
                Err(ExchangeError::CircuitOpen {
                    remaining_ms: remaining.max(0) as u64,
                })
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return Err(ExchangeError::CircuitOpen { remaining_ms: 0 });
                }
                state.trial_in_flight = true;
                tracing::info!(circuit_breaker = %self.name, "Half-open trial request admitted");
                Ok(())
            }
        }
    }

    /// 성공 기록. HalfOpen 프로브가 성공하면 Closed로 전이합니다.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.write_state();

        match state.state {
            CircuitState::HalfOpen => {
                self.transition_to(&mut state, CircuitState::Closed);
                tracing::info!(
                    circuit_breaker = %self.name,
                    "Circuit breaker recovered: HalfOpen -> Closed"
                );
            }
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// 실패 기록.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.write_state();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    let failures = state.consecutive_failures;
                    self.transition_to(&mut state, CircuitState::Open);
                    self.open_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        circuit_breaker = %self.name,
                        consecutive_failures = failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker tripped: Closed -> Open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(&mut state, CircuitState::Open);
                self.open_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    circuit_breaker = %self.name,
                    "Circuit breaker trial request failed: HalfOpen -> Open"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// ExchangeError 기반 결과 기록.
    ///
    /// 거래소가 응답한 주문 수준 거부는 장애로 보지 않고 성공으로 집계합니다.
    pub fn record_result<T>(&self, result: &Result<T, ExchangeError>) {
        match result {
            Err(e) if e.counts_as_outage() => self.record_failure(),
            Err(ExchangeError::CircuitOpen { .. }) => {}
            _ => self.record_success(),
        }
    }

    /// 수동으로 Circuit 리셋.
    pub fn reset(&self) {
        let mut state = self.write_state();
        self.transition_to(&mut state, CircuitState::Closed);
        tracing::info!(circuit_breaker = %self.name, "Circuit breaker manually reset");
    }

    /// 메트릭 반환.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            time_in_current_state: self.clock.now() - state.last_state_change,
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, CircuitBreakerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Open 상태에서 쿨다운이 경과했으면 HalfOpen으로 전이.
    fn maybe_transition_from_open(&self, state: &mut CircuitBreakerState) {
        if state.state == CircuitState::Open
            && self.clock.now() - state.last_state_change >= self.config.reset_timeout()
        {
            self.transition_to(state, CircuitState::HalfOpen);
            tracing::info!(
                circuit_breaker = %self.name,
                "Circuit breaker cool-down elapsed: Open -> HalfOpen"
            );
        }
    }

    fn transition_to(&self, state: &mut CircuitBreakerState, new_state: CircuitState) {
        state.state = new_state;
        state.last_state_change = self.clock.now();
        state.trial_in_flight = false;
        if new_state == CircuitState::Closed {
            state.consecutive_failures = 0;
        }
    }
}

/// Circuit Breaker 메트릭.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// 서비스 이름
    pub name: String,
    /// 현재 상태
    pub state: CircuitState,
    /// 현재 연속 실패 횟수
    pub consecutive_failures: u32,
    /// 총 실패 횟수
    pub total_failures: u64,
    /// 총 성공 횟수
    pub total_successes: u64,
    /// Circuit Open 횟수
    pub open_count: u64,
    /// 현재 상태 유지 시간
    pub time_in_current_state: Duration,
}
