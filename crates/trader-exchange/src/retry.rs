//! 일시적 오류에 대한 재시도 유틸리티.
//!
//! 지수 백오프 + 무작위 지터를 적용하며, [`ErrorClass::Transient`] 에러만 재시도합니다.
//!
//! [`ErrorClass::Transient`]: trader_core::ErrorClass::Transient

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ExchangeError;

/// 재시도 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 최대 재시도 횟수 (초기 시도 제외)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 기본 대기 시간 (밀리초)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 최대 대기 시간 (밀리초)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 백오프 배수
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 지터 비율 (0.25 = ±25%)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_ratio() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    /// 재시도 없음 (단일 시도).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// 지터 없는 설정 (테스트용 결정적 지연).
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// n번째 재시도(0부터) 전 대기 시간.
    pub fn delay_for(&self, attempt: u32, error: &ExchangeError) -> Duration {
        let base = error.retry_delay_ms().unwrap_or(self.base_delay_ms);
        let scaled = base as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay_ms as f64);

        let jittered = if self.jitter_ratio > 0.0 {
            let spread = capped * self.jitter_ratio;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// 재시도가 포함된 비동기 작업 실행.
///
/// 일시적 에러가 아니거나 재시도 횟수를 소진하면 마지막 에러를 반환합니다.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Request succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= config.max_retries => {
                warn!(error = %e, attempts = attempt + 1, "Retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(attempt, &e);
                debug!(
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.0,
        };
        let err = ExchangeError::Unknown("x".into());
        assert_eq!(config.delay_for(0, &err), Duration::from_millis(100));
        assert_eq!(config.delay_for(1, &err), Duration::from_millis(200));
        assert_eq!(config.delay_for(5, &err), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            ..Default::default()
        };
        let err = ExchangeError::Unknown("x".into());
        for _ in 0..50 {
            let delay = config.delay_for(0, &err).as_millis();
            assert!((750..=1250).contains(&delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default().without_jitter();

        let result = with_retry(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Timeout("slow".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::SignatureInvalid("bad".into())) }
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::SignatureInvalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            ..Default::default()
        };
        let result: Result<(), _> = with_retry(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::NetworkError("reset".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
