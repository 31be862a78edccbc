//! 요청 전 토큰 버킷 rate limiter.
//!
//! 버킷이 비어 있으면 다음 토큰이 채워질 때까지 대기합니다. 시간은
//! `tokio::time`을 사용하므로 테스트에서 일시정지/전진이 가능합니다.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate Limiter 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 분당 최대 요청 수
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// 버스트 허용량 (순간적으로 허용되는 추가 요청)
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_requests_per_minute() -> u32 {
    1200
}
fn default_burst_size() -> u32 {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
        }
    }
}

/// Token Bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    /// 초당 리필되는 토큰 수
    refill_rate: f64,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let refill_rate = (config.requests_per_minute.max(1)) as f64 / 60.0;
        let max_tokens = (refill_rate + config.burst_size as f64).max(1.0);
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// 토큰 소비 시도. 실패 시 다음 토큰까지 대기 시간 반환.
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }
}

/// 거래소 요청용 Rate Limiter.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// 새 Rate Limiter 생성.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(config)),
        }
    }

    /// 토큰을 하나 얻을 때까지 대기.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_acquire() {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}
