//! 로컬/서버 시계 오프셋 관리.
//!
//! 서명 요청의 타임스탬프는 `로컬 시각 + 오프셋`으로 계산됩니다. 오프셋은
//! 서버 시각 조회의 송수신 중간 시점을 기준으로 추정하며, 재동기화는
//! 최소 간격(기본 2초)으로 제한됩니다.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use trader_core::SharedClock;

#[derive(Debug, Default)]
struct OffsetState {
    offset_ms: i64,
    last_resync: Option<DateTime<Utc>>,
}

/// 로컬/서버 시계 오프셋.
pub struct ClockOffset {
    clock: SharedClock,
    min_resync_interval: Duration,
    state: Mutex<OffsetState>,
}

impl ClockOffset {
    /// 새 오프셋 추적기.
    pub fn new(clock: SharedClock, min_resync_interval: Duration) -> Self {
        Self {
            clock,
            min_resync_interval,
            state: Mutex::new(OffsetState::default()),
        }
    }

    /// 현재 오프셋 (밀리초, 서버 - 로컬).
    pub fn offset_ms(&self) -> i64 {
        self.lock().offset_ms
    }

    /// 로컬 시각.
    pub fn local_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 서버 기준 현재 타임스탬프 (밀리초).
    pub fn server_timestamp_ms(&self) -> i64 {
        self.clock.now().timestamp_millis() + self.offset_ms()
    }

    /// 지금 재동기화가 허용되는지 확인.
    pub fn can_resync(&self) -> bool {
        let state = self.lock();
        match state.last_resync {
            Some(last) => self.clock.now() - last >= self.min_resync_interval,
            None => true,
        }
    }

    /// 서버 시각 응답으로 오프셋 갱신.
    ///
    /// `sent_at`/`received_at`은 로컬 송수신 시각이며, 서버 시각은 그 중간 시점에
    /// 대응한다고 가정합니다.
    pub fn apply_server_time(&self, server_ms: i64, sent_at: DateTime<Utc>, received_at: DateTime<Utc>) -> i64 {
        let midpoint = sent_at.timestamp_millis()
            + (received_at.timestamp_millis() - sent_at.timestamp_millis()) / 2;
        let offset = server_ms - midpoint;

        let mut state = self.lock();
        state.offset_ms = offset;
        state.last_resync = Some(received_at);
        tracing::info!(offset_ms = offset, "Clock offset resynchronized");
        offset
    }

    /// 재동기화 시도를 기록 (실패해도 간격 제한 적용).
    pub fn mark_resync_attempt(&self) {
        self.lock().last_resync = Some(self.clock.now());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OffsetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
