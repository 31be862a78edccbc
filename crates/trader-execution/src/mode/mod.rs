//! 실행 모드 어댑터.
//!
//! 엔진은 [`ExecutionAdapter`] trait만 보고 동작하므로 라이브, 모의투자, 백테스트가
//! 같은 라이프사이클 코드를 공유합니다.
//!
//! | 모드 | 거래소 | 시계 |
//! |------|--------|------|
//! | live | 서명된 REST + 사용자 데이터 스트림 | 시스템 시계 |
//! | paper | 시뮬레이션 거래소 | 시스템 시계 |
//! | backtest | 시뮬레이션 거래소 | 재생 틱 타임스탬프 |
//!
//! 체결은 항상 [`FillEvent`]로만 전달됩니다. 주문 응답의 체결 정보는 원장에 반영하지 않습니다.

mod live;
mod simulated;

pub use live::LiveAdapter;
pub use simulated::SimulatedAdapter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use trader_core::{ExecutionMode, FillEvent, OrderAck, OrderIntent, OrderSnapshot, PositionSnapshot, Tick};
use trader_exchange::ExchangeError;

/// 어댑터 작업 Result 타입.
pub type AdapterResult<T> = Result<T, ExchangeError>;

/// 엔진이 사용하는 실행 모드 인터페이스.
#[async_trait]
pub trait ExecutionAdapter: Send {
    /// 실행 모드.
    fn mode(&self) -> ExecutionMode;

    /// 현재 논리 시각.
    fn now(&self) -> DateTime<Utc>;

    // === 주문 ===

    /// 주문 제출.
    async fn submit_order(&mut self, intent: &OrderIntent) -> AdapterResult<OrderAck>;

    /// 클라이언트 주문 ID로 주문 취소.
    async fn cancel_order(&mut self, symbol: &str, client_order_id: &str) -> AdapterResult<()>;

    // === 조회 ===

    /// 거래소 포지션 스냅샷.
    async fn fetch_position(&mut self, symbol: &str) -> AdapterResult<PositionSnapshot>;

    /// 거래소 미체결 주문.
    async fn fetch_open_orders(&mut self, symbol: &str) -> AdapterResult<Vec<OrderSnapshot>>;

    /// 계좌 자산 (USDT).
    async fn fetch_equity(&mut self) -> AdapterResult<Decimal>;

    // === 이벤트 ===

    /// 논리 시계를 이벤트 시각으로 전진. 재생 시계가 없는 모드에서는 아무것도 하지 않습니다.
    fn advance_clock(&mut self, _at: DateTime<Utc>) {}

    /// 틱 전달. 이 틱으로 발생한 체결을 반환합니다.
    async fn on_tick(&mut self, tick: &Tick) -> Vec<FillEvent>;

    /// 대기 중인 체결 이벤트를 거래소 보고 순서대로 꺼냅니다.
    fn poll_fills(&mut self) -> Vec<FillEvent>;

    /// 주기적 유지 작업 (listenKey 연장 등).
    async fn heartbeat(&mut self) -> AdapterResult<()> {
        Ok(())
    }
}
