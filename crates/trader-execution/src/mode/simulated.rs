//! 시뮬레이션 거래소 기반 어댑터 (모의투자 / 백테스트).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use trader_core::{
    Clock, ExecutionMode, FillEvent, ManualClock, OrderAck, OrderIntent, OrderSnapshot,
    PositionSnapshot, SharedClock, SystemClock, Tick,
};
use trader_exchange::{SimulatedConfig, SimulatedExchange};

use super::{AdapterResult, ExecutionAdapter};

/// 시뮬레이션 거래소 어댑터.
///
/// 백테스트에서는 틱 타임스탬프로만 전진하는 수동 시계를, 모의투자에서는
/// 주입된 시계(기본 시스템 시계)를 사용합니다.
pub struct SimulatedAdapter {
    exchange: SimulatedExchange,
    mode: ExecutionMode,
    clock: SharedClock,
    replay_clock: Option<ManualClock>,
}

impl SimulatedAdapter {
    /// 백테스트 어댑터. 시계는 `start`에서 시작해 틱으로만 전진합니다.
    pub fn backtest(config: SimulatedConfig, start: DateTime<Utc>) -> Self {
        let replay_clock = ManualClock::new(start);
        Self {
            exchange: SimulatedExchange::new(config, start),
            mode: ExecutionMode::Backtest,
            clock: Arc::new(replay_clock.clone()),
            replay_clock: Some(replay_clock),
        }
    }

    /// 시스템 시계를 사용하는 모의투자 어댑터.
    pub fn paper(config: SimulatedConfig) -> Self {
        Self::paper_with_clock(config, Arc::new(SystemClock))
    }

    /// 주어진 시계를 사용하는 모의투자 어댑터.
    pub fn paper_with_clock(config: SimulatedConfig, clock: SharedClock) -> Self {
        Self {
            exchange: SimulatedExchange::new(config, clock.now()),
            mode: ExecutionMode::Paper,
            clock,
            replay_clock: None,
        }
    }

    /// 시뮬레이션 거래소 참조.
    pub fn exchange(&self) -> &SimulatedExchange {
        &self.exchange
    }

    /// 시뮬레이션 거래소 가변 참조 (외부 개입 재현용).
    pub fn exchange_mut(&mut self) -> &mut SimulatedExchange {
        &mut self.exchange
    }

    fn sync_time(&mut self) {
        let now = self.clock.now();
        self.exchange.set_time(now);
    }
}

#[async_trait]
impl ExecutionAdapter for SimulatedAdapter {
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn submit_order(&mut self, intent: &OrderIntent) -> AdapterResult<OrderAck> {
        self.sync_time();
        self.exchange.submit_order(intent)
    }

    async fn cancel_order(&mut self, symbol: &str, client_order_id: &str) -> AdapterResult<()> {
        self.sync_time();
        self.exchange.cancel_order(symbol, client_order_id)
    }

    async fn fetch_position(&mut self, symbol: &str) -> AdapterResult<PositionSnapshot> {
        Ok(self.exchange.fetch_position(symbol))
    }

    async fn fetch_open_orders(&mut self, symbol: &str) -> AdapterResult<Vec<OrderSnapshot>> {
        Ok(self.exchange.fetch_open_orders(symbol))
    }

    async fn fetch_equity(&mut self) -> AdapterResult<Decimal> {
        Ok(self.exchange.wallet_balance())
    }

    fn advance_clock(&mut self, at: DateTime<Utc>) {
        if let Some(clock) = &self.replay_clock {
            clock.set(at);
        }
    }

    async fn on_tick(&mut self, tick: &Tick) -> Vec<FillEvent> {
        self.advance_clock(tick.timestamp);
        self.exchange.on_tick(tick)
    }

    fn poll_fills(&mut self) -> Vec<FillEvent> {
        self.exchange.drain_fills()
    }
}
