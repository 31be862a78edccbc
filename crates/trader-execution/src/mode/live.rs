//! 실거래 어댑터.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use trader_core::{
    ExecutionMode, FillEvent, OrderAck, OrderIntent, OrderSnapshot, PositionSnapshot,
    SharedClock, Tick,
};
use trader_exchange::{ExchangeGateway, HttpTransport, Transport, UserDataStream};

use super::{AdapterResult, ExecutionAdapter};

/// listenKey 연장 주기 (거래소 만료 60분).
const LISTEN_KEY_KEEPALIVE_MINUTES: i64 = 30;

/// 자산 조회에 사용하는 증거금 자산.
const QUOTE_ASSET: &str = "USDT";

/// 거래소 게이트웨이 기반 어댑터.
///
/// 체결은 사용자 데이터 스트림에서만 수집합니다.
pub struct LiveAdapter<T: Transport = HttpTransport> {
    gateway: ExchangeGateway<T>,
    clock: SharedClock,
    user_stream: Option<UserDataStream>,
    last_keepalive: Option<DateTime<Utc>>,
}

impl<T: Transport> LiveAdapter<T> {
    /// 게이트웨이와 시계로 어댑터 생성. 스트림은 [`connect`](Self::connect)에서 시작됩니다.
    pub fn new(gateway: ExchangeGateway<T>, clock: SharedClock) -> Self {
        Self {
            gateway,
            clock,
            user_stream: None,
            last_keepalive: None,
        }
    }

    /// 시계 동기화, 심볼별 레버리지 설정, 사용자 데이터 스트림 시작.
    pub async fn connect(&mut self, symbols: &[String], leverage: u32) -> AdapterResult<()> {
        let offset_ms = self.gateway.sync_time().await?;
        for symbol in symbols {
            self.gateway.set_leverage(symbol, leverage).await?;
        }
        self.user_stream = Some(self.gateway.start_user_data_stream().await?);
        self.last_keepalive = Some(self.clock.now());
        info!(
            symbols = symbols.len(),
            leverage,
            clock_offset_ms = offset_ms,
            "Live adapter connected"
        );
        Ok(())
    }

    /// 게이트웨이 참조.
    pub fn gateway(&self) -> &ExchangeGateway<T> {
        &self.gateway
    }

    fn drain_stream(&mut self) -> Vec<FillEvent> {
        self.user_stream
            .as_mut()
            .map(UserDataStream::drain)
            .unwrap_or_default()
    }
}

#[async_trait]
impl<T: Transport> ExecutionAdapter for LiveAdapter<T> {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Live
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn submit_order(&mut self, intent: &OrderIntent) -> AdapterResult<OrderAck> {
        self.gateway.submit_order(intent).await
    }

    async fn cancel_order(&mut self, symbol: &str, client_order_id: &str) -> AdapterResult<()> {
        self.gateway.cancel_order(symbol, client_order_id).await.map(|_| ())
    }

    async fn fetch_position(&mut self, symbol: &str) -> AdapterResult<PositionSnapshot> {
        self.gateway.fetch_position(symbol).await
    }

    async fn fetch_open_orders(&mut self, symbol: &str) -> AdapterResult<Vec<OrderSnapshot>> {
        self.gateway.fetch_open_orders(symbol).await
    }

    async fn fetch_equity(&mut self) -> AdapterResult<Decimal> {
        self.gateway.fetch_balance(QUOTE_ASSET).await
    }

    async fn on_tick(&mut self, _tick: &Tick) -> Vec<FillEvent> {
        self.drain_stream()
    }

    fn poll_fills(&mut self) -> Vec<FillEvent> {
        self.drain_stream()
    }

    async fn heartbeat(&mut self) -> AdapterResult<()> {
        if self.user_stream.is_none() {
            return Ok(());
        }
        let now = self.clock.now();
        let due = self
            .last_keepalive
            .map_or(true, |last| now - last >= Duration::minutes(LISTEN_KEY_KEEPALIVE_MINUTES));
        if !due {
            return Ok(());
        }
        match self.gateway.keepalive_listen_key().await {
            Ok(()) => {
                self.last_keepalive = Some(now);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "listenKey keepalive failed");
                Err(e)
            }
        }
    }
}
