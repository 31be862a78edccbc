//! Binance USDT-M 선물 거래소 게이트웨이.
//!
//! 모든 요청은 다음 순서를 거칩니다:
//!
//! ```text
//! 회로 차단기 허가 → 재시도 루프 { rate limit → 타임스탬프/서명 → 전송 → 응답 매핑 }
//! ```
//!
//! - 타임스탬프 거부(-1021)는 즉시 시계를 재동기화하고 정확히 한 번 재시도합니다.
//! - 중복 클라이언트 주문 ID 거부는 해당 ID로 주문을 조회해 응답을 복원합니다.
//! - 취소 요청은 회로 차단기를 거치지 않습니다.

use chrono::DateTime;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use trader_core::{
    OrderAck, OrderIntent, OrderSnapshot, OrderStatusType, OrderType, PositionSnapshot, SharedClock, Side,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::map_binance_code;
use crate::market_stream::{MarketDataConfig, UserDataStream};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::retry::{with_retry, RetryConfig};
use crate::signer::RequestSigner;
use crate::time_sync::ClockOffset;
use crate::transport::{ApiRequest, ApiResponse, HttpMethod, HttpTransport, Transport};
use crate::ExchangeError;

/// 게이트웨이 결과 타입.
pub type GatewayResult<T> = Result<T, ExchangeError>;

// ============================================================================
// 설정
// ============================================================================

/// 게이트웨이 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// REST 기본 URL
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    /// WebSocket 기본 URL
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    /// 수신 윈도우 (밀리초)
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// 요청 타임아웃 (초)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 시계 재동기화 최소 간격 (밀리초)
    #[serde(default = "default_resync_min_interval_ms")]
    pub resync_min_interval_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_ws_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}
fn default_recv_window_ms() -> u64 {
    5000
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_resync_min_interval_ms() -> u64 {
    2000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            recv_window_ms: default_recv_window_ms(),
            timeout_secs: default_timeout_secs(),
            resync_min_interval_ms: default_resync_min_interval_ms(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            market_data: MarketDataConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// 설정 검증.
    pub fn validate(&self) -> Result<(), trader_core::ConfigValidationError> {
        use trader_core::ConfigValidationError as E;
        if self.recv_window_ms == 0 || self.recv_window_ms > 60_000 {
            return Err(E::InvalidValue(format!(
                "gateway.recv_window_ms must be within 1..=60000 (got {})",
                self.recv_window_ms
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(E::InvalidValue(
                "gateway.circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(E::InvalidValue(
                "gateway.retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        self.market_data.validate()
    }
}

/// API 자격 증명.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: SecretString,
    pub api_secret: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***REDACTED***")
            .field("api_secret", &"***REDACTED***")
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            api_secret: SecretString::from(api_secret.into()),
        }
    }

    /// `BINANCE_API_KEY` / `BINANCE_API_SECRET` 환경 변수에서 로드.
    pub fn from_env() -> GatewayResult<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .map_err(|_| ExchangeError::Unauthorized(format!("{} is not set", name)))
        };
        Ok(Self::new(read("BINANCE_API_KEY")?, read("BINANCE_API_SECRET")?))
    }
}

// ============================================================================
// API 응답 타입
// ============================================================================

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    code: i32,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesOrder {
    order_id: i64,
    client_order_id: String,
    #[serde(default)]
    symbol: String,
    status: String,
    #[serde(default)]
    side: String,
    #[serde(default, rename = "type")]
    order_type: String,
    #[serde(default)]
    orig_qty: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    stop_price: String,
    #[serde(default)]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesPositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesBalance {
    asset: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKey {
    listen_key: String,
}

fn parse_decimal(raw: &str) -> GatewayResult<Decimal> {
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    raw.parse()
        .map_err(|_| ExchangeError::ParseError(format!("invalid decimal: {}", raw)))
}

fn parse_side(raw: &str) -> GatewayResult<Side> {
    match raw {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(ExchangeError::ParseError(format!("invalid side: {}", other))),
    }
}

fn parse_order_type(raw: &str) -> OrderType {
    match raw {
        "MARKET" => OrderType::Market,
        "LIMIT" => OrderType::Limit,
        _ => OrderType::StopMarket,
    }
}

fn non_zero(value: Decimal) -> Option<Decimal> {
    (!value.is_zero()).then_some(value)
}

impl FuturesOrder {
    fn into_ack(self) -> GatewayResult<OrderAck> {
        let average = parse_decimal(&self.avg_price)?;
        Ok(OrderAck {
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            status: OrderStatusType::from_exchange(&self.status),
            filled_quantity: parse_decimal(&self.executed_qty)?,
            average_price: non_zero(average),
            fee: Decimal::ZERO,
            timestamp: DateTime::from_timestamp_millis(self.update_time).unwrap_or_default(),
        })
    }

    fn into_snapshot(self) -> GatewayResult<OrderSnapshot> {
        Ok(OrderSnapshot {
            order_id: self.order_id.to_string(),
            side: parse_side(&self.side)?,
            order_type: parse_order_type(&self.order_type),
            quantity: parse_decimal(&self.orig_qty)?,
            filled_quantity: parse_decimal(&self.executed_qty)?,
            price: non_zero(parse_decimal(&self.price)?),
            stop_price: non_zero(parse_decimal(&self.stop_price)?),
            status: OrderStatusType::from_exchange(&self.status),
            client_order_id: self.client_order_id,
            symbol: self.symbol,
        })
    }
}

// ============================================================================
// 게이트웨이
// ============================================================================

/// 인증된 거래소 게이트웨이.
pub struct ExchangeGateway<T: Transport = HttpTransport> {
    transport: T,
    signer: RequestSigner,
    config: GatewayConfig,
    offset: ClockOffset,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl ExchangeGateway<HttpTransport> {
    /// reqwest 전송 계층으로 게이트웨이 생성.
    pub fn http(config: GatewayConfig, credentials: Credentials, clock: SharedClock) -> GatewayResult<Self> {
        let transport = HttpTransport::new(
            config.rest_base_url.clone(),
            credentials.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self::new(transport, credentials.api_secret, config, clock))
    }
}

impl<T: Transport> ExchangeGateway<T> {
    /// 임의 전송 계층으로 게이트웨이 생성.
    pub fn new(transport: T, api_secret: SecretString, config: GatewayConfig, clock: SharedClock) -> Self {
        let offset = ClockOffset::new(
            clock.clone(),
            chrono::Duration::milliseconds(config.resync_min_interval_ms as i64),
        );
        let limiter = RateLimiter::new(&config.rate_limit);
        let breaker = CircuitBreaker::new("exchange-gateway", config.circuit_breaker.clone(), clock);
        Self {
            transport,
            signer: RequestSigner::new(api_secret),
            config,
            offset,
            limiter,
            breaker,
        }
    }

    /// 회로 차단기.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 시계 오프셋.
    pub fn clock_offset(&self) -> &ClockOffset {
        &self.offset
    }

    /// 설정.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // 주문
    // ------------------------------------------------------------------------

    /// 주문 제출.
    pub async fn submit_order(&self, intent: &OrderIntent) -> GatewayResult<OrderAck> {
        let mut params = vec![
            ("symbol", intent.symbol.clone()),
            ("side", intent.side.as_str().to_string()),
            ("type", intent.order_type.as_str().to_string()),
            ("quantity", intent.quantity.normalize().to_string()),
            ("newClientOrderId", intent.client_order_id.to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        match intent.order_type {
            OrderType::Limit => {
                if let Some(price) = intent.price {
                    params.push(("price", price.normalize().to_string()));
                }
                params.push(("timeInForce", "GTC".to_string()));
            }
            OrderType::StopMarket => {
                if let Some(stop) = intent.stop_price {
                    params.push(("stopPrice", stop.normalize().to_string()));
                }
                params.push(("workingType", "MARK_PRICE".to_string()));
            }
            OrderType::Market => {}
        }
        if intent.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        match self.call(HttpMethod::Post, "/fapi/v1/order", &params, true).await {
            Ok(body) => {
                let ack = serde_json::from_str::<FuturesOrder>(&body)?.into_ack()?;
                info!(
                    symbol = %intent.symbol,
                    client_order_id = %intent.client_order_id,
                    order_id = %ack.order_id,
                    kind = ?intent.kind,
                    "Order submitted"
                );
                Ok(ack)
            }
            Err(ExchangeError::DuplicateClientOrderId(_)) => {
                info!(
                    client_order_id = %intent.client_order_id,
                    "Duplicate client order id, resolving by lookup"
                );
                self.fetch_order_by_client_id(&intent.symbol, intent.client_order_id.as_str())
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// 주문 취소 (회로 차단기 우회).
    pub async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> GatewayResult<OrderAck> {
        let params = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let body = self.call(HttpMethod::Delete, "/fapi/v1/order", &params, false).await?;
        let ack = serde_json::from_str::<FuturesOrder>(&body)?.into_ack()?;
        info!(symbol = %symbol, client_order_id = %client_order_id, "Order cancelled");
        Ok(ack)
    }

    /// 클라이언트 주문 ID로 주문 조회.
    pub async fn fetch_order_by_client_id(&self, symbol: &str, client_order_id: &str) -> GatewayResult<OrderAck> {
        let params = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let body = self.call(HttpMethod::Get, "/fapi/v1/order", &params, false).await?;
        serde_json::from_str::<FuturesOrder>(&body)?.into_ack()
    }

    /// 레버리지 설정.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        self.call(HttpMethod::Post, "/fapi/v1/leverage", &params, true).await?;
        info!(symbol = %symbol, leverage, "Leverage set");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // 조회
    // ------------------------------------------------------------------------

    /// 포지션 조회.
    pub async fn fetch_position(&self, symbol: &str) -> GatewayResult<PositionSnapshot> {
        let params = [("symbol", symbol.to_string())];
        let body = self.call(HttpMethod::Get, "/fapi/v2/positionRisk", &params, false).await?;
        let risks: Vec<FuturesPositionRisk> = serde_json::from_str(&body)?;

        let Some(risk) = risks.into_iter().find(|r| r.symbol == symbol) else {
            return Ok(PositionSnapshot::flat(symbol, Decimal::ZERO));
        };
        let amount = parse_decimal(&risk.position_amt)?;
        let mark = parse_decimal(&risk.mark_price)?;
        if amount.is_zero() {
            return Ok(PositionSnapshot::flat(symbol, mark));
        }
        Ok(PositionSnapshot {
            symbol: risk.symbol,
            side: Some(if amount > Decimal::ZERO { Side::Buy } else { Side::Sell }),
            quantity: amount.abs(),
            entry_price: parse_decimal(&risk.entry_price)?,
            mark_price: mark,
        })
    }

    /// 미체결 주문 조회.
    pub async fn fetch_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OrderSnapshot>> {
        let params = [("symbol", symbol.to_string())];
        let body = self.call(HttpMethod::Get, "/fapi/v1/openOrders", &params, false).await?;
        let orders: Vec<FuturesOrder> = serde_json::from_str(&body)?;
        orders.into_iter().map(FuturesOrder::into_snapshot).collect()
    }

    /// 자산 잔고 조회.
    pub async fn fetch_balance(&self, asset: &str) -> GatewayResult<Decimal> {
        let body = self.call(HttpMethod::Get, "/fapi/v2/balance", &[], false).await?;
        let balances: Vec<FuturesBalance> = serde_json::from_str(&body)?;
        balances
            .into_iter()
            .find(|b| b.asset == asset)
            .map(|b| parse_decimal(&b.balance))
            .unwrap_or(Ok(Decimal::ZERO))
    }

    // ------------------------------------------------------------------------
    // 스트림
    // ------------------------------------------------------------------------

    /// 사용자 데이터(체결) 스트림 시작.
    pub async fn start_user_data_stream(&self) -> GatewayResult<UserDataStream> {
        let listen_key = self.create_listen_key().await?;
        Ok(UserDataStream::new(
            self.config.ws_base_url.clone(),
            listen_key,
            self.config.market_data.clone(),
        ))
    }

    /// listenKey 발급.
    pub async fn create_listen_key(&self) -> GatewayResult<String> {
        let response = self.send_unsigned(HttpMethod::Post, "/fapi/v1/listenKey", true).await?;
        let body = Self::check_response(response)?;
        Ok(serde_json::from_str::<ListenKey>(&body)?.listen_key)
    }

    /// listenKey 연장.
    pub async fn keepalive_listen_key(&self) -> GatewayResult<()> {
        let response = self.send_unsigned(HttpMethod::Put, "/fapi/v1/listenKey", true).await?;
        Self::check_response(response).map(|_| ())
    }

    // ------------------------------------------------------------------------
    // 시계 동기화
    // ------------------------------------------------------------------------

    /// 서버 시각과 동기화. 새 오프셋(밀리초)을 반환합니다.
    pub async fn sync_time(&self) -> GatewayResult<i64> {
        self.offset.mark_resync_attempt();
        let sent_at = self.offset.local_now();
        let response = self.send_unsigned(HttpMethod::Get, "/fapi/v1/time", false).await?;
        let received_at = self.offset.local_now();
        let body = Self::check_response(response)?;
        let server: ServerTime = serde_json::from_str(&body)?;
        Ok(self.offset.apply_server_time(server.server_time, sent_at, received_at))
    }

    async fn resync_if_allowed(&self) {
        if !self.offset.can_resync() {
            debug!("Clock resync skipped, minimum interval not elapsed");
            return;
        }
        if let Err(e) = self.sync_time().await {
            warn!(error = %e, "Clock resync failed");
        }
    }

    // ------------------------------------------------------------------------
    // 요청 파이프라인
    // ------------------------------------------------------------------------

    /// 서명된 요청 실행 (회로 차단기 + 재시도).
    async fn call(
        &self,
        method: HttpMethod,
        path: &str,
        params: &[(&str, String)],
        gated: bool,
    ) -> GatewayResult<String> {
        if gated {
            self.breaker.try_acquire()?;
        }

        let result = with_retry(&self.config.retry, || self.send_signed(method, path, params)).await;

        if gated {
            self.breaker.record_result(&result);
        }
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!(path = %path, error = %e, class = %e.class(), "Exchange request failed");
            }
        }
        result
    }

    /// 타임스탬프 거부 시 재동기화 후 정확히 한 번 재시도.
    async fn send_signed(&self, method: HttpMethod, path: &str, params: &[(&str, String)]) -> GatewayResult<String> {
        match self.send_signed_once(method, path, params).await {
            Err(ExchangeError::TimestampError(msg)) => {
                warn!(
                    path = %path,
                    offset_ms = self.offset.offset_ms(),
                    message = %msg,
                    "Timestamp rejected, resyncing clock"
                );
                self.resync_if_allowed().await;
                self.send_signed_once(method, path, params).await
            }
            other => other,
        }
    }

    async fn send_signed_once(&self, method: HttpMethod, path: &str, params: &[(&str, String)]) -> GatewayResult<String> {
        let mut all_params = params.to_vec();
        all_params.push(("recvWindow", self.config.recv_window_ms.to_string()));
        all_params.push(("timestamp", self.offset.server_timestamp_ms().to_string()));

        let request = ApiRequest {
            method,
            path: path.to_string(),
            query: self.signer.signed_query(&all_params)?,
            with_api_key: true,
        };

        self.limiter.acquire().await;
        let response = self.transport.send(&request).await?;
        Self::check_response(response)
    }

    async fn send_unsigned(&self, method: HttpMethod, path: &str, with_api_key: bool) -> GatewayResult<ApiResponse> {
        let request = ApiRequest {
            method,
            path: path.to_string(),
            query: String::new(),
            with_api_key,
        };
        self.limiter.acquire().await;
        self.transport.send(&request).await
    }

    /// 응답 상태/에러 코드를 거래소 에러로 매핑.
    fn check_response(response: ApiResponse) -> GatewayResult<String> {
        if (200..300).contains(&response.status) {
            return Ok(response.body);
        }
        if response.status == 429 || response.status == 418 {
            return Err(ExchangeError::RateLimited(format!("HTTP {}", response.status)));
        }
        if let Ok(error) = serde_json::from_str::<BinanceErrorBody>(&response.body) {
            return Err(map_binance_code(error.code, &error.msg));
        }
        if response.status >= 500 {
            return Err(ExchangeError::ServerError {
                status: response.status,
                message: response.body,
            });
        }
        Err(ExchangeError::ApiError {
            code: response.status as i32,
            message: response.body,
        })
    }
}
