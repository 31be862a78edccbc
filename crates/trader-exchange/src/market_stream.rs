//! Binance 선물 WebSocket 스트림.
//!
//! - [`MarketDataStream`]: kline 종가 틱과 EMA 평활 호가 불균형(OBI)
//! - [`UserDataStream`]: listenKey 기반 체결(`ORDER_TRADE_UPDATE`) 이벤트
//!
//! 두 스트림 모두 백그라운드 태스크에서 연결을 유지하며, 연결이 끊기면
//! 지수 백오프로 재연결해 같은 스트림을 다시 구독합니다. 소비자는 채널에서
//! 이벤트를 받기만 하므로 스트림은 끝나지 않습니다.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use trader_core::{FillEvent, MarketUpdate, Side, Tick};

// ============================================================================
// 설정
// ============================================================================

/// 시장 데이터 스트림 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// kline 간격
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
    /// 호가 깊이 (5, 10, 20)
    #[serde(default = "default_depth_level")]
    pub depth_level: usize,
    /// 호가 업데이트 주기 (100, 250, 500ms)
    #[serde(default = "default_depth_interval_ms")]
    pub depth_interval_ms: u64,
    /// OBI EMA 계수
    #[serde(default = "default_obi_alpha")]
    pub obi_alpha: f64,
    /// 재연결 기본 대기 (밀리초)
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// 재연결 최대 대기 (밀리초)
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// 이벤트 채널 용량
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_kline_interval() -> String {
    "1m".to_string()
}
fn default_depth_level() -> usize {
    5
}
fn default_depth_interval_ms() -> u64 {
    500
}
fn default_obi_alpha() -> f64 {
    0.6
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_channel_capacity() -> usize {
    1024
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            kline_interval: default_kline_interval(),
            depth_level: default_depth_level(),
            depth_interval_ms: default_depth_interval_ms(),
            obi_alpha: default_obi_alpha(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl MarketDataConfig {
    /// 설정 검증.
    pub fn validate(&self) -> Result<(), trader_core::ConfigValidationError> {
        use trader_core::ConfigValidationError as E;
        if ![5, 10, 20].contains(&self.depth_level) {
            return Err(E::InvalidValue(format!(
                "market_data.depth_level must be 5, 10 or 20 (got {})",
                self.depth_level
            )));
        }
        if !(self.obi_alpha > 0.0 && self.obi_alpha <= 1.0) {
            return Err(E::InvalidValue(format!(
                "market_data.obi_alpha must be within (0, 1] (got {})",
                self.obi_alpha
            )));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(E::InvalidValue(
                "market_data.reconnect_max_ms must be >= reconnect_base_ms > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 심볼 목록에 대한 결합 스트림 URL.
    pub fn combined_stream_url(&self, ws_base_url: &str, symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                [
                    format!("{}@kline_{}", lower, self.kline_interval),
                    format!("{}@depth{}@{}ms", lower, self.depth_level, self.depth_interval_ms),
                ]
            })
            .collect();
        format!(
            "{}/stream?streams={}",
            ws_base_url.trim_end_matches('/'),
            streams.join("/")
        )
    }
}

// ============================================================================
// 재연결 백오프
// ============================================================================

/// 지수 재연결 백오프.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    /// 다음 대기 시간을 반환하고 시도 횟수를 올립니다.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u64.saturating_pow(self.attempt.min(20));
        let delay = self.base_ms.saturating_mul(factor).min(self.max_ms);
        self.attempt += 1;
        Duration::from_millis(delay)
    }

    /// 연결 성공 후 초기화.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ============================================================================
// 메시지 파싱
// ============================================================================

#[derive(Debug, Deserialize)]
struct CombinedMessage {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "c")]
    close: String,
}

#[derive(Debug, Deserialize)]
struct WsDepthEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

/// 결합 스트림 메시지 파서. 심볼별 OBI EMA 상태를 가집니다.
#[derive(Debug)]
pub struct MarketMessageParser {
    depth_level: usize,
    alpha: f64,
    obi: HashMap<String, f64>,
}

impl MarketMessageParser {
    pub fn new(config: &MarketDataConfig) -> Self {
        Self {
            depth_level: config.depth_level,
            alpha: config.obi_alpha,
            obi: HashMap::new(),
        }
    }

    /// 결합 스트림 메시지를 시장 업데이트로 변환합니다.
    ///
    /// 알 수 없는 스트림이나 잘못된 메시지는 `None`.
    pub fn parse(&mut self, text: &str) -> Option<MarketUpdate> {
        let message: CombinedMessage = serde_json::from_str(text).ok()?;

        if message.stream.contains("@kline_") {
            let event: WsKlineEvent = serde_json::from_value(message.data).ok()?;
            let price: Decimal = event.kline.close.parse().ok()?;
            return Some(MarketUpdate::Tick(Tick::new(
                event.symbol,
                price,
                to_datetime(event.event_time),
            )));
        }

        if message.stream.contains("@depth") {
            let event: WsDepthEvent = serde_json::from_value(message.data).ok()?;
            let raw = self.raw_imbalance(&event.bids, &event.asks)?;
            let smoothed = match self.obi.get(&event.symbol) {
                Some(prev) => self.alpha * raw + (1.0 - self.alpha) * prev,
                None => raw,
            };
            self.obi.insert(event.symbol.clone(), smoothed);
            return Some(MarketUpdate::Imbalance {
                symbol: event.symbol,
                obi: smoothed,
                timestamp: to_datetime(event.event_time),
            });
        }

        None
    }

    /// 상위 호가의 (매수 - 매도) / (매수 + 매도) 잔량.
    fn raw_imbalance(&self, bids: &[[String; 2]], asks: &[[String; 2]]) -> Option<f64> {
        let sum = |levels: &[[String; 2]]| -> Option<f64> {
            levels
                .iter()
                .take(self.depth_level)
                .map(|[_, qty]| qty.parse::<f64>().ok())
                .sum()
        };
        let bid = sum(bids)?;
        let ask = sum(asks)?;
        let total = bid + ask;
        if total <= 0.0 {
            return Some(0.0);
        }
        Some((bid - ask) / total)
    }
}

#[derive(Debug, Deserialize)]
struct WsUserEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "o")]
    order: Option<WsOrderUpdate>,
}

#[derive(Debug, Deserialize)]
struct WsOrderUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    client_order_id: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "x")]
    execution_type: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "l")]
    last_filled_qty: String,
    #[serde(rename = "L")]
    last_filled_price: String,
    #[serde(rename = "n", default)]
    commission: Option<String>,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m", default)]
    is_maker: bool,
}

/// 사용자 데이터 메시지에서 체결 이벤트를 추출합니다.
///
/// `ORDER_TRADE_UPDATE` 중 실행 유형이 `TRADE`인 경우만 체결입니다.
pub fn parse_user_fill(text: &str) -> Option<FillEvent> {
    let event: WsUserEvent = serde_json::from_str(text).ok()?;
    if event.event_type != "ORDER_TRADE_UPDATE" {
        return None;
    }
    let order = event.order?;
    if order.execution_type != "TRADE" {
        return None;
    }
    let side = match order.side.as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return None,
    };
    let fee = match order.commission.as_deref() {
        Some(raw) => raw.parse().ok()?,
        None => Decimal::ZERO,
    };
    Some(FillEvent {
        symbol: order.symbol,
        order_id: order.order_id.to_string(),
        client_order_id: order.client_order_id,
        side,
        quantity: order.last_filled_qty.parse().ok()?,
        price: order.last_filled_price.parse().ok()?,
        fee,
        is_maker: order.is_maker,
        timestamp: to_datetime(order.trade_time),
    })
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ============================================================================
// 연결 루프
// ============================================================================

/// 연결 → 수신 → 끊김 → 백오프 → 재연결을 반복합니다.
///
/// 수신자가 모두 사라지면 종료합니다.
async fn run_connection_loop<T, P>(
    name: &'static str,
    url: String,
    config: MarketDataConfig,
    tx: mpsc::Sender<T>,
    mut parse: P,
) where
    P: FnMut(&str) -> Option<T>,
{
    let mut backoff = ReconnectBackoff::new(config.reconnect_base_ms, config.reconnect_max_ms);

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(stream = name, "WebSocket connected");
                backoff.reset();
                let (_write, mut read) = ws.split();

                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if let Some(event) = parse(text.as_str()) {
                                if tx.send(event).await.is_err() {
                                    debug!(stream = name, "Receiver dropped, stopping stream");
                                    return;
                                }
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!(stream = name, "WebSocket closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(stream = name, error = %e, "WebSocket error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(stream = name, error = %e, "WebSocket connect failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        let delay = backoff.next_delay();
        info!(stream = name, delay_ms = delay.as_millis() as u64, "Reconnecting WebSocket");
        tokio::time::sleep(delay).await;
    }
}

/// 시장 데이터 스트림.
pub struct MarketDataStream {
    rx: mpsc::Receiver<MarketUpdate>,
    task: JoinHandle<()>,
}

impl MarketDataStream {
    /// 스트림 생성 및 백그라운드 연결 시작. tokio 런타임 안에서 호출해야 합니다.
    pub fn new(ws_base_url: String, symbols: Vec<String>, config: MarketDataConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let url = config.combined_stream_url(&ws_base_url, &symbols);
        let mut parser = MarketMessageParser::new(&config);
        let task = tokio::spawn(run_connection_loop("market", url, config, tx, move |text| {
            parser.parse(text)
        }));
        Self { rx, task }
    }

    /// 다음 업데이트. 연결이 끊겨도 재연결 후 계속 전달합니다.
    pub async fn next(&mut self) -> Option<MarketUpdate> {
        self.rx.recv().await
    }
}

impl Drop for MarketDataStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 사용자 데이터(체결) 스트림.
pub struct UserDataStream {
    rx: mpsc::Receiver<FillEvent>,
    task: JoinHandle<()>,
}

impl UserDataStream {
    /// listenKey로 스트림 시작. tokio 런타임 안에서 호출해야 합니다.
    pub fn new(ws_base_url: String, listen_key: String, config: MarketDataConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let url = format!("{}/ws/{}", ws_base_url.trim_end_matches('/'), listen_key);
        let task = tokio::spawn(run_connection_loop("user", url, config, tx, parse_user_fill));
        Self { rx, task }
    }

    /// 다음 체결 이벤트.
    pub async fn next(&mut self) -> Option<FillEvent> {
        self.rx.recv().await
    }

    /// 대기 중인 체결을 모두 꺼냅니다 (거래소 보고 순서 유지).
    pub fn drain(&mut self) -> Vec<FillEvent> {
        let mut fills = Vec::new();
        while let Ok(fill) = self.rx.try_recv() {
            fills.push(fill);
        }
        fills
    }
}

impl Drop for UserDataStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn depth_message(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
        let levels = |l: &[(&str, &str)]| {
            l.iter()
                .map(|(p, q)| format!(r#"["{}","{}"]"#, p, q))
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            r#"{{"stream":"btcusdt@depth5@500ms","data":{{"e":"depthUpdate","E":1704067200000,"s":"BTCUSDT","b":[{}],"a":[{}]}}}}"#,
            levels(bids),
            levels(asks)
        )
    }

    #[test]
    fn test_combined_stream_url() {
        let config = MarketDataConfig::default();
        let url = config.combined_stream_url("wss://fstream.binance.com", &["BTCUSDT".to_string()]);
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@kline_1m/btcusdt@depth5@500ms"
        );
    }

    #[test]
    fn test_parse_kline_as_tick() {
        let mut parser = MarketMessageParser::new(&MarketDataConfig::default());
        let text = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1704067200000,"s":"BTCUSDT","k":{"t":1704067140000,"c":"42150.5","x":false}}}"#;

        match parser.parse(text) {
            Some(MarketUpdate::Tick(tick)) => {
                assert_eq!(tick.symbol, "BTCUSDT");
                assert_eq!(tick.price, dec!(42150.5));
                assert_eq!(tick.timestamp.timestamp_millis(), 1704067200000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_obi_is_ema_smoothed() {
        let mut parser = MarketMessageParser::new(&MarketDataConfig::default());

        // 첫 값은 원시 불균형 그대로: (3 - 1) / 4 = 0.5
        let first = parser.parse(&depth_message(&[("100", "3")], &[("101", "1")]));
        let Some(MarketUpdate::Imbalance { obi, .. }) = first else {
            panic!("expected imbalance");
        };
        assert!((obi - 0.5).abs() < 1e-9);

        // 두 번째: 원시 -0.5 → 0.6 * -0.5 + 0.4 * 0.5 = -0.1
        let second = parser.parse(&depth_message(&[("100", "1")], &[("101", "3")]));
        let Some(MarketUpdate::Imbalance { obi, .. }) = second else {
            panic!("expected imbalance");
        };
        assert!((obi + 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_obi_uses_configured_depth_only() {
        let config = MarketDataConfig {
            depth_level: 5,
            ..Default::default()
        };
        let mut parser = MarketMessageParser::new(&config);
        let bids: Vec<(&str, &str)> = vec![("100", "1"); 6];
        let asks: Vec<(&str, &str)> = vec![("101", "1"); 5];

        let Some(MarketUpdate::Imbalance { obi, .. }) = parser.parse(&depth_message(&bids, &asks)) else {
            panic!("expected imbalance");
        };
        assert_eq!(obi, 0.0);
    }

    #[test]
    fn test_unknown_stream_ignored() {
        let mut parser = MarketMessageParser::new(&MarketDataConfig::default());
        assert!(parser.parse(r#"{"stream":"btcusdt@aggTrade","data":{}}"#).is_none());
        assert!(parser.parse("not json").is_none());
    }

    #[test]
    fn test_parse_user_fill_only_trades() {
        let trade = r#"{"e":"ORDER_TRADE_UPDATE","E":1704067200100,"T":1704067200099,"o":{"s":"BTCUSDT","c":"le-1-TP0-3","S":"SELL","o":"LIMIT","x":"TRADE","X":"PARTIALLY_FILLED","i":8886774,"l":"0.004","L":"42500.0","n":"0.0034","N":"USDT","T":1704067200099,"m":true}}"#;
        let fill = parse_user_fill(trade).unwrap();
        assert_eq!(fill.client_order_id, "le-1-TP0-3");
        assert_eq!(fill.side, Side::Sell);
        assert_eq!(fill.quantity, dec!(0.004));
        assert_eq!(fill.price, dec!(42500.0));
        assert_eq!(fill.fee, dec!(0.0034));
        assert!(fill.is_maker);

        let new_order = trade.replace(r#""x":"TRADE""#, r#""x":"NEW""#);
        assert!(parse_user_fill(&new_order).is_none());
        assert!(parse_user_fill(r#"{"e":"ACCOUNT_UPDATE","E":1}"#).is_none());
    }

    #[test]
    fn test_reconnect_backoff_doubles_and_caps() {
        let mut backoff = ReconnectBackoff::new(1000, 5000);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5000));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_config_validation() {
        assert!(MarketDataConfig::default().validate().is_ok());
        let bad = MarketDataConfig {
            obi_alpha: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
