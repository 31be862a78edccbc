//! 시장 데이터, 거래소 스냅샷, 체결 이벤트.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{OrderStatusType, OrderType, Side, Signal};
use crate::types::{Price, Quantity};

/// 가격 틱.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// 심볼
    pub symbol: String,
    /// 가격
    pub price: Price,
    /// 시각
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: Price, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }
}

/// 시장 데이터 스트림 업데이트.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketUpdate {
    /// 가격 틱
    Tick(Tick),
    /// EMA 평활 호가 불균형 (-1 ~ 1)
    Imbalance {
        symbol: String,
        obi: f64,
        timestamp: DateTime<Utc>,
    },
}

impl MarketUpdate {
    /// 업데이트의 심볼.
    pub fn symbol(&self) -> &str {
        match self {
            MarketUpdate::Tick(tick) => &tick.symbol,
            MarketUpdate::Imbalance { symbol, .. } => symbol,
        }
    }
}

/// 백테스트 재생 이벤트 (JSON lines 한 줄).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    Tick(Tick),
    Signal(Signal),
}

impl ReplayEvent {
    /// 이벤트 시각.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ReplayEvent::Tick(tick) => tick.timestamp,
            ReplayEvent::Signal(signal) => signal.timestamp,
        }
    }
}

/// 거래소가 보고한 포지션.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// 심볼
    pub symbol: String,
    /// 방향 (포지션 없으면 None)
    pub side: Option<Side>,
    /// 수량 (절대값)
    pub quantity: Quantity,
    /// 진입 가격
    pub entry_price: Price,
    /// 마크 가격
    pub mark_price: Price,
}

impl PositionSnapshot {
    /// 포지션 없음.
    pub fn flat(symbol: impl Into<String>, mark_price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            side: None,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price,
        }
    }

    /// 포지션이 없는지 확인.
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// 거래소가 보고한 미체결 주문.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub filled_quantity: Quantity,
    pub price: Option<Price>,
    pub stop_price: Option<Price>,
    pub status: OrderStatusType,
}

/// 확정된 체결 이벤트. 거래소가 보고한 순서대로 적용됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// 심볼
    pub symbol: String,
    /// 거래소 주문 ID
    pub order_id: String,
    /// 클라이언트 주문 ID
    pub client_order_id: String,
    /// 방향
    pub side: Side,
    /// 체결 수량
    pub quantity: Quantity,
    /// 체결 가격
    pub price: Price,
    /// 수수료
    pub fee: Decimal,
    /// 메이커 체결 여부
    pub is_maker: bool,
    /// 체결 시각
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use rust_decimal_macros::dec;

    #[test]
    fn test_replay_event_json_line() {
        let line = r#"{"type":"tick","symbol":"BTCUSDT","price":"50000.5","timestamp":"2024-01-01T00:00:00Z"}"#;
        let event: ReplayEvent = serde_json::from_str(line).unwrap();
        match event {
            ReplayEvent::Tick(tick) => assert_eq!(tick.price, dec!(50000.5)),
            other => panic!("unexpected event: {:?}", other),
        }

        let line = r#"{"type":"signal","symbol":"BTCUSDT","direction":"long","confidence":0.9,"adx":30.0,"timestamp":"2024-01-01T00:00:01Z"}"#;
        let event: ReplayEvent = serde_json::from_str(line).unwrap();
        match event {
            ReplayEvent::Signal(signal) => {
                assert_eq!(signal.direction, Direction::Long);
                assert_eq!(signal.price, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
