//! 시뮬레이션 거래소를 위한 주문 매칭 엔진.
//!
//! 틱 단위로 대기 주문(지정가 익절, 스탑 시장가 손절/트레일링)을 트리거합니다.
//! 대기 주문은 심볼별로 제출 순서를 유지하므로 같은 틱 시퀀스는 항상 같은
//! 체결 순서를 만듭니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use trader_core::{OrderType, Price, Quantity, Side};

/// 매칭 엔진의 대기 주문.
#[derive(Debug, Clone, PartialEq)]
pub struct RestingOrder {
    /// 거래소 주문 ID
    pub order_id: String,
    /// 클라이언트 주문 ID
    pub client_order_id: String,
    /// 심볼
    pub symbol: String,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 원래 수량
    pub quantity: Quantity,
    /// 지정가
    pub price: Option<Price>,
    /// 스탑 가격
    pub stop_price: Option<Price>,
    /// 축소 전용
    pub reduce_only: bool,
    /// 생성 시각
    pub created_at: DateTime<Utc>,
}

/// 주문 매칭 결과.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderMatch {
    /// 체결된 주문
    pub order: RestingOrder,
    /// 체결 가격
    pub fill_price: Price,
    /// 메이커 체결 여부
    pub is_maker: bool,
    /// 체결 시각
    pub timestamp: DateTime<Utc>,
}

/// 시뮬레이션 거래소를 위한 주문 매칭 엔진.
#[derive(Debug)]
pub struct MatchingEngine {
    /// 심볼별 대기 주문 (제출 순서)
    resting: BTreeMap<String, Vec<RestingOrder>>,
    /// 슬리피지율 (예: 2bps의 경우 0.0002)
    slippage_rate: Decimal,
    /// 주문 ID 카운터
    next_order_id: u64,
}

impl MatchingEngine {
    /// 새로운 매칭 엔진을 생성합니다.
    pub fn new(slippage_rate: Decimal) -> Self {
        Self {
            resting: BTreeMap::new(),
            slippage_rate,
            next_order_id: 1,
        }
    }

    /// 다음 주문 ID를 생성합니다.
    pub fn generate_order_id(&mut self) -> String {
        let id = self.next_order_id;
        self.next_order_id += 1;
        format!("SIM-{:010}", id)
    }

    /// 테이커 체결 가격 (불리한 방향으로 슬리피지 적용).
    pub fn taker_price(&self, side: Side, reference: Price) -> Price {
        let slippage = reference * self.slippage_rate;
        match side {
            Side::Buy => reference + slippage,
            Side::Sell => reference - slippage,
        }
    }

    /// 대기 주문 등록.
    pub fn rest(&mut self, order: RestingOrder) {
        self.resting
            .entry(order.symbol.clone())
            .or_default()
            .push(order);
    }

    /// 새 틱으로 대기 주문을 트리거합니다.
    ///
    /// 트리거된 주문은 대기열에서 제거되어 반환됩니다.
    pub fn on_tick(&mut self, symbol: &str, price: Price, timestamp: DateTime<Utc>) -> Vec<OrderMatch> {
        let Some(orders) = self.resting.get_mut(symbol) else {
            return Vec::new();
        };

        let slippage_rate = self.slippage_rate;
        let mut matches = Vec::new();
        let mut remaining = Vec::with_capacity(orders.len());

        for order in orders.drain(..) {
            match Self::trigger_price(&order, price, slippage_rate) {
                Some((fill_price, is_maker)) => matches.push(OrderMatch {
                    order,
                    fill_price,
                    is_maker,
                    timestamp,
                }),
                None => remaining.push(order),
            }
        }
        *orders = remaining;
        matches
    }

    /// 주문이 이 가격에서 트리거되는지 판단하고 체결 가격을 계산합니다.
    fn trigger_price(order: &RestingOrder, price: Price, slippage_rate: Decimal) -> Option<(Price, bool)> {
        match order.order_type {
            OrderType::Limit => {
                let limit = order.price?;
                let should_fill = match order.side {
                    Side::Buy => price <= limit,
                    Side::Sell => price >= limit,
                };
                should_fill.then_some((limit, true))
            }
            OrderType::StopMarket => {
                let stop = order.stop_price?;
                // 매도 스탑은 하락 돌파, 매수 스탑은 상승 돌파 시 트리거
                let should_trigger = match order.side {
                    Side::Sell => price <= stop,
                    Side::Buy => price >= stop,
                };
                if !should_trigger {
                    return None;
                }
                let slippage = price * slippage_rate;
                let fill = match order.side {
                    Side::Sell => price - slippage,
                    Side::Buy => price + slippage,
                };
                Some((fill, false))
            }
            OrderType::Market => None,
        }
    }

    /// 대기 주문을 클라이언트 주문 ID로 취소합니다.
    pub fn cancel(&mut self, symbol: &str, client_order_id: &str) -> Option<RestingOrder> {
        let orders = self.resting.get_mut(symbol)?;
        let pos = orders
            .iter()
            .position(|o| o.client_order_id == client_order_id)?;
        Some(orders.remove(pos))
    }

    /// 심볼의 대기 주문.
    pub fn resting_orders(&self, symbol: &str) -> &[RestingOrder] {
        self.resting
            .get(symbol)
            .map(|orders| orders.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn resting(side: Side, order_type: OrderType, price: Option<Price>, stop: Option<Price>) -> RestingOrder {
        RestingOrder {
            order_id: "SIM-1".into(),
            client_order_id: "le-1-TP0-1".into(),
            symbol: "BTCUSDT".into(),
            side,
            order_type,
            quantity: dec!(1),
            price,
            stop_price: stop,
            reduce_only: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_limit_sell_fills_at_limit_as_maker() {
        let mut engine = MatchingEngine::new(dec!(0.0002));
        engine.rest(resting(Side::Sell, OrderType::Limit, Some(dec!(105)), None));

        assert!(engine.on_tick("BTCUSDT", dec!(104), Utc::now()).is_empty());
        let matches = engine.on_tick("BTCUSDT", dec!(106), Utc::now());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].fill_price, dec!(105));
        assert!(matches[0].is_maker);
        assert!(engine.resting_orders("BTCUSDT").is_empty());
    }

    #[test]
    fn test_sell_stop_triggers_with_slippage() {
        let mut engine = MatchingEngine::new(dec!(0.001));
        engine.rest(resting(Side::Sell, OrderType::StopMarket, None, Some(dec!(99))));

        assert!(engine.on_tick("BTCUSDT", dec!(99.5), Utc::now()).is_empty());
        let matches = engine.on_tick("BTCUSDT", dec!(98), Utc::now());
        assert_eq!(matches[0].fill_price, dec!(97.902));
        assert!(!matches[0].is_maker);
    }

    #[test]
    fn test_cancel_by_client_order_id() {
        let mut engine = MatchingEngine::new(Decimal::ZERO);
        engine.rest(resting(Side::Sell, OrderType::Limit, Some(dec!(105)), None));

        assert!(engine.cancel("BTCUSDT", "le-1-TP0-1").is_some());
        assert!(engine.cancel("BTCUSDT", "le-1-TP0-1").is_none());
    }

    #[test]
    fn test_order_ids_are_sequential() {
        let mut engine = MatchingEngine::new(Decimal::ZERO);
        assert_eq!(engine.generate_order_id(), "SIM-0000000001");
        assert_eq!(engine.generate_order_id(), "SIM-0000000002");
    }
}
