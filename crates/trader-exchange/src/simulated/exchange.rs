//! 모의투자/백테스트용 시뮬레이션 거래소.
//!
//! 실제 거래소와 같은 응답 형태(주문 응답, 포지션/미체결 스냅샷, 체결 이벤트)를
//! 동기 방식으로 제공합니다. 시각은 호출자가 틱 타임스탬프로 전진시킵니다.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use trader_core::{
    FillEvent, OrderAck, OrderIntent, OrderSnapshot, OrderStatusType, OrderType,
    PositionSnapshot, Price, Quantity, Side, Tick,
};

use super::matching_engine::{MatchingEngine, OrderMatch, RestingOrder};
use crate::ExchangeError;

/// 시뮬레이션 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// 초기 자산 (USDT)
    #[serde(default = "default_initial_equity")]
    pub initial_equity: Decimal,
    /// 테이커 수수료율
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
    /// 메이커 수수료율
    #[serde(default = "default_maker_fee")]
    pub maker_fee: Decimal,
    /// 슬리피지 (bps)
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: Decimal,
}

fn default_initial_equity() -> Decimal {
    dec!(1000)
}
fn default_taker_fee() -> Decimal {
    dec!(0.0004)
}
fn default_maker_fee() -> Decimal {
    dec!(0.0002)
}
fn default_slippage_bps() -> Decimal {
    dec!(2)
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            initial_equity: default_initial_equity(),
            taker_fee: default_taker_fee(),
            maker_fee: default_maker_fee(),
            slippage_bps: default_slippage_bps(),
        }
    }
}

impl SimulatedConfig {
    /// 초기 자산 설정.
    pub fn with_initial_equity(mut self, equity: Decimal) -> Self {
        self.initial_equity = equity;
        self
    }

    /// 수수료/슬리피지 없는 설정 (테스트용).
    pub fn frictionless(mut self) -> Self {
        self.taker_fee = Decimal::ZERO;
        self.maker_fee = Decimal::ZERO;
        self.slippage_bps = Decimal::ZERO;
        self
    }

    /// 슬리피지율 (2bps → 0.0002).
    pub fn slippage_rate(&self) -> Decimal {
        self.slippage_bps / dec!(10000)
    }
}

/// 부호 있는 시뮬레이션 포지션 (양수 = 롱).
#[derive(Debug, Clone, Default)]
struct SimPosition {
    quantity: Decimal,
    entry_price: Price,
}

/// 시뮬레이션 거래소.
#[derive(Debug)]
pub struct SimulatedExchange {
    config: SimulatedConfig,
    engine: MatchingEngine,
    positions: BTreeMap<String, SimPosition>,
    last_prices: BTreeMap<String, Price>,
    orders: HashMap<String, OrderAck>,
    fills: Vec<FillEvent>,
    /// false면 체결은 반영하되 체결 이벤트는 보고하지 않음
    report_fills: bool,
    wallet: Decimal,
    now: DateTime<Utc>,
}

impl SimulatedExchange {
    /// 새 시뮬레이션 거래소.
    pub fn new(config: SimulatedConfig, start: DateTime<Utc>) -> Self {
        Self {
            engine: MatchingEngine::new(config.slippage_rate()),
            wallet: config.initial_equity,
            config,
            positions: BTreeMap::new(),
            last_prices: BTreeMap::new(),
            orders: HashMap::new(),
            fills: Vec::new(),
            report_fills: true,
            now: start,
        }
    }

    /// 거래소 시각 설정.
    pub fn set_time(&mut self, now: DateTime<Utc>) {
        if now > self.now {
            self.now = now;
        }
    }

    /// 심볼의 마지막 가격.
    pub fn last_price(&self, symbol: &str) -> Option<Price> {
        self.last_prices.get(symbol).copied()
    }

    /// 지갑 잔고 (실현 손익/수수료 반영).
    pub fn wallet_balance(&self) -> Decimal {
        self.wallet
    }

    /// 자산 (지갑 + 미실현 손익).
    pub fn equity(&self) -> Decimal {
        let unrealized: Decimal = self
            .positions
            .iter()
            .map(|(symbol, pos)| {
                let mark = self.last_price(symbol).unwrap_or(pos.entry_price);
                (mark - pos.entry_price) * pos.quantity
            })
            .sum();
        self.wallet + unrealized
    }

    /// 주문 제출.
    pub fn submit_order(&mut self, intent: &OrderIntent) -> Result<OrderAck, ExchangeError> {
        let client_order_id = intent.client_order_id.as_str().to_string();
        if self.orders.contains_key(&client_order_id) {
            return Err(ExchangeError::DuplicateClientOrderId(client_order_id));
        }
        if intent.quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidQuantity(intent.quantity.to_string()));
        }

        let order_id = self.engine.generate_order_id();
        let order = RestingOrder {
            order_id: order_id.clone(),
            client_order_id: client_order_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            quantity: intent.quantity,
            price: intent.price,
            stop_price: intent.stop_price,
            reduce_only: intent.reduce_only,
            created_at: self.now,
        };

        let ack = match intent.order_type {
            OrderType::Market => {
                let reference = self.last_price(&intent.symbol).ok_or_else(|| {
                    ExchangeError::OrderRejected(format!("no market price for {}", intent.symbol))
                })?;
                if intent.reduce_only && self.closable_quantity(&intent.symbol, intent.side).is_zero() {
                    return Err(ExchangeError::OrderRejected(
                        "reduce-only order would not reduce position".to_string(),
                    ));
                }
                let fill_price = self.engine.taker_price(intent.side, reference);
                let matched = OrderMatch {
                    order,
                    fill_price,
                    is_maker: false,
                    timestamp: self.now,
                };
                self.orders.insert(
                    client_order_id.clone(),
                    Self::ack_for(&matched.order, OrderStatusType::New, self.now),
                );
                self.settle(matched);
                self.orders
                    .get(&client_order_id)
                    .cloned()
                    .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.clone()))?
            }
            OrderType::Limit | OrderType::StopMarket => {
                let ack = Self::ack_for(&order, OrderStatusType::New, self.now);
                self.orders.insert(client_order_id, ack.clone());
                self.engine.rest(order);
                ack
            }
        };

        debug!(
            symbol = %intent.symbol,
            client_order_id = %intent.client_order_id,
            order_id = %order_id,
            status = ?ack.status,
            "Simulated order accepted"
        );
        Ok(ack)
    }

    /// 대기 주문 취소.
    pub fn cancel_order(&mut self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError> {
        self.engine
            .cancel(symbol, client_order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))?;
        if let Some(ack) = self.orders.get_mut(client_order_id) {
            ack.status = OrderStatusType::Cancelled;
            ack.timestamp = self.now;
        }
        Ok(())
    }

    /// 클라이언트 주문 ID로 주문 조회.
    pub fn fetch_order_by_client_id(&self, client_order_id: &str) -> Result<OrderAck, ExchangeError> {
        self.orders
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))
    }

    /// 포지션 스냅샷.
    pub fn fetch_position(&self, symbol: &str) -> PositionSnapshot {
        let mark = self.last_price(symbol).unwrap_or_default();
        match self.positions.get(symbol) {
            Some(pos) if !pos.quantity.is_zero() => PositionSnapshot {
                symbol: symbol.to_string(),
                side: Some(if pos.quantity > Decimal::ZERO { Side::Buy } else { Side::Sell }),
                quantity: pos.quantity.abs(),
                entry_price: pos.entry_price,
                mark_price: mark,
            },
            _ => PositionSnapshot::flat(symbol, mark),
        }
    }

    /// 미체결 주문 스냅샷.
    pub fn fetch_open_orders(&self, symbol: &str) -> Vec<OrderSnapshot> {
        self.engine
            .resting_orders(symbol)
            .iter()
            .map(|o| OrderSnapshot {
                order_id: o.order_id.clone(),
                client_order_id: o.client_order_id.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                order_type: o.order_type,
                quantity: o.quantity,
                filled_quantity: Decimal::ZERO,
                price: o.price,
                stop_price: o.stop_price,
                status: OrderStatusType::New,
            })
            .collect()
    }

    /// 새 틱 처리. 시각/가격을 갱신하고 트리거된 주문을 체결한 뒤 누적 체결을 반환합니다.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<FillEvent> {
        self.set_time(tick.timestamp);
        self.last_prices.insert(tick.symbol.clone(), tick.price);

        for matched in self.engine.on_tick(&tick.symbol, tick.price, tick.timestamp) {
            self.settle(matched);
        }
        self.drain_fills()
    }

    /// 누적된 체결 이벤트를 꺼냅니다.
    pub fn drain_fills(&mut self) -> Vec<FillEvent> {
        std::mem::take(&mut self.fills)
    }

    /// 체결 이벤트 보고 여부 (사용자 데이터 스트림 단절 재현용).
    pub fn set_fill_reports(&mut self, enabled: bool) {
        self.report_fills = enabled;
    }

    /// 거래소 측 포지션을 직접 설정합니다 (외부 개입/드리프트 재현용).
    pub fn inject_position(&mut self, symbol: &str, side: Side, quantity: Quantity, entry_price: Price) {
        self.positions.insert(
            symbol.to_string(),
            SimPosition {
                quantity: quantity * side.sign(),
                entry_price,
            },
        );
    }

    /// 이 방향 주문으로 줄일 수 있는 포지션 수량.
    fn closable_quantity(&self, symbol: &str, side: Side) -> Quantity {
        match self.positions.get(symbol) {
            Some(pos) if pos.quantity * side.sign() < Decimal::ZERO => pos.quantity.abs(),
            _ => Decimal::ZERO,
        }
    }

    fn ack_for(order: &RestingOrder, status: OrderStatusType, now: DateTime<Utc>) -> OrderAck {
        OrderAck {
            order_id: order.order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            status,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            fee: Decimal::ZERO,
            timestamp: now,
        }
    }

    /// 체결을 포지션/지갑/주문 상태에 반영하고 체결 이벤트를 적재합니다.
    fn settle(&mut self, matched: OrderMatch) {
        let order = matched.order;
        let quantity = if order.reduce_only {
            order.quantity.min(self.closable_quantity(&order.symbol, order.side))
        } else {
            order.quantity
        };

        if quantity.is_zero() {
            // 줄일 포지션이 없는 축소 전용 주문은 만료
            if let Some(ack) = self.orders.get_mut(&order.client_order_id) {
                ack.status = OrderStatusType::Expired;
                ack.timestamp = matched.timestamp;
            }
            return;
        }

        let fee_rate = if matched.is_maker {
            self.config.maker_fee
        } else {
            self.config.taker_fee
        };
        let fee = quantity * matched.fill_price * fee_rate;
        self.apply_to_position(&order.symbol, order.side, quantity, matched.fill_price);
        self.wallet -= fee;

        if let Some(ack) = self.orders.get_mut(&order.client_order_id) {
            ack.status = OrderStatusType::Filled;
            ack.filled_quantity = quantity;
            ack.average_price = Some(matched.fill_price);
            ack.fee = fee;
            ack.timestamp = matched.timestamp;
        }

        if !self.report_fills {
            debug!(client_order_id = %order.client_order_id, "Fill report suppressed");
            return;
        }
        self.fills.push(FillEvent {
            symbol: order.symbol,
            order_id: order.order_id,
            client_order_id: order.client_order_id,
            side: order.side,
            quantity,
            price: matched.fill_price,
            fee,
            is_maker: matched.is_maker,
            timestamp: matched.timestamp,
        });
    }

    fn apply_to_position(&mut self, symbol: &str, side: Side, quantity: Quantity, price: Price) {
        let pos = self.positions.entry(symbol.to_string()).or_default();
        let delta = quantity * side.sign();

        if pos.quantity.is_zero() || pos.quantity.signum() == delta.signum() {
            let total = pos.quantity + delta;
            pos.entry_price =
                (pos.entry_price * pos.quantity.abs() + price * quantity) / total.abs();
            pos.quantity = total;
            return;
        }

        let closing = quantity.min(pos.quantity.abs());
        let pnl = (price - pos.entry_price) * closing * pos.quantity.signum();
        self.wallet += pnl;
        pos.quantity += delta;
        if pos.quantity.is_zero() {
            pos.entry_price = Decimal::ZERO;
        } else if pos.quantity.signum() == delta.signum() {
            // 반대 방향으로 넘어간 잔량
            pos.entry_price = price;
        }
    }
}
