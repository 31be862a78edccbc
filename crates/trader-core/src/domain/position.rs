//! 포지션 추적 및 관리.
//!
//! 수량은 항상 `Σ 진입 체결 수량 - Σ 청산 체결 수량` 이며 음수가 될 수 없습니다.
//! 미실현 손익은 저장하지 않고 마크 가격에서 계산합니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{ExitKind, ExitOrder, Side, TrailingState};
use crate::error::{TraderError, TraderResult};
use crate::types::{Percentage, Price, Quantity};

/// DCA 추가 진입 체결.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaFill {
    /// 래더 인덱스 (0부터)
    pub ladder_index: u32,
    /// 래더 레벨 (앵커 대비 역행 퍼센트, 음수)
    pub level_pct: Percentage,
    /// 기본 수량 대비 배수
    pub multiplier: Decimal,
    /// 체결 가격
    pub price: Price,
    /// 체결 수량
    pub quantity: Quantity,
    /// 체결 시각
    pub timestamp: DateTime<Utc>,
}

/// 열린 포지션.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// 포지션 ID (예: "BTCUSDT-12")
    pub id: String,
    /// 거래 심볼
    pub symbol: String,
    /// 방향 (Buy = 롱, Sell = 숏)
    pub side: Side,
    /// 현재 수량
    pub quantity: Quantity,
    /// 평균 진입 가격
    pub avg_entry_price: Price,
    /// 최초 진입 가격 (DCA 래더 기준)
    pub anchor_price: Price,
    /// 최초 진입 수량 (DCA 배수 기준)
    pub base_quantity: Quantity,
    /// 누적 진입 수량
    pub entry_quantity_total: Quantity,
    /// 레버리지
    pub leverage: u32,
    /// 진입 시각
    pub opened_at: DateTime<Utc>,
    /// DCA 체결 목록 (레벨 순)
    pub dca_fills: Vec<DcaFill>,
    /// 실현 손익 (수수료 차감 전)
    pub realized_pnl: Decimal,
    /// 누적 수수료
    pub fees: Decimal,
    /// 누적 청산 수량
    pub exit_quantity: Quantity,
    /// 누적 청산 금액 (평균 청산가 계산용)
    pub exit_notional: Decimal,
    /// 청산 주문
    pub exits: Vec<ExitOrder>,
    /// 트레일링 상태
    pub trailing: TrailingState,
    /// 최초 손절 거리 R (가격 단위)
    pub initial_risk: Price,
    /// 마지막 갱신 시각
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// 최초 진입 체결로 포지션 생성.
    pub fn open(
        id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        price: Price,
        leverage: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            avg_entry_price: price,
            anchor_price: price,
            base_quantity: quantity,
            entry_quantity_total: quantity,
            leverage,
            opened_at: timestamp,
            dca_fills: Vec::new(),
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            exit_quantity: Decimal::ZERO,
            exit_notional: Decimal::ZERO,
            exits: Vec::new(),
            trailing: TrailingState::default(),
            initial_risk: Decimal::ZERO,
            updated_at: timestamp,
        }
    }

    /// 롱 포지션 여부.
    pub fn is_long(&self) -> bool {
        self.side == Side::Buy
    }

    /// 수량이 0인지 확인.
    pub fn is_closed(&self) -> bool {
        self.quantity.is_zero()
    }

    /// 진입 체결 반영. 평균 진입 가격을 가중 평균으로 갱신합니다.
    pub fn add_entry(&mut self, quantity: Quantity, price: Price, timestamp: DateTime<Utc>) {
        if quantity <= Decimal::ZERO {
            return;
        }
        let total = self.quantity + quantity;
        self.avg_entry_price = (self.avg_entry_price * self.quantity + price * quantity) / total;
        self.quantity = total;
        self.entry_quantity_total += quantity;
        self.updated_at = timestamp;
    }

    /// 청산 체결 반영. 이 체결의 실현 손익을 반환합니다.
    ///
    /// 포지션 수량보다 큰 청산은 불변식 위반입니다.
    pub fn reduce(
        &mut self,
        quantity: Quantity,
        price: Price,
        timestamp: DateTime<Utc>,
    ) -> TraderResult<Decimal> {
        if quantity > self.quantity {
            return Err(TraderError::Invariant(format!(
                "exit quantity {} exceeds position quantity {} for {}",
                quantity, self.quantity, self.id
            )));
        }
        let pnl = (price - self.avg_entry_price) * quantity * self.side.sign();
        self.quantity -= quantity;
        self.realized_pnl += pnl;
        self.exit_quantity += quantity;
        self.exit_notional += price * quantity;
        self.updated_at = timestamp;
        Ok(pnl)
    }

    /// 마크 가격 기준 미실현 손익.
    pub fn unrealized_pnl(&self, mark_price: Price) -> Decimal {
        (mark_price - self.avg_entry_price) * self.quantity * self.side.sign()
    }

    /// 현재 명목 금액.
    pub fn notional(&self, price: Price) -> Decimal {
        self.quantity * price
    }

    /// 평균 청산 가격.
    pub fn average_exit_price(&self) -> Option<Price> {
        if self.exit_quantity.is_zero() {
            None
        } else {
            Some(self.exit_notional / self.exit_quantity)
        }
    }

    /// 앵커 대비 역행 퍼센트 (역행이면 음수, 예: -1.2).
    pub fn move_from_anchor_pct(&self, price: Price) -> Percentage {
        if self.anchor_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.anchor_price) / self.anchor_price * Decimal::ONE_HUNDRED * self.side.sign()
    }

    /// 특정 레그의 활성 청산 주문.
    pub fn open_exit(&self, kind: ExitKind, ladder_index: u32) -> Option<&ExitOrder> {
        self.exits
            .iter()
            .find(|e| e.is_open() && e.same_leg(kind, ladder_index))
    }

    /// 라이브 손절 주문 수.
    pub fn live_stop_count(&self) -> usize {
        self.exits
            .iter()
            .filter(|e| e.is_live() && e.kind == ExitKind::StopLoss)
            .count()
    }

    /// 라이브 익절 주문의 남은 수량 합계.
    pub fn live_take_profit_quantity(&self) -> Quantity {
        self.exits
            .iter()
            .filter(|e| e.is_live() && e.kind == ExitKind::TakeProfit)
            .map(|e| e.remaining_quantity())
            .sum()
    }
}
