//! 청산 주문(손절, 익절 래더, 트레일링)과 트레일링 상태.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{IntentKind, Side};
use crate::types::{Price, Quantity};

/// 청산 주문 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// 손절
    StopLoss,
    /// 익절
    TakeProfit,
    /// 트레일링 스탑
    Trailing,
}

impl ExitKind {
    /// 대응하는 주문 의도 종류.
    pub fn intent_kind(&self) -> IntentKind {
        match self {
            ExitKind::StopLoss => IntentKind::StopLoss,
            ExitKind::TakeProfit => IntentKind::TakeProfit,
            ExitKind::Trailing => IntentKind::Trailing,
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::StopLoss => write!(f, "stop_loss"),
            ExitKind::TakeProfit => write!(f, "take_profit"),
            ExitKind::Trailing => write!(f, "trailing"),
        }
    }
}

/// 청산 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// 계획됨 (아직 제출되지 않음)
    Pending,
    /// 거래소에 살아 있음
    Live,
    /// 전량 체결
    Filled,
    /// 취소됨
    Cancelled,
}

impl ExitStatus {
    /// 더 이상 변하지 않는 상태인지 확인.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExitStatus::Filled | ExitStatus::Cancelled)
    }
}

/// 포지션에 딸린 청산 주문.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitOrder {
    /// 종류
    pub kind: ExitKind,
    /// 래더 인덱스 (익절 레그 번호, 그 외 0)
    pub ladder_index: u32,
    /// 목표 가격 (익절은 지정가, 손절/트레일링은 스탑 가격)
    pub target_price: Price,
    /// 포지션 대비 수량 비중 (0 ~ 1)
    pub share: Decimal,
    /// 주문 수량
    pub quantity: Quantity,
    /// 체결된 수량
    pub filled_quantity: Quantity,
    /// 상태
    pub status: ExitStatus,
    /// 클라이언트 주문 ID
    pub client_order_id: Option<String>,
    /// 거래소 주문 ID
    pub remote_order_id: Option<String>,
    /// 마지막 교체 시각
    pub last_replace_at: Option<DateTime<Utc>>,
}

impl ExitOrder {
    /// 계획 상태의 청산 주문 생성.
    pub fn planned(
        kind: ExitKind,
        ladder_index: u32,
        target_price: Price,
        share: Decimal,
        quantity: Quantity,
    ) -> Self {
        Self {
            kind,
            ladder_index,
            target_price,
            share,
            quantity,
            filled_quantity: Decimal::ZERO,
            status: ExitStatus::Pending,
            client_order_id: None,
            remote_order_id: None,
            last_replace_at: None,
        }
    }

    /// 남은 수량.
    pub fn remaining_quantity(&self) -> Quantity {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    /// 거래소에 살아 있는지 확인.
    pub fn is_live(&self) -> bool {
        self.status == ExitStatus::Live
    }

    /// 아직 활성 상태(계획 또는 라이브)인지 확인.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// 같은 레그인지 확인.
    pub fn same_leg(&self, kind: ExitKind, ladder_index: u32) -> bool {
        self.kind == kind && self.ladder_index == ladder_index
    }
}

/// 트레일링 스탑 상태.
///
/// 활성화 이후 스탑 레벨은 손익분기에서 시작해 유리한 방향으로만 이동합니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    /// 활성화 여부
    pub armed: bool,
    /// 활성화 이후 최고(롱)/최저(숏) 가격
    pub best_price: Option<Price>,
    /// 현재 스탑 레벨
    pub level: Option<Price>,
}

impl TrailingState {
    /// 새 가격으로 상태 갱신. 레벨이 바뀌면 새 레벨을 반환합니다.
    ///
    /// * `activation_price` - 이 가격에 도달하면 활성화
    /// * `break_even` - 활성화 시 최초 레벨
    /// * `distance` - 최고가로부터의 트레일링 거리
    pub fn update(
        &mut self,
        side: Side,
        price: Price,
        activation_price: Price,
        break_even: Price,
        distance: Price,
    ) -> Option<Price> {
        let better = |a: Price, b: Price| match side {
            Side::Buy => a > b,
            Side::Sell => a < b,
        };
        let previous = self.level;

        if !self.armed {
            if better(activation_price, price) {
                return None;
            }
            self.armed = true;
            self.level = Some(break_even);
        }

        let best = match self.best_price {
            Some(best) if !better(price, best) => best,
            _ => price,
        };
        self.best_price = Some(best);

        let candidate = match side {
            Side::Buy => best - distance,
            Side::Sell => best + distance,
        };
        if let Some(level) = self.level {
            if better(candidate, level) {
                self.level = Some(candidate);
            }
        }

        if self.level != previous {
            self.level
        } else {
            None
        }
    }
}
