//! 청산 레그 계획.
//!
//! 포지션 하나에 대해 원하는 청산 주문 집합을 계산합니다:
//!
//! ```text
//! 손절      = 평균 진입가 ∓ stop_distance_pct          (전체 수량, 축소 전용 스탑)
//! 익절 i    = 평균 진입가 ± tp_levels[i]%              (floor(share_i × 누적 진입 수량) - 체결분)
//! 트레일링  = 활성화 후 max(손익분기, 최고가 - 거리)   (전체 수량, 축소 전용 스탑)
//! ```
//!
//! 익절 수량은 가까운 레그부터 채우므로, 합계가 포지션 수량을 넘으면 먼 레그부터 줄어듭니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use trader_core::{
    DecimalExt, ExitKind, ExitOrder, Percentage, Position, Price, Quantity, Side,
};

use crate::config::ExitConfig;

/// 원하는 청산 레그.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredExit {
    pub kind: ExitKind,
    pub ladder_index: u32,
    pub target_price: Price,
    pub share: Decimal,
    pub quantity: Quantity,
}

impl DesiredExit {
    /// 계획 상태의 청산 주문으로 변환.
    pub fn to_planned(&self) -> ExitOrder {
        ExitOrder::planned(
            self.kind,
            self.ladder_index,
            self.target_price,
            self.share,
            self.quantity,
        )
    }
}

/// 기존 주문 교체 판단.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceDecision {
    /// 그대로 유지
    Keep,
    /// 즉시 교체
    Replace,
    /// 목표가가 벗어났지만 쿨다운 중
    Cooldown,
}

/// 청산 계획기.
#[derive(Debug, Clone)]
pub struct ExitPlanner {
    config: ExitConfig,
    quantity_step: Decimal,
}

impl ExitPlanner {
    pub fn new(config: ExitConfig, quantity_step: Decimal) -> Self {
        Self {
            config,
            quantity_step,
        }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// 손절 거리 (%): 고정 거리와 ATR 거리 중 큰 값.
    pub fn stop_distance_pct(&self, price: Price, atr: Option<Price>) -> Percentage {
        let fixed = self.config.sl_fixed_pct;
        match atr {
            Some(atr) if atr > Decimal::ZERO && price > Decimal::ZERO => {
                let atr_pct = atr * self.config.sl_atr_mult / price * Decimal::ONE_HUNDRED;
                fixed.max(atr_pct)
            }
            _ => fixed,
        }
    }

    /// 손절 가격.
    pub fn stop_price(side: Side, avg_entry: Price, stop_pct: Percentage) -> Price {
        avg_entry - side.sign() * avg_entry.pct_of(stop_pct)
    }

    /// 익절 가격.
    pub fn take_profit_price(side: Side, avg_entry: Price, level_pct: Percentage) -> Price {
        avg_entry + side.sign() * avg_entry.pct_of(level_pct)
    }

    /// 트레일링 거리 (가격 단위). ATR이 없으면 R을 사용합니다.
    pub fn trail_distance(&self, initial_risk: Price, atr: Option<Price>) -> Price {
        match atr {
            Some(atr) if atr > Decimal::ZERO && self.config.trail_atr_mult > Decimal::ZERO => {
                atr * self.config.trail_atr_mult
            }
            _ => initial_risk,
        }
    }

    /// 트레일링 활성화 가격 (평균 진입가 ± be_trigger_r × R).
    pub fn activation_price(&self, side: Side, avg_entry: Price, initial_risk: Price) -> Price {
        avg_entry + side.sign() * self.config.be_trigger_r * initial_risk
    }

    /// 포지션의 원하는 청산 레그 (손절, 익절, 트레일링 순).
    pub fn desired_exits(&self, position: &Position, stop_pct: Percentage) -> Vec<DesiredExit> {
        if position.is_closed() {
            return Vec::new();
        }
        let side = position.side;
        let avg = position.avg_entry_price;
        let mut desired = vec![DesiredExit {
            kind: ExitKind::StopLoss,
            ladder_index: 0,
            target_price: Self::stop_price(side, avg, stop_pct),
            share: Decimal::ONE,
            quantity: position.quantity,
        }];

        let mut capacity = position.quantity;
        for (index, (level, share)) in self
            .config
            .tp_levels
            .iter()
            .zip(self.config.tp_shares.iter())
            .enumerate()
        {
            let index = index as u32;
            let filled: Quantity = position
                .exits
                .iter()
                .filter(|e| e.same_leg(ExitKind::TakeProfit, index))
                .map(|e| e.filled_quantity)
                .sum();
            let planned = (*share * position.entry_quantity_total).floor_to_step(self.quantity_step);
            let quantity = (planned - filled).min(capacity).floor_to_step(self.quantity_step);
            if quantity <= Decimal::ZERO {
                continue;
            }

            let target = Self::take_profit_price(side, avg, *level);
            if quantity * target < self.config.min_tp_notional {
                continue;
            }
            capacity -= quantity;
            desired.push(DesiredExit {
                kind: ExitKind::TakeProfit,
                ladder_index: index,
                target_price: target,
                share: *share,
                quantity: quantity.normalize(),
            });
        }

        if let (true, Some(level)) = (position.trailing.armed, position.trailing.level) {
            desired.push(DesiredExit {
                kind: ExitKind::Trailing,
                ladder_index: 0,
                target_price: level,
                share: Decimal::ONE,
                quantity: position.quantity,
            });
        }

        desired
    }

    /// 기존 주문을 원하는 레그로 교체해야 하는지 판단.
    ///
    /// 수량 변경은 즉시 교체, 목표가 변경은 epsilon을 넘고 쿨다운이 지났을 때만 교체합니다.
    pub fn replace_decision(
        &self,
        existing: &ExitOrder,
        desired: &DesiredExit,
        now: DateTime<Utc>,
    ) -> ReplaceDecision {
        if existing.remaining_quantity() != desired.quantity {
            return ReplaceDecision::Replace;
        }
        if desired.target_price.relative_diff(existing.target_price) <= self.config.replace_epsilon {
            return ReplaceDecision::Keep;
        }
        match existing.last_replace_at {
            Some(last) if now - last < self.config.replace_cooldown() => ReplaceDecision::Cooldown,
            _ => ReplaceDecision::Replace,
        }
    }
}

/// 라이브 익절 수량 합계가 포지션 수량을 넘을 때 줄여야 할 레그.
///
/// `(ladder_index, 새 수량)` 목록을 먼 레그부터 반환합니다. 새 수량이 0이면 취소 대상입니다.
pub fn take_profit_trims(position: &Position) -> Vec<(u32, Quantity)> {
    let mut excess = position.live_take_profit_quantity() - position.quantity;
    if excess <= Decimal::ZERO {
        return Vec::new();
    }

    let mut legs: Vec<&ExitOrder> = position
        .exits
        .iter()
        .filter(|e| e.is_live() && e.kind == ExitKind::TakeProfit)
        .collect();
    legs.sort_by(|a, b| b.ladder_index.cmp(&a.ladder_index));

    let mut trims = Vec::new();
    for leg in legs {
        if excess <= Decimal::ZERO {
            break;
        }
        let remaining = leg.remaining_quantity();
        let cut = remaining.min(excess);
        excess -= cut;
        trims.push((leg.ladder_index, remaining - cut));
    }
    trims
}
