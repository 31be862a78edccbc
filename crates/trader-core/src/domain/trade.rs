//! 종료된 포지션의 거래 기록.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Position, Side};
use crate::types::{Price, Quantity};

/// 포지션 종료 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// 손절 체결
    StopLoss,
    /// 익절 래더 소진
    TakeProfit,
    /// 트레일링 스탑 체결
    Trailing,
    /// 강제 청산 (종료/수동)
    Flatten,
    /// 거래소에서 청산된 것을 조정 루프가 발견
    Reconciled,
}

/// 거래 기록. 포지션 수량이 0이 되는 순간 생성되며 이후 변경되지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// 포지션 ID
    pub position_id: String,
    /// 심볼
    pub symbol: String,
    /// 방향
    pub side: Side,
    /// 평균 진입 가격
    pub avg_entry_price: Price,
    /// 평균 청산 가격
    pub avg_exit_price: Price,
    /// 누적 진입 수량
    pub quantity: Quantity,
    /// 실현 손익 (수수료 차감 후)
    pub realized_pnl: Decimal,
    /// 수수료
    pub fees: Decimal,
    /// DCA 체결 횟수
    pub dca_count: u32,
    /// 종료 사유
    pub exit_reason: ExitReason,
    /// 진입 시각
    pub opened_at: DateTime<Utc>,
    /// 종료 시각
    pub closed_at: DateTime<Utc>,
}

impl Trade {
    /// 종료된 포지션에서 거래 기록 생성.
    pub fn from_position(
        position: &Position,
        exit_reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            avg_entry_price: position.avg_entry_price,
            avg_exit_price: position
                .average_exit_price()
                .unwrap_or(position.avg_entry_price),
            quantity: position.entry_quantity_total,
            realized_pnl: position.realized_pnl - position.fees,
            fees: position.fees,
            dca_count: position.dca_fills.len() as u32,
            exit_reason,
            opened_at: position.opened_at,
            closed_at,
        }
    }

    /// 수익 거래 여부.
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

/// 거래 기록 요약 통계.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    /// 거래 수
    pub trades: usize,
    /// 수익 거래 수
    pub wins: usize,
    /// 순손익
    pub net_pnl: Decimal,
    /// 총 수수료
    pub fees: Decimal,
}

impl TradeStats {
    /// 거래 목록에서 통계 계산.
    pub fn from_trades<'a>(trades: impl IntoIterator<Item = &'a Trade>) -> Self {
        trades.into_iter().fold(Self::default(), |mut stats, trade| {
            stats.trades += 1;
            if trade.is_win() {
                stats.wins += 1;
            }
            stats.net_pnl += trade.realized_pnl;
            stats.fees += trade.fees;
            stats
        })
    }

    /// 승률 (0 ~ 100).
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }
}
