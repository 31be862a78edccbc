//! 계좌 상태.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 리스크 관리자가 소유하는 계좌 상태.
///
/// 일일 카운터는 `trading_day`에 속하며 명시적인 롤오버 이벤트에서만 초기화됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    /// 현재 자산
    pub equity: Decimal,
    /// 당일 시작 자산
    pub day_start_equity: Decimal,
    /// 당일 실현 손익
    pub realized_daily_pnl: Decimal,
    /// 일일 손실 한도 초과 여부
    pub daily_loss_breached: bool,
    /// 카운터가 속한 거래일
    pub trading_day: NaiveDate,
}

impl AccountState {
    /// 새 계좌 상태.
    pub fn new(equity: Decimal, trading_day: NaiveDate) -> Self {
        Self {
            equity,
            day_start_equity: equity,
            realized_daily_pnl: Decimal::ZERO,
            daily_loss_breached: false,
            trading_day,
        }
    }

    /// 당일 손실액 (손실이 없으면 0).
    pub fn daily_loss(&self) -> Decimal {
        (-self.realized_daily_pnl).max(Decimal::ZERO)
    }
}
