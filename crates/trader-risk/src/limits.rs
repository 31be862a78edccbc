//! 일일 손실 추적.
//!
//! 제공 기능:
//! - 실현 손익 기록과 당일 누적
//! - 당일 시작 자산 대비 손실 한도 초과 감지
//! - 명시적인 롤오버 이벤트로만 초기화 (벽시계 자동 초기화 없음)
//!
//! 롤오버는 스케줄러가 논리 시계의 날짜 변경을 감지해 호출합니다. 백테스트에서도
//! 재생되는 틱의 날짜로 동일하게 동작합니다.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use trader_core::{AccountState, DecimalExt, Percentage};

/// 단일 손익 기록.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnLRecord {
    /// 손익 이벤트의 타임스탬프
    pub timestamp: DateTime<Utc>,
    /// 이 손익과 관련된 심볼
    pub symbol: String,
    /// 실현 손익 금액 (양수 = 이익, 음수 = 손실)
    pub amount: Decimal,
    /// 관련 포지션 ID
    pub position_id: Option<String>,
}

impl PnLRecord {
    /// 새 손익 기록 생성.
    pub fn new(timestamp: DateTime<Utc>, symbol: impl Into<String>, amount: Decimal) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            amount,
            position_id: None,
        }
    }

    /// 기록에 포지션 ID 추가.
    pub fn with_position_id(mut self, position_id: impl Into<String>) -> Self {
        self.position_id = Some(position_id.into());
        self
    }

    /// 손실인지 확인.
    pub fn is_loss(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    /// 이익인지 확인.
    pub fn is_profit(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

/// 일일 손실 한도 상태.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyLimitStatus {
    /// 상태가 속한 거래일
    pub trading_day: NaiveDate,
    /// 거래 허용 여부
    pub can_trade: bool,
    /// 현재 일일 손익
    pub daily_pnl: Decimal,
    /// 허용된 최대 일일 손실
    pub max_daily_loss: Decimal,
    /// 한도 도달 전 남은 손실 허용량
    pub remaining_allowance: Decimal,
    /// 일일 한도 사용 비율
    pub limit_usage_pct: f64,
    /// 오늘의 실현 건수
    pub trade_count: usize,
    /// 한도에 근접할 때 경고 메시지
    pub warning: Option<String>,
}

impl DailyLimitStatus {
    /// 한도를 초과했는지 확인.
    pub fn is_limit_exceeded(&self) -> bool {
        !self.can_trade
    }
}

/// 일일 손실 한도 추적기.
///
/// [`AccountState`]를 소유하며, 한도 초과 플래그는 `on_day_rollover`에서만 해제됩니다.
#[derive(Debug, Clone)]
pub struct DailyLossTracker {
    /// 당일 시작 자산 대비 최대 일일 손실 비율
    max_daily_loss_pct: Percentage,
    /// 경고 기준 사용률
    warning_threshold_pct: f64,
    /// 계좌 상태
    account: AccountState,
    /// 오늘의 모든 손익 기록
    records: Vec<PnLRecord>,
    /// 심볼별 손익 요약
    symbol_pnl: BTreeMap<String, Decimal>,
}

impl DailyLossTracker {
    /// 새 일일 손실 추적기 생성.
    ///
    /// # Arguments
    /// * `max_daily_loss_pct` - 당일 시작 자산 대비 최대 일일 손실 (예: 5%는 5.0)
    /// * `equity` - 시작 자산
    /// * `trading_day` - 시작 거래일
    pub fn new(max_daily_loss_pct: Percentage, equity: Decimal, trading_day: NaiveDate) -> Self {
        Self {
            max_daily_loss_pct,
            warning_threshold_pct: 70.0,
            account: AccountState::new(equity, trading_day),
            records: Vec::new(),
            symbol_pnl: BTreeMap::new(),
        }
    }

    /// 경고 기준 사용률 설정.
    pub fn with_warning_threshold(mut self, pct: f64) -> Self {
        self.warning_threshold_pct = pct;
        self
    }

    /// 저장된 계좌 상태에서 복원.
    pub fn restore(max_daily_loss_pct: Percentage, account: AccountState) -> Self {
        Self {
            max_daily_loss_pct,
            warning_threshold_pct: 70.0,
            account,
            records: Vec::new(),
            symbol_pnl: BTreeMap::new(),
        }
    }

    /// 계좌 상태.
    pub fn account(&self) -> &AccountState {
        &self.account
    }

    /// 손익 이벤트 기록.
    ///
    /// 자산과 당일 손익을 갱신하고, 누적 손실이 한도 이상이면 플래그를 세웁니다.
    pub fn record_pnl(&mut self, record: PnLRecord) -> DailyLimitStatus {
        self.account.equity += record.amount;
        self.account.realized_daily_pnl += record.amount;
        *self.symbol_pnl.entry(record.symbol.clone()).or_insert(Decimal::ZERO) += record.amount;
        self.records.push(record);

        self.check_limit_breach();
        self.status()
    }

    /// 실현되지 않은 자산 변동 반영 (예: 거래소 잔고 동기화).
    pub fn set_equity(&mut self, equity: Decimal) {
        self.account.equity = equity;
    }

    fn check_limit_breach(&mut self) {
        if self.account.daily_loss_breached {
            return;
        }
        let limit = self.effective_limit();
        if self.account.daily_loss() >= limit && limit > Decimal::ZERO {
            self.account.daily_loss_breached = true;
            tracing::warn!(
                trading_day = %self.account.trading_day,
                daily_pnl = %self.account.realized_daily_pnl,
                limit = %limit,
                "Daily loss limit breached, new entries halted until rollover"
            );
        }
    }

    /// 거래일 롤오버. 새 날짜가 현재 거래일 이후일 때만 적용됩니다.
    ///
    /// 적용되면 `true`.
    pub fn on_day_rollover(&mut self, day: NaiveDate) -> bool {
        if day <= self.account.trading_day {
            return false;
        }
        let previous = self.account.trading_day;
        let previous_pnl = self.account.realized_daily_pnl;

        self.account.trading_day = day;
        self.account.day_start_equity = self.account.equity;
        self.account.realized_daily_pnl = Decimal::ZERO;
        self.account.daily_loss_breached = false;
        self.records.clear();
        self.symbol_pnl.clear();

        tracing::info!(
            previous_day = %previous,
            trading_day = %day,
            previous_pnl = %previous_pnl,
            equity = %self.account.equity,
            "Trading day rolled over"
        );
        true
    }

    /// 당일 시작 자산 기준 손실 한도 금액.
    pub fn effective_limit(&self) -> Decimal {
        self.account.day_start_equity.pct_of(self.max_daily_loss_pct)
    }

    /// 현재 일일 한도 상태 조회.
    pub fn status(&self) -> DailyLimitStatus {
        let limit = self.effective_limit();
        let loss = self.account.daily_loss();
        let limit_usage_pct = if limit > Decimal::ZERO {
            (loss / limit * Decimal::ONE_HUNDRED).to_f64_lossy()
        } else {
            0.0
        };

        let warning = if self.account.daily_loss_breached {
            Some("Daily loss limit reached; entries paused until rollover".to_string())
        } else if limit_usage_pct >= self.warning_threshold_pct {
            Some(format!("Daily loss limit is {:.1}% used", limit_usage_pct))
        } else {
            None
        };

        DailyLimitStatus {
            trading_day: self.account.trading_day,
            can_trade: !self.account.daily_loss_breached,
            daily_pnl: self.account.realized_daily_pnl,
            max_daily_loss: limit,
            remaining_allowance: (limit - loss).max(Decimal::ZERO),
            limit_usage_pct,
            trade_count: self.records.len(),
            warning,
        }
    }

    /// 거래 허용 여부 확인.
    pub fn can_trade(&self) -> bool {
        !self.account.daily_loss_breached
    }

    /// 특정 심볼의 당일 손익 조회.
    pub fn symbol_pnl(&self, symbol: &str) -> Decimal {
        self.symbol_pnl.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    /// 오늘의 모든 손익 기록 조회.
    pub fn records(&self) -> &[PnLRecord] {
        &self.records
    }
}
