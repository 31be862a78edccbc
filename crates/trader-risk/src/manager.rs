//! 리스크 매니저 구현.
//!
//! 모든 리스크 관리 작업을 위한 통합 인터페이스 제공:
//! - 시그널과 자산 기반 진입 수량 계산
//! - DCA 추가 매수 검증
//! - 일일 손실 한도 추적과 명시적 롤오버
//!
//! 계좌 상태([`AccountState`])는 이 매니저가 소유하며, 엔진은 읽기만 합니다.

use crate::config::RiskConfig;
use crate::limits::{DailyLimitStatus, DailyLossTracker, PnLRecord};
use crate::position_sizing::{PositionSizer, SizedOrder};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};
use trader_core::{AccountState, ErrorClass, Percentage, Price, Quantity, Signal, TraderError};

/// 리스크 거부 사유.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    /// 일일 손실 한도 초과 (롤오버 전까지 진입/추가 금지)
    #[error("daily loss limit breached (daily pnl {daily_pnl}, limit {limit})")]
    DailyLossBreached { daily_pnl: Decimal, limit: Decimal },

    /// 최소 명목가 미만
    #[error("notional {notional} below minimum {min_notional}")]
    BelowMinNotional { notional: Decimal, min_notional: Decimal },

    /// 레버리지 상한 초과
    #[error("leverage {leverage:.2}x exceeds maximum {max_leverage}x")]
    LeverageExceeded { leverage: Decimal, max_leverage: u32 },

    /// 수량 단위로 내림한 결과 0
    #[error("quantity rounds down to zero")]
    ZeroQuantity,

    /// 잘못된 입력
    #[error("invalid sizing input: {0}")]
    InvalidInput(String),
}

impl RiskRejection {
    /// 에러 분류. 리스크 거부는 해당 의도만 중단하며 재시도하지 않습니다.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }

    /// 일일 한도에 의한 거부인지 확인.
    pub fn is_daily_limit(&self) -> bool {
        matches!(self, RiskRejection::DailyLossBreached { .. })
    }
}

impl From<RiskRejection> for TraderError {
    fn from(rejection: RiskRejection) -> Self {
        TraderError::Risk(rejection.to_string())
    }
}

/// 진입 수량 계산과 일일 손실 한도를 담당하는 리스크 매니저.
#[derive(Debug, Clone)]
pub struct RiskManager {
    /// 리스크 설정
    config: RiskConfig,
    /// 포지션 크기 계산기
    sizer: PositionSizer,
    /// 일일 손실 추적기 (계좌 상태 소유)
    tracker: DailyLossTracker,
}

impl RiskManager {
    /// 설정, 시작 자산, 시작 거래일로 새 리스크 매니저 생성.
    pub fn new(config: RiskConfig, equity: Decimal, trading_day: NaiveDate) -> Self {
        let tracker = DailyLossTracker::new(config.max_daily_loss_pct, equity, trading_day)
            .with_warning_threshold(config.warning_threshold_pct);
        Self {
            sizer: PositionSizer::new(config.clone()),
            config,
            tracker,
        }
    }

    /// 저장된 계좌 상태로 복원.
    pub fn restore(config: RiskConfig, account: AccountState) -> Self {
        let tracker = DailyLossTracker::restore(config.max_daily_loss_pct, account)
            .with_warning_threshold(config.warning_threshold_pct);
        Self {
            sizer: PositionSizer::new(config.clone()),
            config,
            tracker,
        }
    }

    /// 설정 참조 조회.
    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// 계좌 상태 조회.
    pub fn account(&self) -> &AccountState {
        self.tracker.account()
    }

    /// 현재 자산.
    pub fn equity(&self) -> Decimal {
        self.tracker.account().equity
    }

    /// 포지션에 적용할 레버리지.
    pub fn leverage(&self) -> u32 {
        self.config.max_leverage
    }

    /// 신규 진입/추가 매수 허용 여부.
    pub fn can_trade(&self) -> bool {
        self.tracker.can_trade()
    }

    /// 수량을 거래 단위로 내림.
    pub fn round_quantity(&self, quantity: Quantity) -> Quantity {
        self.sizer.round_quantity(quantity)
    }

    // ==================== 사이징 ====================

    /// 시그널에 대한 진입 수량 계산.
    ///
    /// # Arguments
    /// * `signal` - 진입 시그널
    /// * `entry_price` - 예상 진입 가격
    /// * `stop_distance_pct` - 진입가 대비 손절 거리 (1.0 = 1%)
    pub fn size_entry(
        &self,
        signal: &Signal,
        entry_price: Price,
        stop_distance_pct: Percentage,
    ) -> Result<SizedOrder, RiskRejection> {
        self.ensure_trading_allowed()?;

        let sized = self
            .sizer
            .size_by_risk(self.equity(), entry_price, stop_distance_pct)?;

        debug!(
            symbol = %signal.symbol,
            direction = %signal.direction,
            quantity = %sized.quantity,
            notional = %sized.notional,
            risk_amount = %sized.risk_amount,
            "Entry sized"
        );
        Ok(sized)
    }

    /// DCA 추가 매수 검증. 거래 단위로 내림한 추가 수량을 반환합니다.
    ///
    /// # Arguments
    /// * `add_quantity` - 원하는 추가 수량
    /// * `price` - 현재 가격
    /// * `current_quantity` - 추가 전 포지션 수량
    pub fn check_add(
        &self,
        add_quantity: Quantity,
        price: Price,
        current_quantity: Quantity,
    ) -> Result<Quantity, RiskRejection> {
        self.ensure_trading_allowed()?;

        let quantity = self.sizer.round_quantity(add_quantity);
        if quantity.is_zero() {
            return Err(RiskRejection::ZeroQuantity);
        }
        let add_notional = quantity * price;
        let total_notional = (current_quantity + quantity) * price;
        self.sizer
            .validate_notional(add_notional, total_notional, self.equity())?;
        Ok(quantity)
    }

    fn ensure_trading_allowed(&self) -> Result<(), RiskRejection> {
        if self.tracker.can_trade() {
            return Ok(());
        }
        let account = self.tracker.account();
        Err(RiskRejection::DailyLossBreached {
            daily_pnl: account.realized_daily_pnl,
            limit: self.tracker.effective_limit(),
        })
    }

    // ==================== 일일 손실 ====================

    /// 실현 손익 반영. 누적 손실이 한도를 넘으면 한도 초과 플래그가 세워집니다.
    pub fn register_realized_pnl(
        &mut self,
        delta: Decimal,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> DailyLimitStatus {
        let status = self.tracker.record_pnl(PnLRecord::new(at, symbol, delta));
        info!(
            symbol = %symbol,
            delta = %delta,
            daily_pnl = %status.daily_pnl,
            equity = %self.equity(),
            "Realized PnL registered"
        );
        status
    }

    /// 거래일 롤오버. 스케줄러가 논리 시계의 날짜 변경 시 호출합니다.
    pub fn on_day_rollover(&mut self, day: NaiveDate) -> bool {
        self.tracker.on_day_rollover(day)
    }

    /// 현재 일일 한도 상태.
    pub fn daily_status(&self) -> DailyLimitStatus {
        self.tracker.status()
    }

    /// 거래소 잔고로 자산 동기화.
    pub fn set_equity(&mut self, equity: Decimal) {
        self.tracker.set_equity(equity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use trader_core::Direction;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn at(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 9, 0, 0).unwrap()
    }

    fn long_signal(d: u32) -> Signal {
        Signal::new("BTCUSDT", Direction::Long, 0.9, 30.0, at(d))
    }

    #[test]
    fn test_size_entry_reference_case() {
        let manager = RiskManager::new(RiskConfig::default(), dec!(10000), day(1));
        let sized = manager
            .size_entry(&long_signal(1), dec!(50000), dec!(1.0))
            .unwrap();

        // 손절 시 손실 ≈ 자산의 0.5% (한 단위 이내)
        let loss_at_stop = sized.quantity * dec!(50000) * dec!(0.01);
        assert!((loss_at_stop - dec!(50)).abs() <= dec!(50000) * dec!(0.01) * dec!(0.001));
    }

    #[test]
    fn test_daily_loss_blocks_entry_until_rollover() {
        let mut manager = RiskManager::new(RiskConfig::default(), dec!(10000), day(1));

        // 한도 500 (5%) 에 근접
        let status = manager.register_realized_pnl(dec!(-300), "BTCUSDT", at(1));
        assert!(status.can_trade);
        assert!(manager.size_entry(&long_signal(1), dec!(50000), dec!(1.0)).is_ok());

        // 누적 손실 500 → 한도 초과
        let status = manager.register_realized_pnl(dec!(-200), "BTCUSDT", at(1));
        assert!(!status.can_trade);
        let rejection = manager
            .size_entry(&long_signal(1), dec!(50000), dec!(1.0))
            .unwrap_err();
        assert!(rejection.is_daily_limit());
        assert!(manager.check_add(dec!(0.01), dec!(50000), dec!(0.1)).is_err());

        // 롤오버 후 해제
        assert!(manager.on_day_rollover(day(2)));
        assert!(manager.can_trade());
        assert!(manager.size_entry(&long_signal(2), dec!(50000), dec!(1.0)).is_ok());
        assert_eq!(manager.account().day_start_equity, dec!(9500));
    }

    #[test]
    fn test_check_add_rounds_and_caps_leverage() {
        let manager = RiskManager::new(RiskConfig::default(), dec!(10000), day(1));

        assert_eq!(
            manager.check_add(dec!(0.15049), dec!(50000), dec!(0.1)).unwrap(),
            dec!(0.15)
        );

        // 총 명목가 (0.1 + 1.0) × 50,000 = 55,000 → 5.5배
        let rejection = manager.check_add(dec!(1.0), dec!(50000), dec!(0.1)).unwrap_err();
        assert!(matches!(rejection, RiskRejection::LeverageExceeded { .. }));
    }

    #[test]
    fn test_restore_keeps_breach_flag() {
        let mut manager = RiskManager::new(RiskConfig::default(), dec!(10000), day(1));
        manager.register_realized_pnl(dec!(-800), "BTCUSDT", at(1));

        let restored = RiskManager::restore(RiskConfig::default(), manager.account().clone());
        assert!(!restored.can_trade());
        assert_eq!(restored.equity(), dec!(9200));
    }

    #[test]
    fn test_rejection_into_trader_error() {
        let err: TraderError = RiskRejection::ZeroQuantity.into();
        assert!(matches!(err, TraderError::Risk(_)));
        assert_eq!(RiskRejection::ZeroQuantity.class(), ErrorClass::Fatal);
    }
}
