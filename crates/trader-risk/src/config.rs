//! 리스크 관리 설정.
//!
//! 거래당 리스크, 일일 손실 한도, 레버리지 상한, 최소 명목가를 정의합니다.
//! 퍼센트 값은 모두 `1.0 = 1%` 표기입니다.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use trader_core::{ConfigValidationError, Percentage};

/// 전역 리스크 관리 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// 거래당 리스크 비율 (기본값: 0.5%)
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: Percentage,

    /// 당일 시작 자산 대비 최대 일일 손실 비율 (기본값: 5%)
    /// 이 한도에 도달하면 롤오버 전까지 신규 진입과 추가 매수가 중지됩니다
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Percentage,

    /// 최대 레버리지 (명목가 / 자산, 기본값: 5)
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,

    /// 최소 주문 명목가 (기본값: 5 USDT)
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,

    /// 수량 단위 (기본값: 0.001)
    #[serde(default = "default_quantity_step")]
    pub quantity_step: Decimal,

    /// 한도 경고 기준 사용률 (기본값: 70%)
    #[serde(default = "default_warning_threshold_pct")]
    pub warning_threshold_pct: f64,
}

// 기본값 함수들
fn default_risk_per_trade_pct() -> Percentage {
    dec!(0.5)
}

fn default_max_daily_loss_pct() -> Percentage {
    dec!(5.0)
}

fn default_max_leverage() -> u32 {
    5
}

fn default_min_notional() -> Decimal {
    dec!(5)
}

fn default_quantity_step() -> Decimal {
    dec!(0.001)
}

fn default_warning_threshold_pct() -> f64 {
    70.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: default_risk_per_trade_pct(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_leverage: default_max_leverage(),
            min_notional: default_min_notional(),
            quantity_step: default_quantity_step(),
            warning_threshold_pct: default_warning_threshold_pct(),
        }
    }
}

impl RiskConfig {
    /// 설정 값을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.risk_per_trade_pct <= Decimal::ZERO || self.risk_per_trade_pct > dec!(10) {
            return Err(ConfigValidationError::InvalidValue(format!(
                "risk.risk_per_trade_pct must be within (0, 10] (got {})",
                self.risk_per_trade_pct
            )));
        }

        if self.max_daily_loss_pct <= Decimal::ZERO || self.max_daily_loss_pct > dec!(100) {
            return Err(ConfigValidationError::InvalidValue(format!(
                "risk.max_daily_loss_pct must be within (0, 100] (got {})",
                self.max_daily_loss_pct
            )));
        }

        if self.max_leverage == 0 || self.max_leverage > 125 {
            return Err(ConfigValidationError::InvalidValue(format!(
                "risk.max_leverage must be within 1..=125 (got {})",
                self.max_leverage
            )));
        }

        if self.min_notional < Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(
                "risk.min_notional cannot be negative".to_string(),
            ));
        }

        if self.quantity_step <= Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(
                "risk.quantity_step must be positive".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.warning_threshold_pct) {
            return Err(ConfigValidationError::InvalidValue(format!(
                "risk.warning_threshold_pct must be within 0-100 (got {})",
                self.warning_threshold_pct
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RiskConfig::default();
        assert_eq!(config.risk_per_trade_pct, dec!(0.5));
        assert_eq!(config.max_daily_loss_pct, dec!(5.0));
        assert_eq!(config.max_leverage, 5);
        assert_eq!(config.min_notional, dec!(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RiskConfig::default();
        config.risk_per_trade_pct = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = RiskConfig::default();
        config.max_leverage = 0;
        assert!(config.validate().is_err());

        let mut config = RiskConfig::default();
        config.quantity_step = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: RiskConfig = serde_json::from_str(r#"{"max_leverage": 3}"#).unwrap();
        assert_eq!(config.max_leverage, 3);
        assert_eq!(config.risk_per_trade_pct, dec!(0.5));
    }
}
