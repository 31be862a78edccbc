//! 포지션 크기 계산.
//!
//! 리스크 예산 방식:
//!
//! ```text
//! 예산          = 자산 × risk_per_trade_pct / 100
//! 단위당 리스크 = 진입가 × stop_distance_pct / 100
//! 수량          = floor_to_step(예산 / 단위당 리스크)
//! ```
//!
//! 계산된 수량은 최소 명목가와 최대 레버리지에 대해 검증됩니다.

use crate::config::RiskConfig;
use crate::manager::RiskRejection;
use rust_decimal::Decimal;
use serde::Serialize;
use trader_core::{DecimalExt, Percentage, Price, Quantity};

/// 사이징 결과.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizedOrder {
    /// 수량 단위로 내림된 수량
    pub quantity: Quantity,
    /// 명목가 (수량 × 가격)
    pub notional: Decimal,
    /// 손절 시 예상 손실 금액
    pub risk_amount: Decimal,
    /// 유효 레버리지 (명목가 / 자산)
    pub leverage: Decimal,
}

/// 포지션 크기 계산기.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    /// 주어진 설정으로 새 포지션 사이저를 생성.
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// 거래당 리스크 예산.
    pub fn risk_budget(&self, equity: Decimal) -> Decimal {
        equity.pct_of(self.config.risk_per_trade_pct)
    }

    /// 수량을 설정된 단위로 내림.
    pub fn round_quantity(&self, quantity: Quantity) -> Quantity {
        quantity.floor_to_step(self.config.quantity_step).normalize()
    }

    /// 손절 거리 기반 진입 수량 계산.
    ///
    /// # 인자
    /// * `equity` - 현재 자산
    /// * `entry_price` - 예상 진입 가격
    /// * `stop_distance_pct` - 진입가 대비 손절 거리 (1.0 = 1%)
    pub fn size_by_risk(
        &self,
        equity: Decimal,
        entry_price: Price,
        stop_distance_pct: Percentage,
    ) -> Result<SizedOrder, RiskRejection> {
        if equity <= Decimal::ZERO {
            return Err(RiskRejection::InvalidInput(format!("equity must be positive (got {})", equity)));
        }
        if entry_price <= Decimal::ZERO {
            return Err(RiskRejection::InvalidInput(format!(
                "entry price must be positive (got {})",
                entry_price
            )));
        }
        if stop_distance_pct <= Decimal::ZERO {
            return Err(RiskRejection::InvalidInput(format!(
                "stop distance must be positive (got {}%)",
                stop_distance_pct
            )));
        }

        let budget = self.risk_budget(equity);
        let per_unit_risk = entry_price.pct_of(stop_distance_pct);
        let quantity = self.round_quantity(budget / per_unit_risk);

        if quantity.is_zero() {
            return Err(RiskRejection::ZeroQuantity);
        }

        let notional = quantity * entry_price;
        self.validate_notional(notional, notional, equity)?;

        Ok(SizedOrder {
            quantity,
            notional,
            risk_amount: quantity * per_unit_risk,
            leverage: notional / equity,
        })
    }

    /// 주문 명목가와 포지션 총 명목가를 검증.
    ///
    /// `order_notional`은 최소 명목가, `total_notional`은 레버리지 상한과 비교합니다.
    pub fn validate_notional(
        &self,
        order_notional: Decimal,
        total_notional: Decimal,
        equity: Decimal,
    ) -> Result<(), RiskRejection> {
        if order_notional < self.config.min_notional {
            return Err(RiskRejection::BelowMinNotional {
                notional: order_notional,
                min_notional: self.config.min_notional,
            });
        }

        if equity <= Decimal::ZERO {
            return Err(RiskRejection::InvalidInput(format!("equity must be positive (got {})", equity)));
        }

        let leverage = total_notional / equity;
        if leverage > Decimal::from(self.config.max_leverage) {
            return Err(RiskRejection::LeverageExceeded {
                leverage,
                max_leverage: self.config.max_leverage,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reference_sizing() {
        let sizer = PositionSizer::new(RiskConfig::default());

        // 자산 10,000, 리스크 0.5%, 손절 1.0%, 진입 50,000
        let sized = sizer.size_by_risk(dec!(10000), dec!(50000), dec!(1.0)).unwrap();
        assert_eq!(sized.quantity, dec!(0.1));
        assert_eq!(sized.quantity * dec!(50000) * dec!(0.01), dec!(50));
        assert_eq!(sized.risk_amount, dec!(50));
        assert_eq!(sized.leverage, dec!(0.5));
    }

    #[test]
    fn test_quantity_floored_to_step() {
        let sizer = PositionSizer::new(RiskConfig::default());

        // 50 / (43210 × 1.3%) = 0.0890... → 0.089
        let sized = sizer.size_by_risk(dec!(10000), dec!(43210), dec!(1.3)).unwrap();
        assert_eq!(sized.quantity, dec!(0.089));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let sizer = PositionSizer::new(RiskConfig::default());
        let result = sizer.size_by_risk(dec!(10), dec!(50000), dec!(1.0));
        assert_eq!(result, Err(RiskRejection::ZeroQuantity));
    }

    #[test]
    fn test_below_min_notional_rejected() {
        let config = RiskConfig {
            quantity_step: dec!(0.00001),
            ..Default::default()
        };
        let sizer = PositionSizer::new(config);

        // 예산 0.04 → 수량 0.00008 → 명목가 4
        let result = sizer.size_by_risk(dec!(8), dec!(50000), dec!(1.0));
        assert!(matches!(result, Err(RiskRejection::BelowMinNotional { .. })));
    }

    #[test]
    fn test_leverage_cap_rejected() {
        let sizer = PositionSizer::new(RiskConfig::default());

        // 손절 0.05% → 명목가 = 50 / 0.0005 = 100,000 → 레버리지 10배
        let result = sizer.size_by_risk(dec!(10000), dec!(50000), dec!(0.05));
        assert!(matches!(
            result,
            Err(RiskRejection::LeverageExceeded { max_leverage: 5, .. })
        ));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let sizer = PositionSizer::new(RiskConfig::default());
        assert!(matches!(
            sizer.size_by_risk(dec!(0), dec!(50000), dec!(1)),
            Err(RiskRejection::InvalidInput(_))
        ));
        assert!(matches!(
            sizer.size_by_risk(dec!(10000), dec!(50000), dec!(0)),
            Err(RiskRejection::InvalidInput(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_risk_never_exceeds_budget(
            equity in 1_000u32..1_000_000,
            price in 1u32..100_000,
            stop_bps in 10u32..1_000,
        ) {
            let sizer = PositionSizer::new(RiskConfig {
                max_leverage: 125,
                min_notional: Decimal::ZERO,
                ..Default::default()
            });
            let equity = Decimal::from(equity);
            let stop_pct = Decimal::from(stop_bps) / dec!(100);
            if let Ok(sized) = sizer.size_by_risk(equity, Decimal::from(price), stop_pct) {
                let budget = sizer.risk_budget(equity);
                prop_assert!(sized.risk_amount <= budget);
                // 한 단위를 더하면 예산을 넘어야 함
                let per_unit = Decimal::from(price).pct_of(stop_pct);
                prop_assert!((sized.quantity + dec!(0.001)) * per_unit > budget);
            }
        }
    }
}
