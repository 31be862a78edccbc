//! 정밀한 금융 계산을 위한 Decimal 유틸리티.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// 금융 정밀도를 위한 가격 타입.
pub type Price = Decimal;

/// 주문 수량을 위한 타입.
pub type Quantity = Decimal;

/// 퍼센트 타입 (1.0 = 1%).
pub type Percentage = Decimal;

/// Decimal 연산을 위한 확장 트레이트.
pub trait DecimalExt {
    /// 수량 단위로 내림합니다. 단위가 0 이하이면 그대로 반환합니다.
    fn floor_to_step(&self, step: Decimal) -> Decimal;

    /// 퍼센트 값(1.0 = 1%)만큼의 비율을 곱합니다.
    fn pct_of(&self, pct: Percentage) -> Decimal;

    /// 기준값 대비 상대 차이 |self - base| / base.
    fn relative_diff(&self, base: Decimal) -> Decimal;

    /// 로그/지표용 f64 변환.
    fn to_f64_lossy(&self) -> f64;
}

impl DecimalExt for Decimal {
    fn floor_to_step(&self, step: Decimal) -> Decimal {
        if step <= Decimal::ZERO {
            return *self;
        }
        (*self / step).floor() * step
    }

    fn pct_of(&self, pct: Percentage) -> Decimal {
        *self * pct / Decimal::ONE_HUNDRED
    }

    fn relative_diff(&self, base: Decimal) -> Decimal {
        if base.is_zero() {
            return if self.is_zero() { Decimal::ZERO } else { Decimal::ONE };
        }
        ((*self - base) / base).abs()
    }

    fn to_f64_lossy(&self) -> f64 {
        self.to_f64().unwrap_or(0.0)
    }
}
