//! 외부 시그널 생성기가 방출하는 방향성 시그널.
//!
//! 지표/모델 계산은 이 워크스페이스 밖에서 이루어지며, 엔진은 완성된
//! [`Signal`] 값만 소비합니다. 방출된 시그널은 변경되지 않습니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Side;
use crate::types::Price;

/// 시그널 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 매수 포지션
    Long,
    /// 매도 포지션
    Short,
    /// 관망
    Flat,
}

impl Direction {
    /// 진입 주문 방향. Flat이면 None.
    pub fn entry_side(&self) -> Option<Side> {
        match self {
            Direction::Long => Some(Side::Buy),
            Direction::Short => Some(Side::Sell),
            Direction::Flat => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
            Direction::Flat => write!(f, "flat"),
        }
    }
}

/// 트레이딩 시그널.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// 거래 심볼 (예: "BTCUSDT")
    pub symbol: String,
    /// 방향
    pub direction: Direction,
    /// 신뢰도 (0.0 ~ 1.0)
    pub confidence: f64,
    /// 추세 강도 (ADX)
    pub adx: f64,
    /// 볼린저 밴드 폭 (BBW)
    #[serde(default)]
    pub bbw: f64,
    /// 방출 시각
    pub timestamp: DateTime<Utc>,
    /// 생성기가 본 참조 가격 (사이징은 마지막 틱 가격 기준)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    /// ATR (ATR 기반 손절/트레일링 거리용)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<Price>,
}

impl Signal {
    /// 새 시그널 생성. 신뢰도는 [0, 1]로 제한됩니다.
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        confidence: f64,
        adx: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            adx,
            bbw: 0.0,
            timestamp,
            price: None,
            atr: None,
        }
    }

    /// 참조 가격 설정.
    pub fn with_price(mut self, price: Price) -> Self {
        self.price = Some(price);
        self
    }

    /// ATR 설정.
    pub fn with_atr(mut self, atr: Price) -> Self {
        self.atr = Some(atr);
        self
    }

    /// 밴드 폭 설정.
    pub fn with_bbw(mut self, bbw: f64) -> Self {
        self.bbw = bbw;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        let signal = Signal::new("BTCUSDT", Direction::Long, 1.7, 30.0, Utc::now());
        assert_eq!(signal.confidence, 1.0);
    }

    #[test]
    fn test_direction_entry_side() {
        assert_eq!(Direction::Long.entry_side(), Some(Side::Buy));
        assert_eq!(Direction::Short.entry_side(), Some(Side::Sell));
        assert_eq!(Direction::Flat.entry_side(), None);
    }
}
