//! 주문 생명주기 엔진 설정.
//!
//! 시그널 필터, DCA 래더, 청산(손절/익절/트레일링), 조정 루프 주기를 정의합니다.
//! 퍼센트 값은 모두 `1.0 = 1%` 표기입니다.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use trader_core::{ConfigValidationError, Percentage};

/// 엔진 전체 설정.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub signal: SignalFilterConfig,
    #[serde(default)]
    pub dca: DcaConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl EngineConfig {
    /// 모든 하위 설정 검증.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.signal.validate()?;
        self.dca.validate()?;
        self.exits.validate()?;
        self.reconcile.validate()
    }
}

// ==================== 시그널 필터 ====================

/// 진입 시그널 필터.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFilterConfig {
    /// 최소 신뢰도 (기본값: 0.8)
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// 최소 ADX (기본값: 25)
    #[serde(default = "default_min_adx")]
    pub min_adx: f64,
    /// 최소 밴드 폭 (기본값: 0, 필터 없음)
    #[serde(default)]
    pub min_bbw: f64,
    /// 같은 방향 재진입 쿨다운 (초, 기본값: 300)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// 반대 방향 전환 금지 구간 (초, 기본값: 60)
    #[serde(default = "default_anti_flip_secs")]
    pub anti_flip_secs: u64,
}

fn default_min_confidence() -> f64 {
    0.8
}
fn default_min_adx() -> f64 {
    25.0
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_anti_flip_secs() -> u64 {
    60
}

impl Default for SignalFilterConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_adx: default_min_adx(),
            min_bbw: 0.0,
            cooldown_secs: default_cooldown_secs(),
            anti_flip_secs: default_anti_flip_secs(),
        }
    }
}

impl SignalFilterConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn anti_flip(&self) -> Duration {
        Duration::seconds(self.anti_flip_secs as i64)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigValidationError::InvalidValue(format!(
                "engine.signal.min_confidence must be within 0-1 (got {})",
                self.min_confidence
            )));
        }
        if self.min_adx < 0.0 {
            return Err(ConfigValidationError::InvalidValue(format!(
                "engine.signal.min_adx cannot be negative (got {})",
                self.min_adx
            )));
        }
        if self.min_bbw < 0.0 {
            return Err(ConfigValidationError::InvalidValue(format!(
                "engine.signal.min_bbw cannot be negative (got {})",
                self.min_bbw
            )));
        }
        Ok(())
    }
}

// ==================== DCA ====================

/// DCA 래더 한 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcaLevel {
    /// 앵커 대비 역행 퍼센트 (음수, 예: -0.6)
    pub level_pct: Percentage,
    /// 기본 수량 대비 배수
    pub multiplier: Decimal,
}

/// DCA 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaConfig {
    /// DCA 사용 여부
    #[serde(default = "default_dca_enabled")]
    pub enabled: bool,
    /// 래더 (`레벨:배수` 쉼표 구분, 기본값: "-0.6:1.0,-1.2:1.5,-2.0:2.0")
    #[serde(default = "default_ladder")]
    pub ladder: String,
    /// 적응형 DCA (추세 필터 적용)
    #[serde(default = "default_true")]
    pub adaptive_dca: bool,
    /// 강한 추세에서 DCA 중지
    #[serde(default = "default_true")]
    pub dca_disable_on_trend: bool,
    /// 추세 판단 ADX 기준 (기본값: 25)
    #[serde(default = "default_dca_trend_adx")]
    pub dca_trend_adx: f64,
}

fn default_dca_enabled() -> bool {
    true
}
fn default_true() -> bool {
    true
}
fn default_ladder() -> String {
    "-0.6:1.0,-1.2:1.5,-2.0:2.0".to_string()
}
fn default_dca_trend_adx() -> f64 {
    25.0
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            enabled: default_dca_enabled(),
            ladder: default_ladder(),
            adaptive_dca: default_true(),
            dca_disable_on_trend: default_true(),
            dca_trend_adx: default_dca_trend_adx(),
        }
    }
}

impl DcaConfig {
    /// 파싱된 래더. 비활성화 상태면 빈 래더입니다.
    pub fn levels(&self) -> Result<Vec<DcaLevel>, ConfigValidationError> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        parse_ladder(&self.ladder)
    }

    /// 이 ADX에서 추세 필터가 DCA를 막는지 확인.
    pub fn suppressed_by_trend(&self, adx: Option<f64>) -> bool {
        self.adaptive_dca
            && self.dca_disable_on_trend
            && adx.is_some_and(|adx| adx > self.dca_trend_adx)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        self.levels().map(|_| ())
    }
}

/// `"-0.6:1.0,-1.2:1.5"` 형식의 래더 파싱.
///
/// 레벨은 음수여야 하며 단계마다 더 깊어져야 합니다.
pub fn parse_ladder(raw: &str) -> Result<Vec<DcaLevel>, ConfigValidationError> {
    let mut levels: Vec<DcaLevel> = Vec::new();

    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (level, multiplier) = item.split_once(':').ok_or_else(|| {
            ConfigValidationError::InvalidValue(format!(
                "engine.dca.ladder entry must be `level:multiplier` (got {})",
                item
            ))
        })?;
        let level_pct = parse_decimal("engine.dca.ladder level", level)?;
        let multiplier = parse_decimal("engine.dca.ladder multiplier", multiplier)?;

        if level_pct >= Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(format!(
                "engine.dca.ladder level must be negative (got {})",
                level_pct
            )));
        }
        if multiplier <= Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(format!(
                "engine.dca.ladder multiplier must be positive (got {})",
                multiplier
            )));
        }
        if let Some(prev) = levels.last() {
            if level_pct >= prev.level_pct {
                return Err(ConfigValidationError::InvalidValue(format!(
                    "engine.dca.ladder levels must get deeper ({} after {})",
                    level_pct, prev.level_pct
                )));
            }
        }
        levels.push(DcaLevel {
            level_pct,
            multiplier,
        });
    }

    Ok(levels)
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ConfigValidationError> {
    Decimal::from_str(raw.trim()).map_err(|_| {
        ConfigValidationError::InvalidValue(format!("{} is not a number (got {})", field, raw))
    })
}

// ==================== 청산 ====================

/// 청산 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitConfig {
    /// 익절 레벨 (평균 진입가 대비 %, 기본값: [0.5, 1.2, 2.0])
    #[serde(default = "default_tp_levels")]
    pub tp_levels: Vec<Percentage>,
    /// 익절 비중 (기본값: [0.4, 0.35, 0.25])
    #[serde(default = "default_tp_shares")]
    pub tp_shares: Vec<Decimal>,
    /// 고정 손절 거리 (기본값: 1.0%)
    #[serde(default = "default_sl_fixed_pct")]
    pub sl_fixed_pct: Percentage,
    /// ATR 손절 배수 (기본값: 1.6)
    #[serde(default = "default_sl_atr_mult")]
    pub sl_atr_mult: Decimal,
    /// 트레일링 ATR 배수 (기본값: 1.0)
    #[serde(default = "default_trail_atr_mult")]
    pub trail_atr_mult: Decimal,
    /// 트레일링 활성화 기준 (R 배수, 기본값: 1.0)
    #[serde(default = "default_be_trigger_r")]
    pub be_trigger_r: Decimal,
    /// 교체 기준 목표가 차이 (비율, 기본값: 0.0025)
    #[serde(default = "default_replace_epsilon")]
    pub replace_epsilon: Decimal,
    /// 교체 쿨다운 (초, 기본값: 20)
    #[serde(default = "default_replace_cooldown_secs")]
    pub replace_cooldown_secs: u64,
    /// 최소 익절 주문 명목가 (기본값: 5)
    #[serde(default = "default_min_tp_notional")]
    pub min_tp_notional: Decimal,
}

fn default_tp_levels() -> Vec<Percentage> {
    vec![dec!(0.5), dec!(1.2), dec!(2.0)]
}
fn default_tp_shares() -> Vec<Decimal> {
    vec![dec!(0.4), dec!(0.35), dec!(0.25)]
}
fn default_sl_fixed_pct() -> Percentage {
    dec!(1.0)
}
fn default_sl_atr_mult() -> Decimal {
    dec!(1.6)
}
fn default_trail_atr_mult() -> Decimal {
    dec!(1.0)
}
fn default_be_trigger_r() -> Decimal {
    dec!(1.0)
}
fn default_replace_epsilon() -> Decimal {
    dec!(0.0025)
}
fn default_replace_cooldown_secs() -> u64 {
    20
}
fn default_min_tp_notional() -> Decimal {
    dec!(5)
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            tp_levels: default_tp_levels(),
            tp_shares: default_tp_shares(),
            sl_fixed_pct: default_sl_fixed_pct(),
            sl_atr_mult: default_sl_atr_mult(),
            trail_atr_mult: default_trail_atr_mult(),
            be_trigger_r: default_be_trigger_r(),
            replace_epsilon: default_replace_epsilon(),
            replace_cooldown_secs: default_replace_cooldown_secs(),
            min_tp_notional: default_min_tp_notional(),
        }
    }
}

impl ExitConfig {
    pub fn replace_cooldown(&self) -> Duration {
        Duration::seconds(self.replace_cooldown_secs as i64)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.tp_levels.len() != self.tp_shares.len() {
            return Err(ConfigValidationError::InvalidValue(format!(
                "engine.exits.tp_levels ({}) and tp_shares ({}) must have the same length",
                self.tp_levels.len(),
                self.tp_shares.len()
            )));
        }
        if self.tp_levels.iter().any(|l| *l <= Decimal::ZERO) {
            return Err(ConfigValidationError::InvalidValue(
                "engine.exits.tp_levels must be positive".to_string(),
            ));
        }
        if self.tp_levels.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigValidationError::InvalidValue(
                "engine.exits.tp_levels must be increasing".to_string(),
            ));
        }
        if self.tp_shares.iter().any(|s| *s <= Decimal::ZERO) {
            return Err(ConfigValidationError::InvalidValue(
                "engine.exits.tp_shares must be positive".to_string(),
            ));
        }
        let total: Decimal = self.tp_shares.iter().sum();
        if total > Decimal::ONE {
            return Err(ConfigValidationError::InvalidValue(format!(
                "engine.exits.tp_shares must sum to at most 1 (got {})",
                total
            )));
        }
        if self.sl_fixed_pct <= Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(
                "engine.exits.sl_fixed_pct must be positive".to_string(),
            ));
        }
        if self.sl_atr_mult < Decimal::ZERO || self.trail_atr_mult < Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(
                "engine.exits ATR multipliers cannot be negative".to_string(),
            ));
        }
        if self.be_trigger_r < Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(
                "engine.exits.be_trigger_r cannot be negative".to_string(),
            ));
        }
        if self.replace_epsilon < Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(
                "engine.exits.replace_epsilon cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== 조정 루프 ====================

/// 조정 루프 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// 실행 주기 (초, 기본값: 12)
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// 로컬/원격 수량 허용 오차 (기본값: 0.000001)
    #[serde(default = "default_quantity_tolerance")]
    pub quantity_tolerance: Decimal,
    /// 로컬에 없는 원격 포지션 채택 여부
    #[serde(default = "default_true")]
    pub adopt_unknown: bool,
}

fn default_reconcile_interval_secs() -> u64 {
    12
}
fn default_quantity_tolerance() -> Decimal {
    dec!(0.000001)
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            quantity_tolerance: default_quantity_tolerance(),
            adopt_unknown: default_true(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs as i64)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "engine.reconcile.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.quantity_tolerance < Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(
                "engine.reconcile.quantity_tolerance cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder_parses() {
        let levels = DcaConfig::default().levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].level_pct, dec!(-0.6));
        assert_eq!(levels[2].multiplier, dec!(2.0));
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ladder_must_get_deeper() {
        assert!(parse_ladder("-1.0:1,-0.5:1").is_err());
        assert!(parse_ladder("-1.0:1,-1.0:1").is_err());
        assert!(parse_ladder("0.5:1").is_err());
        assert!(parse_ladder("-0.5:0").is_err());
        assert!(parse_ladder("-0.5").is_err());
        assert!(parse_ladder("abc:1").is_err());
    }

    #[test]
    fn test_disabled_dca_has_empty_ladder() {
        let config = DcaConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(config.levels().unwrap().is_empty());
    }

    #[test]
    fn test_trend_suppression() {
        let config = DcaConfig::default();
        assert!(config.suppressed_by_trend(Some(30.0)));
        assert!(!config.suppressed_by_trend(Some(25.0)));
        assert!(!config.suppressed_by_trend(None));

        // 적응형 DCA가 꺼져 있으면 추세와 무관
        let plain = DcaConfig {
            adaptive_dca: false,
            ..Default::default()
        };
        assert!(!plain.suppressed_by_trend(Some(60.0)));
    }

    #[test]
    fn test_exit_validation() {
        let mut config = ExitConfig::default();
        config.tp_shares = vec![dec!(0.5), dec!(0.5), dec!(0.5)];
        assert!(config.validate().is_err());

        let mut config = ExitConfig::default();
        config.tp_levels = vec![dec!(1.0), dec!(0.5), dec!(2.0)];
        assert!(config.validate().is_err());

        let mut config = ExitConfig::default();
        config.tp_levels.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_like_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"signal": {"min_adx": 20.0}, "reconcile": {"interval_secs": 5}}"#)
                .unwrap();
        assert_eq!(config.signal.min_adx, 20.0);
        assert_eq!(config.signal.cooldown_secs, 300);
        assert_eq!(config.reconcile.interval(), Duration::seconds(5));
        assert_eq!(config.exits.replace_cooldown(), Duration::seconds(20));
    }
}
