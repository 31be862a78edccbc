//! 애플리케이션 설정.
//!
//! 기본값 → TOML 파일 → `TRADER__` 환경 변수 순으로 계층 로드합니다.
//!
//! ```bash
//! TRADER__MODE=paper TRADER__RISK__MAX_LEVERAGE=3 trader paper --config config/default.toml
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use trader_core::{load_layered, ConfigValidationError, ExecutionMode, LoggingConfig, PersistenceConfig};
use trader_exchange::{GatewayConfig, SimulatedConfig};
use trader_execution::EngineConfig;
use trader_risk::RiskConfig;

/// 전체 애플리케이션 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 실행 모드 (live, paper, backtest)
    #[serde(default)]
    pub mode: ExecutionMode,
    /// 거래 심볼
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// 모의투자/백테스트 시뮬레이션
    #[serde(default)]
    pub simulation: SimulatedConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            symbols: default_symbols(),
            logging: LoggingConfig::default(),
            risk: RiskConfig::default(),
            gateway: GatewayConfig::default(),
            engine: EngineConfig::default(),
            simulation: SimulatedConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl AppConfig {
    /// 설정 로드 후 검증.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigValidationError> {
        let mut config: Self = load_layered(path)?;
        for symbol in &mut config.symbols {
            *symbol = symbol.trim().to_uppercase();
        }
        config.validate()?;
        Ok(config)
    }

    /// 모든 섹션 검증.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.symbols.is_empty() || self.symbols.iter().any(|s| s.is_empty()) {
            return Err(ConfigValidationError::MissingField("symbols".to_string()));
        }
        if self.simulation.initial_equity <= rust_decimal::Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue(format!(
                "simulation.initial_equity must be positive (got {})",
                self.simulation.initial_equity
            )));
        }
        self.risk.validate()?;
        self.gateway.validate()?;
        self.engine.validate()
    }
}
