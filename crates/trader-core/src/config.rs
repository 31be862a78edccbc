//! 설정 관리.
//!
//! 설정은 프로세스 시작 시 한 번 로드/검증되어 각 컴포넌트 생성자에
//! 참조로 전달됩니다. 전역 설정 조회는 없습니다.
//!
//! 로딩 순서: 기본값 → TOML 파일 → `TRADER__SECTION__KEY` 환경 변수.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 환경 변수 오버라이드 접두어.
pub const ENV_PREFIX: &str = "TRADER";

/// 실행 모드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// 실거래
    Live,
    /// 모의투자 (실시간 시세, 시뮬레이션 체결)
    #[default]
    Paper,
    /// 과거 데이터 재생
    Backtest,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Live => write!(f, "live"),
            ExecutionMode::Paper => write!(f, "paper"),
            ExecutionMode::Backtest => write!(f, "backtest"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "paper" => Ok(Self::Paper),
            "backtest" => Ok(Self::Backtest),
            other => Err(ConfigValidationError::InvalidValue(format!(
                "mode must be one of: paper, live, backtest (got {})",
                other
            ))),
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// 파일명/줄 번호 출력
    #[serde(default)]
    pub with_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            with_file: false,
        }
    }
}

/// 영속화 경로 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// 영속화 활성화 여부
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 거래 로그 (JSON lines, append-only)
    #[serde(default = "default_trades_path")]
    pub trades_path: PathBuf,
    /// 자산 시계열 (CSV)
    #[serde(default = "default_equity_path")]
    pub equity_path: PathBuf,
    /// 크래시 복구 스냅샷 (JSON)
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

fn default_true() -> bool {
    true
}
fn default_trades_path() -> PathBuf {
    PathBuf::from("data/trades.jsonl")
}
fn default_equity_path() -> PathBuf {
    PathBuf::from("data/equity.csv")
}
fn default_state_path() -> PathBuf {
    PathBuf::from("data/state.json")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trades_path: default_trades_path(),
            equity_path: default_equity_path(),
            state_path: default_state_path(),
        }
    }
}

impl PersistenceConfig {
    /// 모든 경로를 주어진 디렉토리 아래로 옮긴 설정.
    pub fn rooted_at(&self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let file_name = |p: &Path| dir.join(p.file_name().unwrap_or(p.as_os_str()));
        Self {
            enabled: self.enabled,
            trades_path: file_name(&self.trades_path),
            equity_path: file_name(&self.equity_path),
            state_path: file_name(&self.state_path),
        }
    }
}

/// 설정 검증 오류.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl From<config::ConfigError> for ConfigValidationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigValidationError::Load(err.to_string())
    }
}

/// 계층형 설정 로드.
///
/// 파일이 없으면 기본값과 환경 변수만 사용합니다.
pub fn load_layered<T: DeserializeOwned>(
    path: Option<&Path>,
) -> Result<T, ConfigValidationError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("LIVE".parse::<ExecutionMode>().unwrap(), ExecutionMode::Live);
        assert_eq!(
            "backtest".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Backtest
        );
        assert!("replay".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_persistence_rooted_at() {
        let config = PersistenceConfig::default().rooted_at("/tmp/run-1");
        assert_eq!(config.trades_path, PathBuf::from("/tmp/run-1/trades.jsonl"));
        assert_eq!(config.state_path, PathBuf::from("/tmp/run-1/state.json"));
    }

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_load_layered_without_file_uses_defaults() {
        let sample: Sample = load_layered(None).unwrap();
        assert_eq!(sample.logging.format, "pretty");
    }
}
