//! 거래 로그, 자산 시계열, 크래시 복구 스냅샷.
//!
//! - 거래 로그: JSON lines, append-only, 쓰기마다 flush
//! - 자산 시계열: CSV (`timestamp,equity,realized_daily_pnl,open_positions`)
//! - 복구 스냅샷: JSON, 임시 파일에 쓴 뒤 rename으로 교체

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use trader_core::{AccountState, ErrorClass, PersistenceConfig, Position, Trade};

/// 영속화 에러.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// 에러 분류. 디스크 에러는 다음 쓰기에서 재시도합니다.
    pub fn class(&self) -> ErrorClass {
        match self {
            PersistenceError::Io { .. } => ErrorClass::Transient,
            PersistenceError::Serialization(_) => ErrorClass::Fatal,
            PersistenceError::Csv(e) if e.is_io_error() => ErrorClass::Transient,
            PersistenceError::Csv(_) => ErrorClass::Fatal,
        }
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

fn ensure_parent(path: &Path) -> PersistenceResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))
        }
        _ => Ok(()),
    }
}

fn open_append(path: &Path) -> PersistenceResult<File> {
    ensure_parent(path)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistenceError::io(path, e))
}

// ==================== 거래 로그 ====================

/// append-only 거래 로그.
#[derive(Debug)]
pub struct TradeLog {
    path: PathBuf,
    file: File,
}

impl TradeLog {
    pub fn open(path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self { path, file })
    }

    /// 거래 한 건 추가.
    pub fn append(&mut self, trade: &Trade) -> PersistenceResult<()> {
        let line = serde_json::to_string(trade)?;
        writeln!(self.file, "{}", line).map_err(|e| PersistenceError::io(&self.path, e))?;
        self.file.flush().map_err(|e| PersistenceError::io(&self.path, e))?;
        debug!(position_id = %trade.position_id, path = %self.path.display(), "Trade logged");
        Ok(())
    }

    /// 로그 파일의 모든 거래 읽기. 파일이 없으면 빈 목록입니다.
    pub fn read_all(path: impl AsRef<Path>) -> PersistenceResult<Vec<Trade>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(|e| PersistenceError::io(path, e))?;
        let mut trades = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| PersistenceError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            trades.push(serde_json::from_str(&line)?);
        }
        Ok(trades)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ==================== 자산 시계열 ====================

/// 자산 CSV 한 행. 필드 순서가 곧 헤더 순서입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub realized_daily_pnl: Decimal,
    pub open_positions: usize,
}

/// 자산 시계열 CSV.
#[derive(Debug)]
pub struct EquityLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl EquityLog {
    /// 파일을 엽니다. 헤더는 빈 파일에만 씁니다.
    pub fn open(path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let is_empty = file
            .metadata()
            .map_err(|e| PersistenceError::io(&path, e))?
            .len()
            == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(is_empty)
            .from_writer(file);
        Ok(Self { path, writer })
    }

    pub fn append(&mut self, point: &EquityPoint) -> PersistenceResult<()> {
        self.writer.serialize(point)?;
        self.writer
            .flush()
            .map_err(|e| PersistenceError::io(&self.path, e))
    }

    /// 저장된 자산 시계열 전체 읽기.
    pub fn read_all(path: impl AsRef<Path>) -> PersistenceResult<Vec<EquityPoint>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let points = reader.deserialize().collect::<Result<Vec<EquityPoint>, _>>()?;
        Ok(points)
    }
}

// ==================== 복구 스냅샷 ====================

/// 크래시 복구 스냅샷.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    /// 저장 시각
    pub saved_at: DateTime<Utc>,
    /// 마지막으로 사용한 클라이언트 주문 nonce
    pub nonce: u64,
    /// 포지션 ID 시퀀스
    #[serde(default)]
    pub position_seq: u64,
    /// 계좌 상태 (일일 손실 플래그 포함)
    #[serde(default)]
    pub account: Option<AccountState>,
    /// 열린 포지션
    pub positions: Vec<Position>,
}

/// 원자적 교체 방식의 복구 스냅샷 저장소.
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    path: PathBuf,
}

impl RecoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 스냅샷 저장. 임시 파일에 쓴 뒤 rename합니다.
    pub fn save(&self, snapshot: &RecoverySnapshot) -> PersistenceResult<()> {
        ensure_parent(&self.path)?;
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)?;
        {
            let mut file = File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
            file.write_all(&body).map_err(|e| PersistenceError::io(&tmp, e))?;
            file.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        debug!(
            positions = snapshot.positions.len(),
            nonce = snapshot.nonce,
            "Recovery snapshot saved"
        );
        Ok(())
    }

    /// 저장된 스냅샷 로드. 없으면 None.
    pub fn load(&self) -> PersistenceResult<Option<RecoverySnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let body = fs::read(&self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        let snapshot: RecoverySnapshot = serde_json::from_slice(&body)?;
        info!(
            path = %self.path.display(),
            positions = snapshot.positions.len(),
            saved_at = %snapshot.saved_at,
            "Recovery snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ==================== 묶음 ====================

/// 러너가 사용하는 영속화 묶음.
#[derive(Debug)]
pub struct Persistence {
    pub trades: TradeLog,
    pub equity: EquityLog,
    pub recovery: RecoveryStore,
}

impl Persistence {
    /// 설정에 따라 열기. 비활성화되어 있으면 None.
    pub fn open(config: &PersistenceConfig) -> PersistenceResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Ok(Some(Self {
            trades: TradeLog::open(&config.trades_path)?,
            equity: EquityLog::open(&config.equity_path)?,
            recovery: RecoveryStore::new(&config.state_path),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;
    use trader_core::{ExitReason, Side};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn closed_trade(id: &str) -> Trade {
        let mut position = Position::open(id, "BTCUSDT", Side::Buy, dec!(0.1), dec!(50000), 5, at(0));
        position.reduce(dec!(0.1), dec!(50500), at(5)).unwrap();
        position.fees = dec!(4);
        Trade::from_position(&position, ExitReason::TakeProfit, at(5))
    }

    #[test]
    fn test_trade_log_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trades.jsonl");

        let mut log = TradeLog::open(&path).unwrap();
        log.append(&closed_trade("BTCUSDT-1")).unwrap();
        log.append(&closed_trade("BTCUSDT-2")).unwrap();

        // 다시 열어도 이어서 기록
        let mut log = TradeLog::open(&path).unwrap();
        log.append(&closed_trade("BTCUSDT-3")).unwrap();

        let trades = TradeLog::read_all(&path).unwrap();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[2].position_id, "BTCUSDT-3");
        assert_eq!(trades[0].realized_pnl, dec!(46));
    }

    #[test]
    fn test_equity_log_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equity.csv");
        let point = EquityPoint {
            timestamp: at(1),
            equity: dec!(1000.5),
            realized_daily_pnl: dec!(-2),
            open_positions: 1,
        };

        EquityLog::open(&path).unwrap().append(&point).unwrap();
        EquityLog::open(&path).unwrap().append(&point).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,equity,realized_daily_pnl,open_positions");
        assert_eq!(lines[1], "2024-01-01T00:01:00Z,1000.5,-2,1");

        let points = EquityLog::read_all(&path).unwrap();
        assert_eq!(points, vec![point.clone(), point]);
    }

    #[test]
    fn test_recovery_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());

        let snapshot = RecoverySnapshot {
            saved_at: at(3),
            nonce: 42,
            position_seq: 7,
            account: Some(AccountState::new(dec!(1000), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())),
            positions: vec![Position::open("ETHUSDT-7", "ETHUSDT", Side::Sell, dec!(1), dec!(2000), 5, at(2))],
        };
        store.save(&snapshot).unwrap();
        store.save(&snapshot).unwrap();

        assert_eq!(store.load().unwrap(), Some(snapshot));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_snapshot_without_optional_fields() {
        let json = r#"{"saved_at":"2024-01-01T00:00:00Z","nonce":3,"positions":[]}"#;
        let snapshot: RecoverySnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.position_seq, 0);
        assert!(snapshot.account.is_none());
    }

    #[test]
    fn test_disabled_persistence_opens_nothing() {
        let config = PersistenceConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(Persistence::open(&config).unwrap().is_none());
    }
}
