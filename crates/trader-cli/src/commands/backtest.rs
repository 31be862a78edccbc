//! 백테스트 명령어.
//!
//! JSON lines 재생 파일(틱/시그널)을 시뮬레이션 거래소로 재생합니다.
//!
//! # 사용 예시
//!
//! ```bash
//! trader backtest -c config/default.toml -r demos/replay.jsonl --out-dir out/run-1
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use std::io::BufRead;
use std::path::Path;
use tracing::info;

use trader_core::{PersistenceConfig, ReplayEvent};
use trader_execution::{OrderLifecycleEngine, Persistence, RunSummary, Runner, SimulatedAdapter};
use trader_risk::RiskManager;

use crate::config::AppConfig;

/// 재생 파일 읽기. 빈 줄은 건너뜁니다.
pub fn read_replay(path: &Path) -> Result<Vec<ReplayEvent>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open replay file {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: ReplayEvent = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid replay event", path.display(), index + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// 백테스트 실행.
pub async fn run_backtest(config: &AppConfig, replay: &Path, out_dir: Option<&Path>) -> Result<RunSummary> {
    let events = read_replay(replay)?;
    let start = events
        .iter()
        .map(ReplayEvent::timestamp)
        .min()
        .unwrap_or_else(Utc::now);

    let persistence = match out_dir {
        Some(dir) => {
            let paths = config.persistence.rooted_at(dir);
            clear_previous_run(&paths)?;
            Persistence::open(&paths)?
        }
        None => None,
    };

    let equity = config.simulation.initial_equity;
    let adapter = SimulatedAdapter::backtest(config.simulation.clone(), start);
    let risk = RiskManager::new(config.risk.clone(), equity, start.date_naive());
    let engine = OrderLifecycleEngine::new(config.engine.clone(), risk, adapter, &config.symbols)?;

    info!(
        replay = %replay.display(),
        events = events.len(),
        symbols = ?config.symbols,
        initial_equity = %equity,
        "Running backtest"
    );

    let mut runner = Runner::new(engine, persistence);
    runner.start().await?;
    Ok(runner.run_backtest(events).await?)
}

/// 같은 출력 디렉터리의 이전 결과 제거. 거래 로그는 추가 모드이므로 재실행 시 필요합니다.
fn clear_previous_run(paths: &PersistenceConfig) -> Result<()> {
    for path in [&paths.trades_path, &paths.equity_path, &paths.state_path] {
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "Removed previous backtest output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", path.display()));
            }
        }
    }
    Ok(())
}

/// 요약 출력.
pub fn print_summary(summary: &RunSummary) {
    println!("\n📊 백테스트 결과");
    println!("═══════════════════════════════════════");
    println!("{}", summary);
    println!("═══════════════════════════════════════");
}
