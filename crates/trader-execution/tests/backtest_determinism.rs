//! 같은 재생 입력은 바이트 단위로 같은 거래 로그를 만들어야 합니다.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use trader_core::{Direction, PersistenceConfig, ReplayEvent, Signal, Tick};
use trader_exchange::SimulatedConfig;
use trader_execution::{
    EngineConfig, OrderLifecycleEngine, Persistence, RunSummary, Runner, SimulatedAdapter, TradeLog,
};
use trader_risk::{RiskConfig, RiskManager};

const BTC: &str = "BTCUSDT";

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

/// 삼각파 가격 경로 + 10분마다 번갈아 나오는 시그널.
fn replay() -> Vec<ReplayEvent> {
    let mut events = Vec::new();
    for i in 0..2_000i64 {
        let phase = i % 240;
        let wave = if phase < 120 { phase } else { 240 - phase };
        let jitter = (i * 7_919) % 13 - 6;
        let price = Decimal::from(49_400 + wave * 10 + jitter);
        let at = start() + Duration::seconds(i * 5);
        events.push(ReplayEvent::Tick(Tick::new(BTC, price, at)));

        if i > 0 && i % 120 == 0 {
            let direction = if (i / 120) % 2 == 0 { Direction::Long } else { Direction::Short };
            let adx = if (i / 120) % 3 == 0 { 40.0 } else { 25.0 };
            events.push(ReplayEvent::Signal(Signal::new(BTC, direction, 0.9, adx, at)));
        }
    }
    // 정렬 전 순서가 섞여 있어도 결과는 같아야 함
    events.reverse();
    events
}

async fn run(dir: &Path) -> (RunSummary, PersistenceConfig) {
    let paths = PersistenceConfig::default().rooted_at(dir);
    let adapter = SimulatedAdapter::backtest(
        SimulatedConfig::default().with_initial_equity(dec!(10000)),
        start(),
    );
    let risk = RiskManager::new(RiskConfig::default(), dec!(10000), start().date_naive());
    let engine =
        OrderLifecycleEngine::new(EngineConfig::default(), risk, adapter, &[BTC.to_string()]).unwrap();

    let mut runner = Runner::new(engine, Persistence::open(&paths).unwrap());
    runner.start().await.unwrap();
    let summary = runner.run_backtest(replay()).await.unwrap();
    (summary, paths)
}

#[tokio::test]
async fn test_replays_produce_identical_trade_logs() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();

    let (first, first_paths) = run(first_dir.path()).await;
    let (second, second_paths) = run(second_dir.path()).await;

    assert!(first.trades > 0);
    assert_eq!(first, second);

    let first_log = std::fs::read(&first_paths.trades_path).unwrap();
    let second_log = std::fs::read(&second_paths.trades_path).unwrap();
    assert!(!first_log.is_empty());
    assert_eq!(first_log, second_log);

    let first_equity = std::fs::read(&first_paths.equity_path).unwrap();
    let second_equity = std::fs::read(&second_paths.equity_path).unwrap();
    assert_eq!(first_equity, second_equity);
}

#[tokio::test]
async fn test_replayed_trades_respect_ladder_and_fees() {
    let dir = tempfile::tempdir().unwrap();
    let (summary, paths) = run(dir.path()).await;

    let trades = TradeLog::read_all(&paths.trades_path).unwrap();
    assert_eq!(trades.len(), summary.trades);
    assert_eq!(summary.open_positions, 0);
    for trade in &trades {
        assert!(trade.quantity > Decimal::ZERO);
        assert!(trade.dca_count <= 3);
        // 기본 설정은 수수료가 있음
        assert!(trade.fees > Decimal::ZERO);
        assert!(trade.closed_at >= trade.opened_at);
    }
    let net: Decimal = trades.iter().map(|t| t.realized_pnl).sum();
    assert_eq!(net, summary.net_pnl);
}
