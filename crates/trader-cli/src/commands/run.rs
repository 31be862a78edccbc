//! 모의투자 / 실거래 명령어.
//!
//! 시장 데이터는 거래소 WebSocket에서, 시그널은 표준 입력(JSON lines)에서 받습니다.
//! Ctrl-C로 종료하면 진행 중인 작업을 마친 뒤 복구 스냅샷을 저장합니다.
//!
//! # 사용 예시
//!
//! ```bash
//! signal-generator | trader paper -c config/default.toml
//! BINANCE_API_KEY=... BINANCE_API_SECRET=... trader live -c config/live.toml
//! ```

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use trader_core::{ExecutionMode, MarketUpdate, Signal, SystemClock};
use trader_exchange::{Credentials, ExchangeGateway, MarketDataStream};
use trader_execution::{
    ExecutionAdapter, LiveAdapter, OrderLifecycleEngine, Persistence, RunSummary, Runner,
    SimulatedAdapter,
};
use trader_risk::RiskManager;

use crate::config::AppConfig;

/// 시그널 채널 용량.
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// 모의투자 또는 실거래 실행.
pub async fn run_trading(config: &AppConfig, mode: ExecutionMode) -> Result<RunSummary> {
    match mode {
        ExecutionMode::Paper => {
            let adapter = SimulatedAdapter::paper(config.simulation.clone());
            drive(config, adapter, config.simulation.initial_equity).await
        }
        ExecutionMode::Live => {
            let credentials = Credentials::from_env()
                .context("live mode requires BINANCE_API_KEY and BINANCE_API_SECRET")?;
            let clock = Arc::new(SystemClock);
            let gateway = ExchangeGateway::http(config.gateway.clone(), credentials, clock.clone())?;
            let mut adapter = LiveAdapter::new(gateway, clock);
            adapter
                .connect(&config.symbols, config.risk.max_leverage)
                .await?;
            let equity = adapter.fetch_equity().await?;
            drive(config, adapter, equity).await
        }
        ExecutionMode::Backtest => bail!("backtest mode needs a replay file, use `trader backtest`"),
    }
}

async fn drive<A: ExecutionAdapter>(config: &AppConfig, adapter: A, equity: Decimal) -> Result<RunSummary> {
    let today = adapter.now().date_naive();
    let risk = RiskManager::new(config.risk.clone(), equity, today);
    let engine = OrderLifecycleEngine::new(config.engine.clone(), risk, adapter, &config.symbols)?;
    let persistence = Persistence::open(&config.persistence)?;

    info!(
        mode = %engine.mode(),
        symbols = ?config.symbols,
        equity = %equity,
        persistence = persistence.is_some(),
        "Starting trading loop"
    );

    let mut runner = Runner::new(engine, persistence);
    runner.start().await?;

    let market_rx = spawn_market_feed(config);
    let signal_rx = spawn_signal_reader();
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    Ok(runner.run_live(market_rx, signal_rx, shutdown).await?)
}

/// 거래소 시장 데이터 스트림을 채널로 전달.
fn spawn_market_feed(config: &AppConfig) -> mpsc::Receiver<MarketUpdate> {
    let market_data = config.gateway.market_data.clone();
    let (tx, rx) = mpsc::channel(market_data.channel_capacity);
    let mut stream = MarketDataStream::new(
        config.gateway.ws_base_url.clone(),
        config.symbols.clone(),
        market_data,
    );
    tokio::spawn(async move {
        while let Some(update) = stream.next().await {
            if tx.send(update).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// 표준 입력의 JSON lines 시그널을 채널로 전달. 잘못된 줄은 경고 후 건너뜁니다.
fn spawn_signal_reader() -> mpsc::Receiver<Signal> {
    let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Signal>(&line) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %line, "Invalid signal line"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read signals from stdin");
                    break;
                }
            }
        }
    });
    rx
}
