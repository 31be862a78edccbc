//! 스케줄러.
//!
//! 심볼 집합당 하나의 협력형 루프가 시장 데이터, 시그널, 조정 주기, 거래일 경계,
//! 종료 신호를 `tokio::select!`로 다중화합니다. 엔진 상태 변경은 이 루프에서만 일어납니다.
//!
//! 백테스트는 재생 이벤트를 타임스탬프 순(안정 정렬)으로 대기 없이 처리하므로
//! 같은 입력에 대해 항상 같은 거래 로그를 만듭니다.

use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use trader_core::{ExecutionMode, MarketUpdate, ReplayEvent, Signal, Trade, TradeStats};

use crate::engine::{EngineResult, OrderLifecycleEngine};
use crate::mode::ExecutionAdapter;
use crate::persistence::{EquityPoint, Persistence};
use crate::reconcile::ReconciliationLoop;

/// 실행 결과 요약.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub mode: ExecutionMode,
    pub events: usize,
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub net_pnl: Decimal,
    pub fees: Decimal,
    pub final_equity: Decimal,
    pub open_positions: usize,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "mode:           {}", self.mode)?;
        writeln!(f, "events:         {}", self.events)?;
        writeln!(f, "trades:         {} ({} wins, {:.1}%)", self.trades, self.wins, self.win_rate)?;
        writeln!(f, "net pnl:        {}", self.net_pnl)?;
        writeln!(f, "fees:           {}", self.fees)?;
        writeln!(f, "final equity:   {}", self.final_equity)?;
        write!(f, "open positions: {}", self.open_positions)
    }
}

/// 엔진, 조정 루프, 영속화를 묶는 실행기.
pub struct Runner<A: ExecutionAdapter> {
    engine: OrderLifecycleEngine<A>,
    reconciler: ReconciliationLoop,
    persistence: Option<Persistence>,
    trades: Vec<Trade>,
    events: usize,
}

impl<A: ExecutionAdapter> Runner<A> {
    pub fn new(engine: OrderLifecycleEngine<A>, persistence: Option<Persistence>) -> Self {
        let reconciler = ReconciliationLoop::new(engine.config().reconcile.clone());
        Self {
            engine,
            reconciler,
            persistence,
            trades: Vec::new(),
            events: 0,
        }
    }

    pub fn engine(&self) -> &OrderLifecycleEngine<A> {
        &self.engine
    }

    /// 이번 실행에서 종료된 거래.
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// 시작 처리: 복구 스냅샷 적용 후 즉시 조정 1회.
    pub async fn start(&mut self) -> EngineResult<()> {
        let snapshot = match &self.persistence {
            Some(persistence) => persistence.recovery.load()?,
            None => None,
        };
        if let Some(snapshot) = snapshot {
            self.engine.restore(snapshot)?;
        }
        let report = self.reconciler.run_once(&mut self.engine).await?;
        info!(
            mode = %self.engine.mode(),
            symbols = report.symbols_checked,
            drift = report.drift_count(),
            equity = %self.engine.risk().equity(),
            "Runner started"
        );
        self.persist(true)
    }

    /// 라이브/모의투자 루프. `shutdown`이 완료되면 진행 중인 작업을 마치고 반환합니다.
    pub async fn run_live<F>(
        &mut self,
        mut market_rx: mpsc::Receiver<MarketUpdate>,
        mut signal_rx: mpsc::Receiver<Signal>,
        shutdown: F,
    ) -> EngineResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let period = self.reconciler.config().interval().to_std().unwrap_or_default();
        let mut reconcile_timer = tokio::time::interval(period);
        reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 시작 시 조정은 이미 수행됨
        reconcile_timer.tick().await;
        let mut signals_open = true;

        loop {
            let until_rollover = self
                .engine
                .until_next_rollover()
                .to_std()
                .unwrap_or_default();

            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                update = market_rx.recv() => {
                    let Some(update) = update else {
                        warn!("Market data channel closed");
                        break;
                    };
                    self.events += 1;
                    self.engine.on_market_update(update).await?;
                    self.persist(false)?;
                }
                signal = signal_rx.recv(), if signals_open => {
                    match signal {
                        Some(signal) => {
                            self.events += 1;
                            let decision = self.engine.on_signal(signal).await?;
                            debug!(decision = ?decision, "Signal processed");
                            self.persist(false)?;
                        }
                        None => {
                            info!("Signal channel closed");
                            signals_open = false;
                        }
                    }
                }
                _ = reconcile_timer.tick() => {
                    if let Err(e) = self.engine.adapter_mut().heartbeat().await {
                        warn!(error = %e, "Adapter heartbeat failed");
                    }
                    self.reconciler.run_once(&mut self.engine).await?;
                    let daily = self.engine.risk().daily_status();
                    debug!(
                        daily_pnl = %daily.daily_pnl,
                        remaining = %daily.remaining_allowance,
                        usage_pct = daily.limit_usage_pct,
                        can_trade = daily.can_trade,
                        "Daily loss status"
                    );
                    self.write_equity()?;
                    self.persist(false)?;
                }
                _ = tokio::time::sleep(until_rollover) => {
                    self.engine.check_rollover();
                    self.persist(false)?;
                }
            }
        }

        self.persist(true)?;
        Ok(self.summary())
    }

    /// 백테스트 재생. 끝에 남은 포지션은 마지막 가격으로 강제 청산합니다.
    pub async fn run_backtest(&mut self, mut events: Vec<ReplayEvent>) -> EngineResult<RunSummary> {
        events.sort_by_key(ReplayEvent::timestamp);
        info!(events = events.len(), "Backtest started");

        for event in events {
            self.events += 1;
            match event {
                ReplayEvent::Tick(tick) => {
                    self.engine.on_tick(&tick).await?;
                    if self.reconciler.is_due(self.engine.now()) {
                        self.reconciler.run_once(&mut self.engine).await?;
                        self.write_equity()?;
                    }
                }
                ReplayEvent::Signal(signal) => {
                    let decision = self.engine.on_signal(signal).await?;
                    debug!(decision = ?decision, "Signal processed");
                }
            }
            self.persist(false)?;
        }

        self.engine.flatten_all().await?;
        self.persist(true)?;

        let summary = self.summary();
        info!(
            trades = summary.trades,
            net_pnl = %summary.net_pnl,
            win_rate = summary.win_rate,
            final_equity = %summary.final_equity,
            "Backtest finished"
        );
        Ok(summary)
    }

    /// 현재까지의 요약.
    pub fn summary(&self) -> RunSummary {
        let stats = TradeStats::from_trades(&self.trades);
        RunSummary {
            mode: self.engine.mode(),
            events: self.events,
            trades: stats.trades,
            wins: stats.wins,
            win_rate: stats.win_rate(),
            net_pnl: stats.net_pnl,
            fees: stats.fees,
            final_equity: self.engine.risk().equity(),
            open_positions: self.engine.ledger().open_count(),
        }
    }

    /// 종료된 거래 기록, 자산 행 추가, 변경 시 복구 스냅샷 저장.
    fn persist(&mut self, force_snapshot: bool) -> EngineResult<()> {
        let closed = self.engine.take_closed_trades();
        let dirty = self.engine.take_dirty();

        let Some(persistence) = self.persistence.as_mut() else {
            self.trades.extend(closed);
            return Ok(());
        };
        let mut result = Ok(());
        for trade in &closed {
            result = result.and(persistence.trades.append(trade));
        }
        self.trades.extend(closed.iter().cloned());
        if !closed.is_empty() {
            result = result.and(persistence.equity.append(&equity_point(&self.engine)));
        }
        if dirty || force_snapshot {
            result = result.and(persistence.recovery.save(&self.engine.recovery_snapshot()));
        }

        match result {
            Ok(()) => Ok(()),
            Err(e) => self.engine.escalate("*", "persist", e.into()),
        }
    }

    fn write_equity(&mut self) -> EngineResult<()> {
        let Some(persistence) = self.persistence.as_mut() else {
            return Ok(());
        };
        match persistence.equity.append(&equity_point(&self.engine)) {
            Ok(()) => Ok(()),
            Err(e) => self.engine.escalate("*", "write equity", e.into()),
        }
    }
}

fn equity_point<A: ExecutionAdapter>(engine: &OrderLifecycleEngine<A>) -> EquityPoint {
    EquityPoint {
        timestamp: engine.now(),
        equity: engine.risk().equity(),
        realized_daily_pnl: engine.risk().account().realized_daily_pnl,
        open_positions: engine.ledger().open_count(),
    }
}
