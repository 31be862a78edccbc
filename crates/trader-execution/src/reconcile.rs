//! 조정 루프.
//!
//! 주기적으로 거래소 포지션/미체결 주문을 원장과 비교해 드리프트를 바로잡습니다.
//! 거래소가 항상 기준이며, 모든 보정은 드리프트로 기록됩니다.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use trader_core::{ClientOrderId, ExitKind, OrderSnapshot, PositionSnapshot};

use crate::config::ReconcileConfig;
use crate::engine::{EngineResult, OrderLifecycleEngine, PendingAddState};
use crate::exits::take_profit_trims;
use crate::ledger::ReconcileOutcome;
use crate::mode::ExecutionAdapter;

/// 한 번의 조정 실행 결과.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 확인한 심볼 수
    pub symbols_checked: usize,
    /// 수량 보정
    pub corrected: usize,
    /// 원격 청산으로 보관된 포지션
    pub closed_remotely: usize,
    /// 채택된 원격 포지션
    pub adopted: usize,
    /// 거래소에 없는 라이브 청산 주문
    pub missing_exits: usize,
    /// 취소된 고아 주문
    pub orphans_cancelled: usize,
    /// 해제된 진입 대기 슬롯
    pub stale_entries: usize,
    /// 체결 보고 없이 정리된 DCA 추가 주문
    pub stale_adds: usize,
    /// 조회 실패로 건너뛴 심볼
    pub failures: usize,
}

impl ReconcileReport {
    /// 발견된 드리프트 건수.
    pub fn drift_count(&self) -> usize {
        self.corrected
            + self.closed_remotely
            + self.adopted
            + self.missing_exits
            + self.orphans_cancelled
            + self.stale_entries
            + self.stale_adds
    }
}

/// 주기적 조정 루프.
#[derive(Debug, Clone)]
pub struct ReconciliationLoop {
    config: ReconcileConfig,
    last_run: Option<DateTime<Utc>>,
}

impl ReconciliationLoop {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config,
            last_run: None,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// 마지막 실행 이후 주기가 지났는지 확인 (논리 시계 기준).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            Some(last) => now - last >= self.config.interval(),
            None => true,
        }
    }

    /// 조정 1회 실행.
    pub async fn run_once<A: ExecutionAdapter>(
        &mut self,
        engine: &mut OrderLifecycleEngine<A>,
    ) -> EngineResult<ReconcileReport> {
        let now = engine.now();
        self.last_run = Some(now);
        engine.check_rollover();
        engine.process_fills().await?;

        let mut report = ReconcileReport::default();
        for symbol in engine.tracked_symbols() {
            report.symbols_checked += 1;
            let remote = match engine.adapter_mut().fetch_position(&symbol).await {
                Ok(remote) => remote,
                Err(e) => {
                    report.failures += 1;
                    engine.escalate(&symbol, "fetch position", e.into())?;
                    continue;
                }
            };
            let open_orders = match engine.adapter_mut().fetch_open_orders(&symbol).await {
                Ok(orders) => orders,
                Err(e) => {
                    report.failures += 1;
                    engine.escalate(&symbol, "fetch open orders", e.into())?;
                    continue;
                }
            };

            match engine.resolve_stale_add(&remote, self.config.interval()).await? {
                PendingAddState::Resolved => report.stale_adds += 1,
                // 체결 보고 전 수량 차이는 드리프트가 아님
                PendingAddState::InFlight => {
                    debug!(symbol = %symbol, "DCA add in flight, skipping quantity check");
                    continue;
                }
                PendingAddState::Idle => {}
            }
            self.reconcile_position(engine, &remote, now, &mut report)?;
            if remote.is_flat() && engine.clear_stale_pending(&symbol, self.config.interval()) {
                report.stale_entries += 1;
            }
            self.reconcile_orders(engine, &symbol, &open_orders, &mut report)
                .await?;
            check_exit_coverage(engine, &symbol);
            engine.maintain_exits(&symbol).await?;
        }

        match engine.adapter_mut().fetch_equity().await {
            Ok(equity) => engine.risk_mut().set_equity(equity),
            Err(e) => engine.escalate("*", "fetch equity", e.into())?,
        }

        if report.drift_count() > 0 {
            info!(
                symbols = report.symbols_checked,
                corrected = report.corrected,
                closed_remotely = report.closed_remotely,
                adopted = report.adopted,
                missing_exits = report.missing_exits,
                orphans_cancelled = report.orphans_cancelled,
                stale_entries = report.stale_entries,
                stale_adds = report.stale_adds,
                failures = report.failures,
                "Reconciliation corrected drift"
            );
        } else {
            debug!(
                symbols = report.symbols_checked,
                failures = report.failures,
                equity = %engine.risk().equity(),
                "Reconciliation in sync"
            );
        }
        Ok(report)
    }

    fn reconcile_position<A: ExecutionAdapter>(
        &self,
        engine: &mut OrderLifecycleEngine<A>,
        remote: &PositionSnapshot,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let outcome = match engine.ledger_mut().reconcile(remote, now) {
            Ok(outcome) => outcome,
            Err(e) => return engine.escalate(&remote.symbol, "reconcile position", e.into()),
        };

        match outcome {
            ReconcileOutcome::InSync => {}
            ReconcileOutcome::Corrected { realized_pnl, .. } => {
                report.corrected += 1;
                if !realized_pnl.is_zero() {
                    engine
                        .risk_mut()
                        .register_realized_pnl(realized_pnl, &remote.symbol, now);
                }
            }
            ReconcileOutcome::ClosedRemotely { trade, realized_pnl } => {
                report.closed_remotely += 1;
                engine
                    .risk_mut()
                    .register_realized_pnl(realized_pnl, &remote.symbol, now);
                engine.record_remote_close(&remote.symbol, trade);
                // 반대 방향 원격 포지션은 새로 채택
                if !remote.is_flat() && self.config.adopt_unknown {
                    engine.adopt_remote(remote)?;
                    report.adopted += 1;
                }
            }
            ReconcileOutcome::UnknownRemote(snapshot) => {
                if self.config.adopt_unknown {
                    engine.adopt_remote(&snapshot)?;
                    report.adopted += 1;
                } else {
                    warn!(symbol = %snapshot.symbol, "Unknown remote position left unmanaged");
                }
            }
        }
        Ok(())
    }

    async fn reconcile_orders<A: ExecutionAdapter>(
        &self,
        engine: &mut OrderLifecycleEngine<A>,
        symbol: &str,
        open_orders: &[OrderSnapshot],
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let remote_ids: HashSet<&str> = open_orders
            .iter()
            .map(|o| o.client_order_id.as_str())
            .collect();

        let (missing, tracked): (Vec<String>, HashSet<String>) = match engine.ledger().position(symbol) {
            Some(position) => {
                let missing = position
                    .exits
                    .iter()
                    .filter(|e| e.is_live())
                    .filter_map(|e| e.client_order_id.clone())
                    .filter(|cid| !remote_ids.contains(cid.as_str()))
                    .collect();
                let tracked = position
                    .exits
                    .iter()
                    .filter(|e| e.is_open())
                    .filter_map(|e| e.client_order_id.clone())
                    .collect();
                (missing, tracked)
            }
            None => (Vec::new(), HashSet::new()),
        };

        for client_order_id in missing {
            engine.mark_exit_missing(symbol, &client_order_id)?;
            report.missing_exits += 1;
        }

        for order in open_orders {
            let Some(parts) = ClientOrderId::parse(&order.client_order_id) else {
                continue;
            };
            if parts.kind.is_increase() || tracked.contains(&order.client_order_id) {
                continue;
            }
            engine.cancel_orphan(symbol, &order.client_order_id).await?;
            report.orphans_cancelled += 1;
        }
        Ok(())
    }
}

/// 손절 누락과 익절 초과를 기록합니다. 실제 교정은 청산 주문 유지 작업이 합니다.
fn check_exit_coverage<A: ExecutionAdapter>(engine: &OrderLifecycleEngine<A>, symbol: &str) {
    let Some(position) = engine.ledger().position(symbol) else {
        return;
    };
    if !position
        .exits
        .iter()
        .any(|e| e.kind == ExitKind::StopLoss && e.is_open())
    {
        warn!(symbol = %symbol, position_id = %position.id, "Drift: position has no stop loss");
    }
    let trims = take_profit_trims(position);
    if !trims.is_empty() {
        warn!(
            symbol = %symbol,
            position_id = %position.id,
            live_tp_quantity = %position.live_take_profit_quantity(),
            quantity = %position.quantity,
            legs = trims.len(),
            "Drift: take profit quantity exceeds position"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::PositionPhase;
    use crate::mode::SimulatedAdapter;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use trader_core::{
        Direction, ExitReason, IntentKind, ManualClock, OrderIntent, Price, Side, Signal, Tick,
    };
    use trader_exchange::SimulatedConfig;
    use trader_risk::{RiskConfig, RiskManager};

    const BTC: &str = "BTCUSDT";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn engine() -> OrderLifecycleEngine<SimulatedAdapter> {
        let adapter = SimulatedAdapter::backtest(
            SimulatedConfig::default()
                .frictionless()
                .with_initial_equity(dec!(10000)),
            t(0),
        );
        let risk = RiskManager::new(RiskConfig::default(), dec!(10000), t(0).date_naive());
        OrderLifecycleEngine::new(EngineConfig::default(), risk, adapter, &[BTC.to_string()]).unwrap()
    }

    async fn tick(engine: &mut OrderLifecycleEngine<SimulatedAdapter>, price: Price, secs: i64) {
        engine.on_tick(&Tick::new(BTC, price, t(secs))).await.unwrap();
    }

    async fn open_long(engine: &mut OrderLifecycleEngine<SimulatedAdapter>) {
        tick(engine, dec!(50000), 0).await;
        let signal = Signal::new(BTC, Direction::Long, 0.9, 40.0, t(0));
        engine.on_signal(signal).await.unwrap();
        assert_eq!(engine.phase(BTC), PositionPhase::Open);
    }

    fn reconciler() -> ReconciliationLoop {
        ReconciliationLoop::new(ReconcileConfig::default())
    }

    #[tokio::test]
    async fn test_in_sync_reports_nothing() {
        let mut engine = engine();
        open_long(&mut engine).await;

        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.symbols_checked, 1);
        assert_eq!(report.drift_count(), 0);
        assert_eq!(engine.risk().equity(), dec!(10000));
    }

    #[tokio::test]
    async fn test_injected_drift_corrected_to_exchange() {
        let mut engine = engine();
        open_long(&mut engine).await;
        engine
            .adapter_mut()
            .exchange_mut()
            .inject_position(BTC, Side::Buy, dec!(0.15), dec!(50000));

        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.corrected, 1);

        let position = engine.ledger().position(BTC).unwrap();
        assert_eq!(position.quantity, dec!(0.15));
        // 손절은 새 수량으로 교체
        let stop = position.open_exit(ExitKind::StopLoss, 0).unwrap();
        assert_eq!(stop.quantity, dec!(0.15));
        assert_eq!(position.live_stop_count(), 1);

        // 두 번째 실행은 일치
        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.drift_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_close_archives_and_cancels_orphans() {
        let mut engine = engine();
        open_long(&mut engine).await;
        engine
            .adapter_mut()
            .exchange_mut()
            .inject_position(BTC, Side::Buy, dec!(0), dec!(0));

        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.closed_remotely, 1);
        // 손절 1 + 익절 3
        assert_eq!(report.orphans_cancelled, 4);
        assert_eq!(engine.phase(BTC), PositionPhase::Flat);

        let trades = engine.take_closed_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::Reconciled);
        assert!(engine.adapter().exchange().fetch_open_orders(BTC).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_remote_position_adopted_with_stop() {
        let mut engine = engine();
        tick(&mut engine, dec!(2000), 0).await;
        engine
            .adapter_mut()
            .exchange_mut()
            .inject_position(BTC, Side::Sell, dec!(1), dec!(2000));

        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(engine.phase(BTC), PositionPhase::Open);

        let position = engine.ledger().position(BTC).unwrap();
        assert_eq!(position.side, Side::Sell);
        assert_eq!(position.initial_risk, dec!(20));
        assert_eq!(position.open_exit(ExitKind::StopLoss, 0).unwrap().target_price, dec!(2020));
    }

    #[tokio::test]
    async fn test_missing_exit_is_resubmitted() {
        let mut engine = engine();
        open_long(&mut engine).await;
        let stop_id = engine
            .ledger()
            .position(BTC)
            .and_then(|p| p.open_exit(ExitKind::StopLoss, 0))
            .and_then(|e| e.client_order_id.clone())
            .unwrap();
        // 엔진 밖에서 손절이 취소됨
        engine
            .adapter_mut()
            .exchange_mut()
            .cancel_order(BTC, &stop_id)
            .unwrap();

        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.missing_exits, 1);

        let position = engine.ledger().position(BTC).unwrap();
        let stop = position.open_exit(ExitKind::StopLoss, 0).unwrap();
        assert!(stop.is_live());
        assert_ne!(stop.client_order_id.as_deref(), Some(stop_id.as_str()));
        assert_eq!(position.live_stop_count(), 1);
    }

    #[tokio::test]
    async fn test_orphan_engine_order_cancelled() {
        let mut engine = engine();
        open_long(&mut engine).await;
        let orphan = ClientOrderId::new("BTCUSDT-9", IntentKind::TakeProfit, 0, 999);
        let intent = OrderIntent::reduce_limit(
            BTC,
            Side::Sell,
            dec!(0.01),
            dec!(60000),
            IntentKind::TakeProfit,
            orphan.clone(),
        );
        engine.adapter_mut().exchange_mut().submit_order(&intent).unwrap();

        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.orphans_cancelled, 1);
        assert!(engine
            .adapter()
            .exchange()
            .fetch_open_orders(BTC)
            .iter()
            .all(|o| o.client_order_id != orphan.as_str()));
    }

    /// 모의투자 엔진에서 DCA 추가 주문의 체결 보고만 유실시킵니다.
    async fn paper_engine_with_lost_add() -> (OrderLifecycleEngine<SimulatedAdapter>, ManualClock) {
        let clock = ManualClock::new(t(0));
        let adapter = SimulatedAdapter::paper_with_clock(
            SimulatedConfig::default()
                .frictionless()
                .with_initial_equity(dec!(10000)),
            Arc::new(clock.clone()),
        );
        let risk = RiskManager::new(RiskConfig::default(), dec!(10000), t(0).date_naive());
        let mut engine =
            OrderLifecycleEngine::new(EngineConfig::default(), risk, adapter, &[BTC.to_string()]).unwrap();

        tick(&mut engine, dec!(50000), 0).await;
        // ADX 25: DCA 허용
        engine
            .on_signal(Signal::new(BTC, Direction::Long, 0.9, 25.0, t(0)))
            .await
            .unwrap();
        engine.adapter_mut().exchange_mut().set_fill_reports(false);

        clock.advance(Duration::seconds(10));
        tick(&mut engine, dec!(49700), 10).await;
        engine.adapter_mut().exchange_mut().set_fill_reports(true);
        assert_eq!(engine.phase(BTC), PositionPhase::Adding);
        assert_eq!(engine.ledger().position(BTC).unwrap().quantity, dec!(0.1));
        (engine, clock)
    }

    #[tokio::test]
    async fn test_lost_dca_fill_recovered_from_exchange() {
        let (mut engine, clock) = paper_engine_with_lost_add().await;

        // 주기 전에는 그대로 대기
        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.stale_adds, 0);
        assert_eq!(report.corrected, 0);
        assert_eq!(engine.phase(BTC), PositionPhase::Adding);

        clock.advance(Duration::seconds(15));
        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.stale_adds, 1);
        assert_eq!(report.corrected, 0);
        assert_eq!(engine.phase(BTC), PositionPhase::Open);

        let position = engine.ledger().position(BTC).unwrap();
        assert_eq!(position.dca_fills.len(), 1);
        assert_eq!(position.quantity, dec!(0.2));
        assert_eq!(position.avg_entry_price, dec!(49850));
        assert_eq!(position.open_exit(ExitKind::StopLoss, 0).unwrap().quantity, dec!(0.2));
    }

    #[tokio::test]
    async fn test_unfilled_dca_add_released_to_open() {
        let (mut engine, clock) = paper_engine_with_lost_add().await;
        // 거래소에는 추가분이 없음
        engine
            .adapter_mut()
            .exchange_mut()
            .inject_position(BTC, Side::Buy, dec!(0.1), dec!(50000));

        clock.advance(Duration::seconds(15));
        let report = reconciler().run_once(&mut engine).await.unwrap();
        assert_eq!(report.stale_adds, 1);
        assert_eq!(engine.phase(BTC), PositionPhase::Open);
        assert!(engine.ledger().position(BTC).unwrap().dca_fills.is_empty());

        // 같은 레벨에서 다시 추가 가능
        tick(&mut engine, dec!(49690), 30).await;
        let position = engine.ledger().position(BTC).unwrap();
        assert_eq!(position.dca_fills.len(), 1);
        assert_eq!(position.quantity, dec!(0.2));
    }

    #[test]
    fn test_due_after_interval() {
        let mut reconciler = reconciler();
        assert!(reconciler.is_due(t(0)));
        reconciler.last_run = Some(t(0));
        assert!(!reconciler.is_due(t(11)));
        assert!(reconciler.is_due(t(12)));
    }
}
