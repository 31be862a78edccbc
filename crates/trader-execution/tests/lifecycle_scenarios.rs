//! 시뮬레이션 거래소를 통한 라이프사이클 시나리오.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use trader_core::{
    Direction, ExitKind, ExitReason, ManualClock, Price, Side, Signal, Tick,
};
use trader_exchange::SimulatedConfig;
use trader_execution::{
    EngineConfig, IgnoreReason, OrderLifecycleEngine, PositionPhase, ReconciliationLoop,
    SignalDecision, SimulatedAdapter,
};
use trader_risk::{RiskConfig, RiskManager};

const BTC: &str = "BTCUSDT";

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

fn backtest_engine(risk_config: RiskConfig) -> OrderLifecycleEngine<SimulatedAdapter> {
    let adapter = SimulatedAdapter::backtest(
        SimulatedConfig::default()
            .frictionless()
            .with_initial_equity(dec!(10000)),
        t(0),
    );
    let risk = RiskManager::new(risk_config, dec!(10000), t(0).date_naive());
    OrderLifecycleEngine::new(EngineConfig::default(), risk, adapter, &[BTC.to_string()]).unwrap()
}

async fn tick(engine: &mut OrderLifecycleEngine<SimulatedAdapter>, price: Price, secs: i64) {
    engine.on_tick(&Tick::new(BTC, price, t(secs))).await.unwrap();
}

async fn signal(
    engine: &mut OrderLifecycleEngine<SimulatedAdapter>,
    direction: Direction,
    adx: f64,
    secs: i64,
) -> SignalDecision {
    engine
        .on_signal(Signal::new(BTC, direction, 0.9, adx, t(secs)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_entry_size_matches_risk_budget() {
    let mut engine = backtest_engine(RiskConfig::default());
    tick(&mut engine, dec!(50000), 0).await;
    signal(&mut engine, Direction::Long, 30.0, 0).await;

    let position = engine.ledger().position(BTC).unwrap();
    // 손절 시 손실 ≈ 자산의 0.5%, 수량 단위 한 칸 이내
    let loss_at_stop = position.quantity * dec!(50000) * dec!(0.01);
    assert!((loss_at_stop - dec!(50)).abs() <= dec!(50000) * dec!(0.01) * dec!(0.001));
}

#[tokio::test]
async fn test_short_entry_stopped_out() {
    let mut engine = backtest_engine(RiskConfig::default());
    tick(&mut engine, dec!(2000), 0).await;
    let decision = signal(&mut engine, Direction::Short, 40.0, 0).await;
    assert!(matches!(decision, SignalDecision::Submitted { .. }));

    let stop = engine
        .ledger()
        .position(BTC)
        .and_then(|p| p.open_exit(ExitKind::StopLoss, 0))
        .cloned()
        .unwrap();
    assert_eq!(stop.target_price, dec!(2020));

    tick(&mut engine, dec!(2025), 10).await;
    let trades = engine.take_closed_trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].side, Side::Sell);
    assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
    assert!(trades[0].realized_pnl < Decimal::ZERO);
    assert_eq!(engine.phase(BTC), PositionPhase::Flat);
}

#[tokio::test]
async fn test_atr_widens_stop_and_shrinks_size() {
    let mut engine = backtest_engine(RiskConfig::default());
    tick(&mut engine, dec!(50000), 0).await;

    // 참조 가격이 달라도 사이징은 마지막 틱 기준
    let signal = Signal::new(BTC, Direction::Long, 0.9, 40.0, t(0))
        .with_price(dec!(50100))
        .with_atr(dec!(500));
    engine.on_signal(signal).await.unwrap();

    // 손절 거리 = max(1.0%, 500 × 1.6 / 50000) = 1.6%
    let position = engine.ledger().position(BTC).unwrap();
    assert_eq!(position.quantity, dec!(0.062));
    assert_eq!(
        position.open_exit(ExitKind::StopLoss, 0).unwrap().target_price,
        dec!(49200)
    );
}

#[tokio::test]
async fn test_dca_bounded_by_ladder_under_adverse_ticks() {
    let mut engine = backtest_engine(RiskConfig::default());
    tick(&mut engine, dec!(50000), 0).await;
    signal(&mut engine, Direction::Long, 25.0, 0).await;

    let ladder = engine.ledger().ladder().len();
    let mut max_adds = 0;
    let mut price = dec!(50000);
    for step in 1..=60 {
        price -= dec!(50);
        tick(&mut engine, price, step).await;
        if let Some(position) = engine.ledger().position(BTC) {
            max_adds = max_adds.max(position.dca_fills.len());
            assert!(position.dca_fills.len() <= ladder);
            assert!(position.live_stop_count() <= 1);
        }
    }

    assert_eq!(max_adds, 2);
    let trades = engine.take_closed_trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].dca_count, 2);
    assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
    // 청산 후 추가 진입 없음
    assert!(engine.ledger().position(BTC).is_none());
}

#[tokio::test]
async fn test_daily_loss_blocks_until_rollover() {
    let risk_config = RiskConfig {
        max_daily_loss_pct: dec!(1.0),
        ..RiskConfig::default()
    };
    let mut engine = backtest_engine(risk_config);

    // 1차 손절: 롱 50000 → 49400
    tick(&mut engine, dec!(50000), 0).await;
    signal(&mut engine, Direction::Long, 40.0, 0).await;
    tick(&mut engine, dec!(49400), 30).await;

    // 2차 손절: 숏 49400 → 50000 (반대 방향 금지 구간 이후)
    tick(&mut engine, dec!(49400), 100).await;
    let decision = signal(&mut engine, Direction::Short, 40.0, 100).await;
    assert!(matches!(decision, SignalDecision::Submitted { .. }));
    tick(&mut engine, dec!(50000), 130).await;

    assert_eq!(engine.take_closed_trades().len(), 2);
    assert!(engine.risk().account().daily_loss_breached);

    tick(&mut engine, dec!(50000), 500).await;
    match signal(&mut engine, Direction::Long, 40.0, 500).await {
        SignalDecision::Rejected(rejection) => assert!(rejection.is_daily_limit()),
        other => panic!("expected daily limit rejection, got {:?}", other),
    }

    // 다음 거래일
    tick(&mut engine, dec!(50000), 86_410).await;
    assert!(!engine.risk().account().daily_loss_breached);
    let decision = signal(&mut engine, Direction::Long, 40.0, 86_410).await;
    assert!(matches!(decision, SignalDecision::Submitted { .. }));
}

#[tokio::test]
async fn test_partial_remote_close_corrected_by_reconcile() {
    let mut engine = backtest_engine(RiskConfig::default());
    tick(&mut engine, dec!(50000), 0).await;
    signal(&mut engine, Direction::Long, 40.0, 0).await;

    engine
        .adapter_mut()
        .exchange_mut()
        .inject_position(BTC, Side::Buy, dec!(0.04), dec!(50000));
    assert_eq!(engine.ledger().position(BTC).unwrap().quantity, dec!(0.1));

    let mut reconciler = ReconciliationLoop::new(engine.config().reconcile.clone());
    let report = reconciler.run_once(&mut engine).await.unwrap();
    assert_eq!(report.corrected, 1);

    let snapshot = engine.ledger().snapshot(BTC).unwrap();
    assert_eq!(snapshot.quantity, dec!(0.04));
    assert_eq!(snapshot.open_exit(ExitKind::StopLoss, 0).unwrap().quantity, dec!(0.04));
    assert!(snapshot.live_take_profit_quantity() <= snapshot.quantity);
    assert_eq!(snapshot.live_stop_count(), 1);
}

#[tokio::test]
async fn test_paper_mode_windows_follow_clock() {
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
    signal(&mut engine, Direction::Long, 40.0, 0).await;
    clock.advance(Duration::seconds(30));
    tick(&mut engine, dec!(49400), 30).await;
    assert_eq!(engine.phase(BTC), PositionPhase::Flat);

    assert_eq!(
        signal(&mut engine, Direction::Long, 40.0, 30).await,
        SignalDecision::Ignored(IgnoreReason::Cooldown)
    );
    clock.advance(Duration::seconds(300));
    assert!(matches!(
        signal(&mut engine, Direction::Long, 40.0, 330).await,
        SignalDecision::Submitted { .. }
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// 임의 가격 경로에서 청산 래더 불변식과 트레일링 단조성.
    #[test]
    fn prop_exit_invariants_hold_on_random_paths(
        long in any::<bool>(),
        trending in any::<bool>(),
        steps in prop::collection::vec(-120i64..=120, 1..150),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let mut engine = backtest_engine(RiskConfig::default());
            let direction = if long { Direction::Long } else { Direction::Short };
            let adx = if trending { 40.0 } else { 25.0 };
            tick(&mut engine, dec!(50000), 0).await;
            signal(&mut engine, direction, adx, 0).await;

            let ladder = engine.ledger().ladder().len();
            let mut levels: HashMap<String, Price> = HashMap::new();
            let mut price = dec!(50000);
            for (i, step) in steps.iter().enumerate() {
                price += Decimal::from(*step);
                tick(&mut engine, price, i as i64 + 1).await;

                let Some(position) = engine.ledger().position(BTC) else {
                    continue;
                };
                assert!(position.dca_fills.len() <= ladder);
                assert!(position.live_stop_count() <= 1);
                assert!(position.live_take_profit_quantity() <= position.quantity);
                if let Some(level) = position.trailing.level {
                    if let Some(prev) = levels.get(&position.id) {
                        if position.is_long() {
                            assert!(level >= *prev);
                        } else {
                            assert!(level <= *prev);
                        }
                    }
                    levels.insert(position.id.clone(), level);
                }
            }
        });
    }
}
