//! 주문 라이프사이클 엔진.
//!
//! 심볼별 상태 머신:
//!
//! ```text
//! Flat → PendingEntry → Open ⇄ Adding
//!                        ↓
//!                     Exiting → Closed → Flat
//! ```
//!
//! - 시그널 필터(신뢰도, ADX, 쿨다운, 반대 방향 금지 구간)를 통과한 시그널만 진입합니다.
//! - 원장은 [`FillEvent`]로만 갱신됩니다. 주문 응답의 체결 정보는 사용하지 않습니다.
//! - 체결 후 청산 래더(손절, 익절, 트레일링)를 다시 계획하고 교체 정책에 따라 주문을 갱신합니다.
//!
//! 엔진은 단일 작성자입니다. 락 없이 `&mut self`로 원장, 리스크, 어댑터를 소유합니다.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use trader_core::{
    ClientOrderId, ClientOrderIdParts, ConfigValidationError, DecimalExt, Direction, ErrorClass,
    ExecutionMode, ExitKind, ExitOrder, ExitReason, ExitStatus, FillEvent, IntentKind,
    MarketUpdate, OrderIntent, Percentage, Position, PositionSnapshot, Price, Quantity, Signal,
    Tick, Trade,
};
use trader_exchange::ExchangeError;
use trader_risk::{RiskManager, RiskRejection};

use crate::config::EngineConfig;
use crate::exits::{DesiredExit, ExitPlanner, ReplaceDecision};
use crate::ledger::{LedgerError, PositionLedger};
use crate::mode::ExecutionAdapter;
use crate::persistence::{PersistenceError, RecoverySnapshot};

/// 엔진 에러 타입.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    /// 에러 분류.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Exchange(e) => e.class(),
            EngineError::Ledger(e) => e.class(),
            EngineError::Config(_) => ErrorClass::Fatal,
            EngineError::Persistence(e) => e.class(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// 심볼별 라이프사이클 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionPhase {
    #[default]
    Flat,
    PendingEntry,
    Open,
    Adding,
    Exiting,
    Closed,
}

impl std::fmt::Display for PositionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionPhase::Flat => write!(f, "flat"),
            PositionPhase::PendingEntry => write!(f, "pending_entry"),
            PositionPhase::Open => write!(f, "open"),
            PositionPhase::Adding => write!(f, "adding"),
            PositionPhase::Exiting => write!(f, "exiting"),
            PositionPhase::Closed => write!(f, "closed"),
        }
    }
}

/// 시그널 무시 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// 방향 없음
    FlatDirection,
    /// 신뢰도 미달
    LowConfidence,
    /// ADX 미달
    WeakTrend,
    /// 밴드 폭 미달 (변동성 부족)
    NarrowBand,
    /// 심볼이 이미 포지션 처리 중
    Busy(PositionPhase),
    /// 같은 방향 쿨다운
    Cooldown,
    /// 반대 방향 금지 구간
    AntiFlip,
    /// 아직 시세 없음
    NoMarketPrice,
}

/// 시그널 처리 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalDecision {
    /// 진입 주문 제출
    Submitted {
        position_id: String,
        quantity: Quantity,
    },
    /// 필터에 의해 무시
    Ignored(IgnoreReason),
    /// 리스크 거부
    Rejected(RiskRejection),
    /// 제출 실패 (의도 중단)
    Failed(ErrorClass),
}

#[derive(Debug, Clone)]
struct PendingEntry {
    position_id: String,
    submitted_at: DateTime<Utc>,
}

/// 조정 시점의 DCA 추가 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingAddState {
    /// 대기 중인 추가 주문 없음
    Idle,
    /// 아직 체결 보고를 기다리는 중
    InFlight,
    /// 오래된 추가 주문을 복구 또는 해제함
    Resolved,
}

/// 체결 확인을 기다리는 DCA 추가 주문.
#[derive(Debug, Clone)]
struct PendingAdd {
    client_order_id: String,
    quantity: Quantity,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct SymbolState {
    phase: PositionPhase,
    last_price: Option<Price>,
    last_signal: Option<Signal>,
    last_decision: Option<(Direction, DateTime<Utc>)>,
    pending_entry: Option<PendingEntry>,
    /// `Adding` 단계에서만 유지
    pending_add: Option<PendingAdd>,
    /// 포지션의 손절 거리 (%)
    stop_pct: Percentage,
    atr: Option<Price>,
    imbalance: Option<f64>,
}

/// 청산 레그 조정 작업.
enum ExitAction<'a> {
    Cancel(&'a ExitOrder),
    Replace(&'a ExitOrder, &'a DesiredExit),
    Place(&'a DesiredExit),
}

impl ExitAction<'_> {
    /// 줄이는 작업을 먼저 수행해 익절 합계가 포지션 수량을 넘지 않게 합니다.
    fn priority(&self) -> u8 {
        match self {
            ExitAction::Cancel(_) => 0,
            ExitAction::Replace(existing, desired) if desired.quantity < existing.remaining_quantity() => 1,
            ExitAction::Replace(..) | ExitAction::Place(_) => 2,
        }
    }
}

/// 포지션/주문 라이프사이클 엔진.
pub struct OrderLifecycleEngine<A: ExecutionAdapter> {
    config: EngineConfig,
    planner: ExitPlanner,
    risk: RiskManager,
    ledger: PositionLedger,
    adapter: A,
    symbols: BTreeMap<String, SymbolState>,
    nonce: u64,
    new_trades: Vec<Trade>,
    dirty: bool,
}

impl<A: ExecutionAdapter> OrderLifecycleEngine<A> {
    /// 새 엔진 생성.
    ///
    /// 백테스트가 아니면 nonce를 현재 시각(초)에서 시작해 재시작 간 ID 충돌을 피합니다.
    pub fn new(
        config: EngineConfig,
        risk: RiskManager,
        adapter: A,
        symbols: &[String],
    ) -> EngineResult<Self> {
        config.validate()?;
        let ladder = config.dca.levels()?;
        let ledger = PositionLedger::new(ladder, config.reconcile.quantity_tolerance);
        let planner = ExitPlanner::new(config.exits.clone(), risk.config().quantity_step);
        let nonce = match adapter.mode() {
            ExecutionMode::Backtest => 0,
            _ => adapter.now().timestamp().max(0) as u64,
        };

        Ok(Self {
            config,
            planner,
            risk,
            ledger,
            adapter,
            symbols: symbols
                .iter()
                .map(|s| (s.clone(), SymbolState::default()))
                .collect(),
            nonce,
            new_trades: Vec::new(),
            dirty: false,
        })
    }

    // ==================== 조회 ====================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn mode(&self) -> ExecutionMode {
        self.adapter.mode()
    }

    /// 현재 논리 시각.
    pub fn now(&self) -> DateTime<Utc> {
        self.adapter.now()
    }

    /// 심볼의 라이프사이클 단계.
    pub fn phase(&self, symbol: &str) -> PositionPhase {
        self.symbols.get(symbol).map(|s| s.phase).unwrap_or_default()
    }

    /// 심볼의 마지막 호가 불균형.
    pub fn imbalance(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.imbalance)
    }

    /// 추적 중인 심볼 (설정된 심볼과 열린 포지션의 합집합, 정렬됨).
    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbols.keys().cloned().collect();
        for position in self.ledger.positions() {
            if !self.symbols.contains_key(&position.symbol) {
                symbols.push(position.symbol.clone());
            }
        }
        symbols.sort();
        symbols
    }

    /// 마지막 영속화 이후 종료된 거래를 꺼냅니다.
    pub fn take_closed_trades(&mut self) -> Vec<Trade> {
        std::mem::take(&mut self.new_trades)
    }

    /// 마지막 확인 이후 상태 변경 여부 (확인 시 초기화).
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    // ==================== 복구 ====================

    /// 복구 스냅샷 생성.
    pub fn recovery_snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            saved_at: self.now(),
            nonce: self.nonce,
            position_seq: self.ledger.position_seq(),
            account: Some(self.risk.account().clone()),
            positions: self.ledger.export_positions(),
        }
    }

    /// 복구 스냅샷 적용. 조정 루프를 돌리기 전에 호출합니다.
    pub fn restore(&mut self, snapshot: RecoverySnapshot) -> EngineResult<()> {
        self.ledger
            .import_positions(snapshot.positions, snapshot.position_seq)?;
        self.nonce = self.nonce.max(snapshot.nonce);
        if let Some(account) = snapshot.account {
            self.risk = RiskManager::restore(self.risk.config().clone(), account);
        }

        let fallback = self.config.exits.sl_fixed_pct;
        for position in self.ledger.positions() {
            let state = self.symbols.entry(position.symbol.clone()).or_default();
            state.stop_pct = stop_pct_of(position, fallback);
            state.phase = if position.exit_quantity.is_zero() {
                PositionPhase::Open
            } else {
                PositionPhase::Exiting
            };
        }
        info!(
            positions = self.ledger.open_count(),
            nonce = self.nonce,
            saved_at = %snapshot.saved_at,
            "Engine state restored"
        );
        Ok(())
    }

    // ==================== 이벤트 ====================

    /// 시장 데이터 업데이트 처리.
    pub async fn on_market_update(&mut self, update: MarketUpdate) -> EngineResult<()> {
        match update {
            MarketUpdate::Tick(tick) => self.on_tick(&tick).await,
            MarketUpdate::Imbalance { symbol, obi, .. } => {
                trace!(symbol = %symbol, obi, "Order book imbalance");
                self.state_mut(&symbol).imbalance = Some(obi);
                Ok(())
            }
        }
    }

    /// 틱 처리: 대기 주문 체결, 트레일링 갱신, DCA 판단, 청산 주문 유지.
    ///
    /// 거래일 경계는 체결 반영 전에 넘깁니다. 새 거래일 첫 틱의 손실은 새 거래일에 기록됩니다.
    pub async fn on_tick(&mut self, tick: &Tick) -> EngineResult<()> {
        self.adapter.advance_clock(tick.timestamp);
        self.check_rollover();
        self.state_mut(&tick.symbol).last_price = Some(tick.price);

        let fills = self.adapter.on_tick(tick).await;
        for fill in fills {
            self.apply_fill_event(fill).await?;
        }
        self.manage_position(&tick.symbol, tick.price).await
    }

    /// 시그널 처리.
    pub async fn on_signal(&mut self, signal: Signal) -> EngineResult<SignalDecision> {
        let symbol = signal.symbol.clone();
        self.adapter.advance_clock(signal.timestamp);
        self.check_rollover();
        let now = self.now();
        if let Some(atr) = signal.atr {
            self.state_mut(&symbol).atr = Some(atr);
        }
        self.state_mut(&symbol).last_signal = Some(signal.clone());

        if let Some(reason) = self.filter_signal(&signal, now) {
            debug!(
                symbol = %symbol,
                direction = %signal.direction,
                confidence = signal.confidence,
                adx = signal.adx,
                reason = ?reason,
                "Signal ignored"
            );
            return Ok(SignalDecision::Ignored(reason));
        }
        let Some(side) = signal.direction.entry_side() else {
            return Ok(SignalDecision::Ignored(IgnoreReason::FlatDirection));
        };
        let Some(price) = self.symbols.get(&symbol).and_then(|s| s.last_price) else {
            debug!(symbol = %symbol, "Signal ignored, no market price yet");
            return Ok(SignalDecision::Ignored(IgnoreReason::NoMarketPrice));
        };

        let stop_pct = self.planner.stop_distance_pct(price, signal.atr);
        let sized = match self.risk.size_entry(&signal, price, stop_pct) {
            Ok(sized) => sized,
            Err(rejection) => {
                info!(
                    symbol = %symbol,
                    direction = %signal.direction,
                    reason = %rejection,
                    "Entry rejected by risk manager"
                );
                return Ok(SignalDecision::Rejected(rejection));
            }
        };

        let position_id = self.ledger.next_position_id(&symbol);
        let client_order_id = self.next_client_id(&position_id, IntentKind::Entry, 0);
        let intent = OrderIntent::market(
            &symbol,
            side,
            sized.quantity,
            IntentKind::Entry,
            client_order_id.clone(),
        );

        {
            let state = self.state_mut(&symbol);
            state.pending_entry = Some(PendingEntry {
                position_id: position_id.clone(),
                submitted_at: now,
            });
            state.stop_pct = stop_pct;
        }
        self.set_phase(&symbol, PositionPhase::PendingEntry);
        info!(
            symbol = %symbol,
            position_id = %position_id,
            client_order_id = %client_order_id,
            direction = %signal.direction,
            quantity = %sized.quantity,
            price = %price,
            stop_pct = %stop_pct,
            obi = ?self.imbalance(&symbol),
            "Entry submitted"
        );

        match self.adapter.submit_order(&intent).await {
            Ok(ack) => {
                debug!(client_order_id = %ack.client_order_id, status = ?ack.status, "Entry acknowledged");
                self.state_mut(&symbol).last_decision = Some((signal.direction, now));
                self.process_fills().await?;
                Ok(SignalDecision::Submitted {
                    position_id,
                    quantity: sized.quantity,
                })
            }
            Err(e) => {
                let class = e.class();
                self.state_mut(&symbol).pending_entry = None;
                self.set_phase(&symbol, PositionPhase::Flat);
                self.escalate(&symbol, "submit entry", e.into())?;
                Ok(SignalDecision::Failed(class))
            }
        }
    }

    fn filter_signal(&self, signal: &Signal, now: DateTime<Utc>) -> Option<IgnoreReason> {
        let filter = &self.config.signal;
        if signal.direction == Direction::Flat {
            return Some(IgnoreReason::FlatDirection);
        }
        if signal.confidence < filter.min_confidence {
            return Some(IgnoreReason::LowConfidence);
        }
        if signal.adx < filter.min_adx {
            return Some(IgnoreReason::WeakTrend);
        }
        if signal.bbw < filter.min_bbw {
            return Some(IgnoreReason::NarrowBand);
        }
        let phase = self.phase(&signal.symbol);
        if phase != PositionPhase::Flat || self.ledger.position(&signal.symbol).is_some() {
            return Some(IgnoreReason::Busy(phase));
        }
        let last = self.symbols.get(&signal.symbol).and_then(|s| s.last_decision);
        if let Some((direction, at)) = last {
            let elapsed = now - at;
            if direction == signal.direction && elapsed < filter.cooldown() {
                return Some(IgnoreReason::Cooldown);
            }
            if direction != signal.direction && elapsed < filter.anti_flip() {
                return Some(IgnoreReason::AntiFlip);
            }
        }
        None
    }

    /// 대기 중인 체결 이벤트 적용.
    pub async fn process_fills(&mut self) -> EngineResult<()> {
        for fill in self.adapter.poll_fills() {
            self.apply_fill_event(fill).await?;
        }
        Ok(())
    }

    /// 체결 이벤트 한 건 적용.
    async fn apply_fill_event(&mut self, fill: FillEvent) -> EngineResult<()> {
        let Some(parts) = ClientOrderId::parse(&fill.client_order_id) else {
            warn!(
                symbol = %fill.symbol,
                client_order_id = %fill.client_order_id,
                "Ignoring fill for a non-engine order"
            );
            return Ok(());
        };
        let result = if parts.kind.is_increase() {
            self.apply_increase_fill(&parts, &fill).await
        } else {
            self.apply_exit_fill(&parts, &fill).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.escalate(&fill.symbol, "apply fill", e),
        }
    }

    async fn apply_increase_fill(&mut self, parts: &ClientOrderIdParts, fill: &FillEvent) -> EngineResult<()> {
        let symbol = fill.symbol.as_str();
        match self.ledger.position(symbol).map(|p| p.id.clone()) {
            None => {
                let pending = self
                    .symbols
                    .get(symbol)
                    .and_then(|s| s.pending_entry.as_ref())
                    .map(|p| p.position_id.clone())
                    .filter(|id| parts.kind == IntentKind::Entry && parts.belongs_to(id));
                let Some(position_id) = pending else {
                    warn!(
                        symbol = %symbol,
                        client_order_id = %fill.client_order_id,
                        "Drift: increase fill without a tracked position"
                    );
                    return Ok(());
                };
                let leverage = self.risk.leverage();
                let anchor = self
                    .ledger
                    .open_position(&position_id, fill, leverage)?
                    .avg_entry_price;
                let stop_pct = self.stop_pct(symbol);
                self.ledger
                    .set_initial_risk(&position_id, anchor.pct_of(stop_pct))?;
                self.state_mut(symbol).pending_entry = None;
                self.set_phase(symbol, PositionPhase::Open);
            }
            Some(position_id) if parts.belongs_to(&position_id) => {
                self.ledger.apply_fill(&position_id, fill)?;
                if self.phase(symbol) == PositionPhase::Adding {
                    self.set_phase(symbol, PositionPhase::Open);
                }
            }
            Some(position_id) => {
                warn!(
                    symbol = %symbol,
                    position_id = %position_id,
                    client_order_id = %fill.client_order_id,
                    "Drift: increase fill for a stale position"
                );
                return Ok(());
            }
        }

        if !fill.fee.is_zero() {
            self.risk
                .register_realized_pnl(-fill.fee, symbol, fill.timestamp);
        }
        self.dirty = true;
        self.maintain_exits(symbol).await
    }

    async fn apply_exit_fill(&mut self, parts: &ClientOrderIdParts, fill: &FillEvent) -> EngineResult<()> {
        let symbol = fill.symbol.as_str();
        let Some(position_id) = self.ledger.position(symbol).map(|p| p.id.clone()) else {
            warn!(
                symbol = %symbol,
                client_order_id = %fill.client_order_id,
                "Drift: exit fill without a tracked position"
            );
            return Ok(());
        };
        if !parts.belongs_to(&position_id) {
            warn!(
                symbol = %symbol,
                position_id = %position_id,
                client_order_id = %fill.client_order_id,
                "Drift: exit fill for a stale position"
            );
            return Ok(());
        }

        let outcome = self.ledger.apply_exit_fill(&position_id, fill)?;
        self.risk
            .register_realized_pnl(outcome.net_pnl(), symbol, fill.timestamp);
        self.dirty = true;

        if outcome.closes_position() {
            let reason = match outcome.kind {
                Some(ExitKind::StopLoss) => ExitReason::StopLoss,
                Some(ExitKind::TakeProfit) => ExitReason::TakeProfit,
                Some(ExitKind::Trailing) => ExitReason::Trailing,
                None => ExitReason::Flatten,
            };
            self.close_position(symbol, &position_id, reason, fill.timestamp)
                .await
        } else {
            self.set_phase(symbol, PositionPhase::Exiting);
            self.maintain_exits(symbol).await
        }
    }

    async fn close_position(
        &mut self,
        symbol: &str,
        position_id: &str,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.cancel_open_exits(symbol).await?;
        let trade = self.ledger.archive(position_id, reason, at)?;
        self.set_phase(symbol, PositionPhase::Closed);
        self.new_trades.push(trade);
        self.set_phase(symbol, PositionPhase::Flat);
        Ok(())
    }

    // ==================== 포지션 관리 ====================

    async fn manage_position(&mut self, symbol: &str, price: Price) -> EngineResult<()> {
        let Some(position) = self.ledger.snapshot(symbol) else {
            return Ok(());
        };

        if position.initial_risk > Price::ZERO {
            let atr = self.symbols.get(symbol).and_then(|s| s.atr);
            let activation = self.planner.activation_price(
                position.side,
                position.avg_entry_price,
                position.initial_risk,
            );
            let distance = self.planner.trail_distance(position.initial_risk, atr);
            if let Some(level) = self.ledger.update_trailing(
                &position.id,
                price,
                activation,
                position.avg_entry_price,
                distance,
            )? {
                debug!(symbol = %symbol, position_id = %position.id, level = %level, "Trailing level moved");
                self.dirty = true;
            }
        }

        if self.phase(symbol) == PositionPhase::Open {
            self.maybe_add(symbol, &position, price).await?;
        }
        self.maintain_exits(symbol).await
    }

    async fn maybe_add(&mut self, symbol: &str, position: &Position, price: Price) -> EngineResult<()> {
        let index = position.dca_fills.len();
        let Some(level) = self.ledger.ladder().get(index).copied() else {
            return Ok(());
        };
        if position.move_from_anchor_pct(price) > level.level_pct {
            return Ok(());
        }
        let adx = self
            .symbols
            .get(symbol)
            .and_then(|s| s.last_signal.as_ref())
            .map(|s| s.adx);
        if self.config.dca.suppressed_by_trend(adx) {
            debug!(symbol = %symbol, adx = ?adx, level = %level.level_pct, "DCA suppressed by trend filter");
            return Ok(());
        }

        let desired = position.base_quantity * level.multiplier;
        let quantity = match self.risk.check_add(desired, price, position.quantity) {
            Ok(quantity) => quantity,
            Err(rejection) => {
                debug!(symbol = %symbol, reason = %rejection, "DCA add rejected by risk manager");
                return Ok(());
            }
        };

        let client_order_id = self.next_client_id(&position.id, IntentKind::DcaAdd, index as u32);
        let intent = OrderIntent::market(
            symbol,
            position.side,
            quantity,
            IntentKind::DcaAdd,
            client_order_id.clone(),
        );
        self.set_phase(symbol, PositionPhase::Adding);
        let submitted_at = self.now();
        self.state_mut(symbol).pending_add = Some(PendingAdd {
            client_order_id: client_order_id.as_str().to_string(),
            quantity,
            submitted_at,
        });
        info!(
            symbol = %symbol,
            position_id = %position.id,
            client_order_id = %client_order_id,
            ladder_index = index,
            level_pct = %level.level_pct,
            quantity = %quantity,
            price = %price,
            "DCA add submitted"
        );

        match self.adapter.submit_order(&intent).await {
            Ok(_) => self.process_fills().await,
            Err(e) => {
                self.set_phase(symbol, PositionPhase::Open);
                self.escalate(symbol, "submit DCA add", e.into())
            }
        }
    }

    /// 원하는 청산 레그와 현재 주문을 맞춥니다.
    pub(crate) async fn maintain_exits(&mut self, symbol: &str) -> EngineResult<()> {
        let Some(position) = self.ledger.snapshot(symbol) else {
            return Ok(());
        };
        if position.is_closed() {
            return Ok(());
        }
        let now = self.now();
        let desired = self.planner.desired_exits(&position, self.stop_pct(symbol));

        let mut actions: Vec<ExitAction<'_>> = position
            .exits
            .iter()
            .filter(|e| e.is_open() && !desired.iter().any(|d| e.same_leg(d.kind, d.ladder_index)))
            .map(ExitAction::Cancel)
            .collect();
        for want in &desired {
            match position.open_exit(want.kind, want.ladder_index) {
                None => actions.push(ExitAction::Place(want)),
                Some(existing) => match self.planner.replace_decision(existing, want, now) {
                    ReplaceDecision::Keep => {}
                    ReplaceDecision::Cooldown => {
                        trace!(symbol = %symbol, kind = %want.kind, "Exit replace deferred by cooldown");
                    }
                    ReplaceDecision::Replace => actions.push(ExitAction::Replace(existing, want)),
                },
            }
        }
        actions.sort_by_key(|action| action.priority());

        for action in actions {
            match action {
                ExitAction::Cancel(existing) => {
                    self.cancel_exit(symbol, &position.id, existing).await?;
                }
                ExitAction::Replace(existing, want) => {
                    debug!(
                        symbol = %symbol,
                        kind = %want.kind,
                        ladder_index = want.ladder_index,
                        old_target = %existing.target_price,
                        new_target = %want.target_price,
                        old_quantity = %existing.remaining_quantity(),
                        new_quantity = %want.quantity,
                        "Replacing exit order"
                    );
                    if self.cancel_exit(symbol, &position.id, existing).await? {
                        self.place_exit(symbol, &position, want, now).await?;
                    }
                }
                ExitAction::Place(want) => self.place_exit(symbol, &position, want, now).await?,
            }
        }
        Ok(())
    }

    async fn place_exit(
        &mut self,
        symbol: &str,
        position: &Position,
        want: &DesiredExit,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let kind = want.kind.intent_kind();
        let client_order_id = self.next_client_id(&position.id, kind, want.ladder_index);
        let side = position.side.opposite();
        let intent = match want.kind {
            ExitKind::TakeProfit => OrderIntent::reduce_limit(
                symbol,
                side,
                want.quantity,
                want.target_price,
                kind,
                client_order_id.clone(),
            ),
            ExitKind::StopLoss | ExitKind::Trailing => OrderIntent::reduce_stop(
                symbol,
                side,
                want.quantity,
                want.target_price,
                kind,
                client_order_id.clone(),
            ),
        };

        let mut exit = want.to_planned();
        exit.client_order_id = Some(client_order_id.as_str().to_string());
        exit.last_replace_at = Some(now);
        self.ledger.register_exit(&position.id, exit)?;
        self.dirty = true;

        match self.adapter.submit_order(&intent).await {
            Ok(ack) => {
                self.ledger.set_exit_status(
                    &position.id,
                    client_order_id.as_str(),
                    ExitStatus::Live,
                    Some(ack.order_id),
                )?;
                debug!(
                    symbol = %symbol,
                    client_order_id = %client_order_id,
                    kind = %want.kind,
                    target = %want.target_price,
                    quantity = %want.quantity,
                    "Exit order placed"
                );
                Ok(())
            }
            Err(e) => {
                self.ledger.set_exit_status(
                    &position.id,
                    client_order_id.as_str(),
                    ExitStatus::Cancelled,
                    None,
                )?;
                self.escalate(symbol, "place exit", e.into())
            }
        }
    }

    /// 청산 주문 취소. 취소하지 못했으면 false.
    async fn cancel_exit(&mut self, symbol: &str, position_id: &str, exit: &ExitOrder) -> EngineResult<bool> {
        let Some(client_order_id) = exit.client_order_id.as_deref() else {
            return Ok(true);
        };
        if exit.is_live() {
            match self.adapter.cancel_order(symbol, client_order_id).await {
                Ok(()) => {}
                Err(ExchangeError::OrderNotFound(_)) => {
                    debug!(symbol = %symbol, client_order_id = %client_order_id, "Exit order already gone");
                }
                Err(e) => {
                    self.escalate(symbol, "cancel exit", e.into())?;
                    return Ok(false);
                }
            }
        }
        self.ledger
            .set_exit_status(position_id, client_order_id, ExitStatus::Cancelled, None)?;
        self.dirty = true;
        Ok(true)
    }

    async fn cancel_open_exits(&mut self, symbol: &str) -> EngineResult<()> {
        let Some(position) = self.ledger.snapshot(symbol) else {
            return Ok(());
        };
        for exit in position.exits.iter().filter(|e| e.is_open()) {
            self.cancel_exit(symbol, &position.id, exit).await?;
        }
        Ok(())
    }

    /// 심볼의 포지션을 시장가로 강제 청산.
    pub async fn flatten(&mut self, symbol: &str) -> EngineResult<()> {
        let Some(position) = self.ledger.snapshot(symbol) else {
            return Ok(());
        };
        self.cancel_open_exits(symbol).await?;
        self.set_phase(symbol, PositionPhase::Exiting);

        let client_order_id = self.next_client_id(&position.id, IntentKind::Flatten, 0);
        let intent = OrderIntent::market(
            symbol,
            position.side.opposite(),
            position.quantity,
            IntentKind::Flatten,
            client_order_id.clone(),
        );
        info!(
            symbol = %symbol,
            position_id = %position.id,
            client_order_id = %client_order_id,
            quantity = %position.quantity,
            "Flattening position"
        );
        match self.adapter.submit_order(&intent).await {
            Ok(_) => self.process_fills().await,
            Err(e) => self.escalate(symbol, "flatten", e.into()),
        }
    }

    /// 모든 열린 포지션 강제 청산.
    pub async fn flatten_all(&mut self) -> EngineResult<()> {
        let symbols: Vec<String> = self.ledger.positions().map(|p| p.symbol.clone()).collect();
        for symbol in symbols {
            self.flatten(&symbol).await?;
        }
        Ok(())
    }

    // ==================== 거래일 ====================

    /// 논리 시계의 날짜가 바뀌었으면 일일 카운터를 롤오버합니다.
    pub fn check_rollover(&mut self) -> bool {
        let day = self.now().date_naive();
        if day <= self.risk.account().trading_day {
            return false;
        }
        let rolled = self.risk.on_day_rollover(day);
        if rolled {
            info!(
                day = %day,
                equity = %self.risk.equity(),
                "Trading day rolled over"
            );
            self.dirty = true;
        }
        rolled
    }

    /// 다음 UTC 자정까지 남은 시간.
    pub fn until_next_rollover(&self) -> Duration {
        let now = self.now();
        let next_midnight = (now.date_naive() + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc());
        match next_midnight {
            Some(at) => at - now,
            None => Duration::hours(24),
        }
    }

    // ==================== 조정 루프 지원 ====================

    pub(crate) fn ledger_mut(&mut self) -> &mut PositionLedger {
        &mut self.ledger
    }

    pub(crate) fn risk_mut(&mut self) -> &mut RiskManager {
        &mut self.risk
    }

    /// 원격에서 종료된 포지션 기록.
    pub(crate) fn record_remote_close(&mut self, symbol: &str, trade: Trade) {
        self.new_trades.push(trade);
        self.state_mut(symbol).pending_entry = None;
        self.set_phase(symbol, PositionPhase::Closed);
        self.set_phase(symbol, PositionPhase::Flat);
        self.dirty = true;
    }

    /// 로컬에 없는 원격 포지션 채택.
    pub(crate) fn adopt_remote(&mut self, remote: &PositionSnapshot) -> EngineResult<()> {
        let leverage = self.risk.leverage();
        let now = self.now();
        let position = self.ledger.adopt_remote(remote, leverage, now)?;
        let (position_id, anchor) = (position.id.clone(), position.avg_entry_price);

        let stop_pct = self.config.exits.sl_fixed_pct;
        self.ledger
            .set_initial_risk(&position_id, anchor.pct_of(stop_pct))?;
        {
            let state = self.state_mut(&remote.symbol);
            state.stop_pct = stop_pct;
            state.pending_entry = None;
        }
        self.set_phase(&remote.symbol, PositionPhase::Open);
        self.dirty = true;
        Ok(())
    }

    /// 오래된 진입 대기 상태 해제 (체결 없이 원격도 비어 있음).
    pub(crate) fn clear_stale_pending(&mut self, symbol: &str, max_age: Duration) -> bool {
        let now = self.now();
        let stale = self
            .symbols
            .get(symbol)
            .and_then(|s| s.pending_entry.as_ref())
            .is_some_and(|p| now - p.submitted_at >= max_age);
        if !stale || self.ledger.position(symbol).is_some() {
            return false;
        }
        warn!(symbol = %symbol, "Drift: pending entry never filled, releasing slot");
        self.state_mut(symbol).pending_entry = None;
        self.set_phase(symbol, PositionPhase::Flat);
        true
    }

    /// 체결 보고가 오지 않은 오래된 DCA 추가 주문 정리.
    ///
    /// 거래소 수량에 추가분이 반영되어 있으면 누락된 체결을 복구하고, 아니면 `Open`으로 되돌립니다.
    /// 원장 수량 보정보다 먼저 호출해야 추가분이 드리프트로 처리되지 않습니다.
    pub(crate) async fn resolve_stale_add(
        &mut self,
        remote: &PositionSnapshot,
        max_age: Duration,
    ) -> EngineResult<PendingAddState> {
        let symbol = remote.symbol.as_str();
        let now = self.now();
        if self.phase(symbol) != PositionPhase::Adding {
            return Ok(PendingAddState::Idle);
        }
        let Some(pending) = self.symbols.get(symbol).and_then(|s| s.pending_add.clone()) else {
            return Ok(PendingAddState::Idle);
        };
        if now - pending.submitted_at < max_age {
            return Ok(PendingAddState::InFlight);
        }
        let Some(position) = self.ledger.position(symbol) else {
            self.set_phase(symbol, PositionPhase::Flat);
            return Ok(PendingAddState::Resolved);
        };
        let (side, local_quantity, local_avg) =
            (position.side, position.quantity, position.avg_entry_price);

        let tolerance = self.config.reconcile.quantity_tolerance;
        let filled_remotely = remote.side == Some(side)
            && remote.quantity + tolerance >= local_quantity + pending.quantity;
        if !filled_remotely {
            warn!(
                symbol = %symbol,
                client_order_id = %pending.client_order_id,
                "Drift: DCA add never filled, releasing"
            );
            self.set_phase(symbol, PositionPhase::Open);
            self.dirty = true;
            return Ok(PendingAddState::Resolved);
        }

        // 거래소 평균가에서 추가분의 체결가를 역산
        let implied = (remote.entry_price * remote.quantity - local_avg * local_quantity)
            / pending.quantity;
        let price = if implied > Decimal::ZERO {
            implied
        } else {
            self.symbols
                .get(symbol)
                .and_then(|s| s.last_price)
                .unwrap_or(remote.entry_price)
        };
        warn!(
            symbol = %symbol,
            client_order_id = %pending.client_order_id,
            quantity = %pending.quantity,
            price = %price,
            "Drift: DCA fill missing, recovered from exchange position"
        );
        let fill = FillEvent {
            symbol: symbol.to_string(),
            order_id: String::new(),
            client_order_id: pending.client_order_id,
            side,
            quantity: pending.quantity,
            price,
            fee: Decimal::ZERO,
            is_maker: false,
            timestamp: now,
        };
        self.apply_fill_event(fill).await?;
        Ok(PendingAddState::Resolved)
    }

    /// 거래소에 없는 라이브 청산 주문을 취소 상태로 표시합니다. 다음 유지 작업에서 재제출됩니다.
    pub(crate) fn mark_exit_missing(&mut self, symbol: &str, client_order_id: &str) -> EngineResult<()> {
        let Some(position_id) = self.ledger.position(symbol).map(|p| p.id.clone()) else {
            return Ok(());
        };
        warn!(symbol = %symbol, client_order_id = %client_order_id, "Drift: live exit order missing on exchange");
        self.ledger
            .set_exit_status(&position_id, client_order_id, ExitStatus::Cancelled, None)?;
        self.dirty = true;
        Ok(())
    }

    /// 추적되지 않는 엔진 주문 취소.
    pub(crate) async fn cancel_orphan(&mut self, symbol: &str, client_order_id: &str) -> EngineResult<()> {
        warn!(symbol = %symbol, client_order_id = %client_order_id, "Drift: cancelling orphaned engine order");
        match self.adapter.cancel_order(symbol, client_order_id).await {
            Ok(()) | Err(ExchangeError::OrderNotFound(_)) => Ok(()),
            Err(e) => self.escalate(symbol, "cancel orphan", e.into()),
        }
    }

    // ==================== 내부 ====================

    /// 에러 처리 정책: 치명적 에러는 백테스트에서 실행을 중단하고, 그 외는 기록 후 계속합니다.
    pub(crate) fn escalate(&self, symbol: &str, action: &str, err: EngineError) -> EngineResult<()> {
        let class = err.class();
        match class {
            ErrorClass::Fatal => {
                error!(symbol = %symbol, action = %action, error = %err, class = %class, "Engine action failed");
                if self.mode() == ExecutionMode::Backtest {
                    return Err(err);
                }
            }
            ErrorClass::Drift => {
                warn!(symbol = %symbol, action = %action, error = %err, class = %class, "Drift incident");
            }
            ErrorClass::Transient | ErrorClass::CircuitOpen => {
                warn!(symbol = %symbol, action = %action, error = %err, class = %class, "Engine action deferred");
            }
        }
        Ok(())
    }

    fn next_client_id(&mut self, position_id: &str, kind: IntentKind, ladder_index: u32) -> ClientOrderId {
        self.nonce += 1;
        ClientOrderId::new(position_id, kind, ladder_index, self.nonce)
    }

    fn stop_pct(&self, symbol: &str) -> Percentage {
        self.symbols
            .get(symbol)
            .map(|s| s.stop_pct)
            .filter(|pct| *pct > Percentage::ZERO)
            .unwrap_or(self.config.exits.sl_fixed_pct)
    }

    fn state_mut(&mut self, symbol: &str) -> &mut SymbolState {
        self.symbols.entry(symbol.to_string()).or_default()
    }

    fn set_phase(&mut self, symbol: &str, phase: PositionPhase) {
        let state = self.state_mut(symbol);
        let from = state.phase;
        if from == phase {
            return;
        }
        state.phase = phase;
        if phase != PositionPhase::Adding {
            state.pending_add = None;
        }
        info!(symbol = %symbol, from = %from, to = %phase, "Phase transition");
    }
}

/// 저장된 R과 앵커 가격에서 손절 거리 복원.
fn stop_pct_of(position: &Position, fallback: Percentage) -> Percentage {
    if position.initial_risk > Price::ZERO && position.anchor_price > Price::ZERO {
        position.initial_risk / position.anchor_price * Percentage::ONE_HUNDRED
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::SimulatedAdapter;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use trader_core::{ManualClock, Side};
    use trader_exchange::SimulatedConfig;
    use trader_risk::RiskConfig;

    const BTC: &str = "BTCUSDT";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn engine() -> OrderLifecycleEngine<SimulatedAdapter> {
        engine_with(EngineConfig::default())
    }

    fn engine_with(config: EngineConfig) -> OrderLifecycleEngine<SimulatedAdapter> {
        let adapter = SimulatedAdapter::backtest(
            SimulatedConfig::default()
                .frictionless()
                .with_initial_equity(dec!(10000)),
            t(0),
        );
        let risk = RiskManager::new(
            RiskConfig::default(),
            dec!(10000),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        OrderLifecycleEngine::new(config, risk, adapter, &[BTC.to_string()]).unwrap()
    }

    fn signal(direction: Direction, adx: f64, secs: i64) -> Signal {
        Signal::new(BTC, direction, 0.9, adx, t(secs))
    }

    async fn tick(engine: &mut OrderLifecycleEngine<SimulatedAdapter>, price: Price, secs: i64) {
        engine.on_tick(&Tick::new(BTC, price, t(secs))).await.unwrap();
    }

    async fn open_long(engine: &mut OrderLifecycleEngine<SimulatedAdapter>, adx: f64) {
        tick(engine, dec!(50000), 0).await;
        let decision = engine.on_signal(signal(Direction::Long, adx, 0)).await.unwrap();
        assert_eq!(
            decision,
            SignalDecision::Submitted {
                position_id: "BTCUSDT-1".to_string(),
                quantity: dec!(0.1),
            }
        );
    }

    fn live_exit(engine: &OrderLifecycleEngine<SimulatedAdapter>, kind: ExitKind, index: u32) -> ExitOrder {
        engine
            .ledger()
            .position(BTC)
            .and_then(|p| p.open_exit(kind, index))
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_entry_fill_plans_exit_ladder() {
        let mut engine = engine();
        open_long(&mut engine, 30.0).await;

        assert_eq!(engine.phase(BTC), PositionPhase::Open);
        let position = engine.ledger().position(BTC).unwrap();
        assert_eq!(position.quantity, dec!(0.1));
        assert_eq!(position.initial_risk, dec!(500));

        let stop = live_exit(&engine, ExitKind::StopLoss, 0);
        assert!(stop.is_live());
        assert_eq!(stop.target_price, dec!(49500));
        assert_eq!(stop.quantity, dec!(0.1));
        assert_eq!(live_exit(&engine, ExitKind::TakeProfit, 0).target_price, dec!(50250));
        assert_eq!(live_exit(&engine, ExitKind::TakeProfit, 2).quantity, dec!(0.025));

        // 손절 1 + 익절 3 이 거래소에 대기
        assert_eq!(engine.adapter().exchange().fetch_open_orders(BTC).len(), 4);
        assert!(engine.take_dirty());
    }

    #[tokio::test]
    async fn test_take_profits_then_trailing_close() {
        let mut engine = engine();
        open_long(&mut engine, 30.0).await;

        tick(&mut engine, dec!(50300), 10).await;
        assert_eq!(engine.phase(BTC), PositionPhase::Exiting);
        assert_eq!(engine.ledger().position(BTC).unwrap().quantity, dec!(0.06));
        // 수량 변경으로 손절 즉시 교체
        assert_eq!(live_exit(&engine, ExitKind::StopLoss, 0).quantity, dec!(0.06));

        tick(&mut engine, dec!(50600), 20).await;
        let position = engine.ledger().position(BTC).unwrap();
        assert_eq!(position.quantity, dec!(0.025));
        assert_eq!(position.trailing.level, Some(dec!(50100)));
        assert_eq!(live_exit(&engine, ExitKind::Trailing, 0).target_price, dec!(50100));

        tick(&mut engine, dec!(50050), 30).await;
        assert_eq!(engine.phase(BTC), PositionPhase::Flat);
        assert!(engine.ledger().position(BTC).is_none());

        let trades = engine.take_closed_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::Trailing);
        // 10 + 21 + 1.25
        assert_eq!(trades[0].realized_pnl, dec!(32.25));
        assert_eq!(engine.risk().equity(), dec!(10032.25));
        assert!(engine.adapter().exchange().fetch_open_orders(BTC).is_empty());
    }

    #[tokio::test]
    async fn test_adverse_move_adds_dca_and_replans() {
        let mut engine = engine();
        // ADX 25 는 추세 필터 기준을 넘지 않음
        open_long(&mut engine, 25.0).await;

        tick(&mut engine, dec!(49700), 10).await;
        assert_eq!(engine.phase(BTC), PositionPhase::Open);
        let position = engine.ledger().position(BTC).unwrap();
        assert_eq!(position.dca_fills.len(), 1);
        assert_eq!(position.quantity, dec!(0.2));
        assert_eq!(position.avg_entry_price, dec!(49850));

        let stop = live_exit(&engine, ExitKind::StopLoss, 0);
        assert_eq!(stop.target_price, dec!(49351.5));
        assert_eq!(stop.quantity, dec!(0.2));
        assert_eq!(position.live_stop_count(), 1);

        // 같은 레벨에서 재진입하지 않음
        tick(&mut engine, dec!(49690), 11).await;
        assert_eq!(engine.ledger().position(BTC).unwrap().dca_fills.len(), 1);
    }

    #[tokio::test]
    async fn test_strong_trend_suppresses_dca() {
        let mut engine = engine();
        open_long(&mut engine, 40.0).await;

        tick(&mut engine, dec!(49700), 10).await;
        let position = engine.ledger().position(BTC).unwrap();
        assert!(position.dca_fills.is_empty());
        assert_eq!(position.quantity, dec!(0.1));
    }

    #[tokio::test]
    async fn test_stop_loss_close_and_signal_windows() {
        let mut engine = engine();
        open_long(&mut engine, 40.0).await;

        tick(&mut engine, dec!(49400), 30).await;
        let trades = engine.take_closed_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(trades[0].realized_pnl, dec!(-60));

        // 같은 방향: 쿨다운 300초
        let decision = engine.on_signal(signal(Direction::Long, 40.0, 30)).await.unwrap();
        assert_eq!(decision, SignalDecision::Ignored(IgnoreReason::Cooldown));

        // 반대 방향: 60초 이전 금지, 이후 허용
        let decision = engine.on_signal(signal(Direction::Short, 40.0, 30)).await.unwrap();
        assert_eq!(decision, SignalDecision::Ignored(IgnoreReason::AntiFlip));

        tick(&mut engine, dec!(49400), 61).await;
        let decision = engine.on_signal(signal(Direction::Short, 40.0, 61)).await.unwrap();
        assert!(matches!(decision, SignalDecision::Submitted { .. }));
        assert_eq!(engine.ledger().position(BTC).unwrap().side, Side::Sell);
    }

    #[tokio::test]
    async fn test_signal_filters() {
        let mut engine = engine();

        let decision = engine.on_signal(signal(Direction::Long, 30.0, 0)).await.unwrap();
        assert_eq!(decision, SignalDecision::Ignored(IgnoreReason::NoMarketPrice));

        tick(&mut engine, dec!(50000), 0).await;
        let weak = Signal::new(BTC, Direction::Long, 0.5, 30.0, t(0));
        assert_eq!(
            engine.on_signal(weak).await.unwrap(),
            SignalDecision::Ignored(IgnoreReason::LowConfidence)
        );
        assert_eq!(
            engine.on_signal(signal(Direction::Long, 10.0, 0)).await.unwrap(),
            SignalDecision::Ignored(IgnoreReason::WeakTrend)
        );
        assert_eq!(
            engine.on_signal(signal(Direction::Flat, 30.0, 0)).await.unwrap(),
            SignalDecision::Ignored(IgnoreReason::FlatDirection)
        );

        open_long(&mut engine, 30.0).await;
        assert_eq!(
            engine.on_signal(signal(Direction::Short, 30.0, 0)).await.unwrap(),
            SignalDecision::Ignored(IgnoreReason::Busy(PositionPhase::Open))
        );
    }

    #[tokio::test]
    async fn test_narrow_band_signal_ignored() {
        let mut config = EngineConfig::default();
        config.signal.min_bbw = 0.01;
        let mut engine = engine_with(config);
        tick(&mut engine, dec!(50000), 0).await;

        let narrow = signal(Direction::Long, 30.0, 0).with_bbw(0.004);
        assert_eq!(
            engine.on_signal(narrow).await.unwrap(),
            SignalDecision::Ignored(IgnoreReason::NarrowBand)
        );
        // 무시된 시그널은 쿨다운을 시작하지 않음
        let wide = signal(Direction::Long, 30.0, 0).with_bbw(0.02);
        assert!(matches!(
            engine.on_signal(wide).await.unwrap(),
            SignalDecision::Submitted { .. }
        ));
    }

    #[tokio::test]
    async fn test_daily_loss_rejects_entry() {
        let mut engine = engine();
        tick(&mut engine, dec!(50000), 0).await;
        engine.risk.register_realized_pnl(dec!(-600), BTC, t(0));

        let decision = engine.on_signal(signal(Direction::Long, 30.0, 0)).await.unwrap();
        match decision {
            SignalDecision::Rejected(rejection) => assert!(rejection.is_daily_limit()),
            other => panic!("unexpected decision: {:?}", other),
        }
        assert_eq!(engine.phase(BTC), PositionPhase::Flat);

        // 다음 날 첫 틱에서 롤오버 후 진입 가능
        tick(&mut engine, dec!(50000), 86_400).await;
        assert!(!engine.check_rollover());
        assert_eq!(engine.risk().account().trading_day, t(86_400).date_naive());
        let decision = engine.on_signal(signal(Direction::Long, 30.0, 86_400)).await.unwrap();
        assert!(matches!(decision, SignalDecision::Submitted { .. }));
    }

    #[tokio::test]
    async fn test_flatten_archives_and_cancels_exits() {
        let mut engine = engine();
        open_long(&mut engine, 30.0).await;
        tick(&mut engine, dec!(50100), 5).await;

        engine.flatten_all().await.unwrap();
        assert_eq!(engine.phase(BTC), PositionPhase::Flat);
        let trades = engine.take_closed_trades();
        assert_eq!(trades[0].exit_reason, ExitReason::Flatten);
        assert_eq!(trades[0].realized_pnl, dec!(10));
        assert!(engine.adapter().exchange().fetch_open_orders(BTC).is_empty());
        assert!(engine.adapter().exchange().fetch_position(BTC).is_flat());
    }

    #[tokio::test]
    async fn test_recovery_snapshot_restores_position() {
        let mut engine = engine();
        open_long(&mut engine, 30.0).await;
        let snapshot = engine.recovery_snapshot();
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.nonce, 5);

        let mut restored = self::engine();
        restored.restore(snapshot).unwrap();
        assert_eq!(restored.phase(BTC), PositionPhase::Open);
        assert_eq!(restored.stop_pct(BTC), dec!(1));
        assert_eq!(restored.nonce, 5);
        assert_eq!(restored.ledger().position(BTC).unwrap().id, "BTCUSDT-1");
    }

    #[test]
    fn test_fatal_errors_abort_only_backtest() {
        let backtest = engine();
        let err = EngineError::Ledger(LedgerError::Invariant("boom".to_string()));
        assert!(backtest.escalate(BTC, "test", err).is_err());

        let drift = EngineError::Ledger(LedgerError::PositionNotFound("BTCUSDT-9".to_string()));
        assert!(backtest.escalate(BTC, "test", drift).is_ok());

        let clock = Arc::new(ManualClock::new(t(0)));
        let paper = OrderLifecycleEngine::new(
            EngineConfig::default(),
            RiskManager::new(RiskConfig::default(), dec!(10000), t(0).date_naive()),
            SimulatedAdapter::paper_with_clock(SimulatedConfig::default(), clock),
            &[BTC.to_string()],
        )
        .unwrap();
        let err = EngineError::Ledger(LedgerError::Invariant("boom".to_string()));
        assert!(paper.escalate(BTC, "test", err).is_ok());
    }

    #[test]
    fn test_until_next_rollover() {
        let engine = engine();
        assert_eq!(engine.until_next_rollover(), Duration::days(1));
    }
}
