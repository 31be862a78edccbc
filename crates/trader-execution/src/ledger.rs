//! 포지션 원장.
//!
//! 제공 기능:
//! - 확정된 체결에 따른 포지션 생성/증가/감소
//! - DCA 체결과 청산 주문 기록
//! - 종료된 포지션의 거래 기록 보관
//! - 거래소 스냅샷과의 조정 및 원격 포지션 채택
//! - 복구 스냅샷 내보내기/가져오기
//!
//! 원장은 단일 작성자가 소유하며 모든 변경 메서드는 `&mut self` 동기 메서드입니다.
//! 심볼당 열린 포지션은 하나입니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use trader_core::{
    ClientOrderId, DcaFill, ErrorClass, ExitKind, ExitOrder, ExitReason, ExitStatus, FillEvent,
    IntentKind, Position, PositionSnapshot, Price, Quantity, Trade, TraderError,
};

use crate::config::DcaLevel;

/// 원장 에러 타입.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position already open for symbol: {0}")]
    PositionExists(String),

    #[error("Exit order not found: {0}")]
    ExitNotFound(String),

    #[error("Fill is not an engine order: {0}")]
    ForeignFill(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl LedgerError {
    /// 에러 분류. 불변식 위반은 치명적, 나머지는 조정 대상입니다.
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::Invariant(_) | LedgerError::PositionExists(_) => ErrorClass::Fatal,
            LedgerError::PositionNotFound(_)
            | LedgerError::ExitNotFound(_)
            | LedgerError::ForeignFill(_) => ErrorClass::Drift,
        }
    }
}

impl From<TraderError> for LedgerError {
    fn from(err: TraderError) -> Self {
        match err {
            TraderError::Invariant(msg) => LedgerError::Invariant(msg),
            other => LedgerError::Invariant(other.to_string()),
        }
    }
}

impl From<LedgerError> for TraderError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Invariant(msg) => TraderError::Invariant(msg),
            other => TraderError::Position(other.to_string()),
        }
    }
}

/// 청산 체결 적용 결과.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitFill {
    /// 청산 레그 종류 (강제 청산이면 None)
    pub kind: Option<ExitKind>,
    /// 이 체결의 실현 손익 (수수료 차감 전)
    pub realized_pnl: Decimal,
    /// 이 체결의 수수료
    pub fee: Decimal,
    /// 남은 포지션 수량
    pub remaining: Quantity,
}

impl ExitFill {
    /// 수수료 차감 후 손익.
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.fee
    }

    /// 포지션이 종료되었는지 확인.
    pub fn closes_position(&self) -> bool {
        self.remaining.is_zero()
    }
}

/// 조정 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// 일치
    InSync,
    /// 허용 오차를 넘는 차이를 원격 값으로 보정
    Corrected {
        position_id: String,
        local: Quantity,
        remote: Quantity,
        /// 감소 보정으로 실현된 손익
        realized_pnl: Decimal,
    },
    /// 원격에서 청산됨 (또는 방향이 달라짐). 마크 가격으로 보관
    ClosedRemotely { trade: Trade, realized_pnl: Decimal },
    /// 로컬에 없는 원격 포지션
    UnknownRemote(PositionSnapshot),
}

/// 단일 작성자 포지션 원장.
#[derive(Debug)]
pub struct PositionLedger {
    /// 심볼별 열린 포지션
    positions: BTreeMap<String, Position>,
    /// 종료된 포지션의 거래 기록
    closed: Vec<Trade>,
    /// DCA 래더
    ladder: Vec<DcaLevel>,
    /// 조정 허용 오차
    tolerance: Quantity,
    /// 포지션 ID 시퀀스
    position_seq: u64,
}

impl PositionLedger {
    /// 새 원장 생성.
    pub fn new(ladder: Vec<DcaLevel>, tolerance: Quantity) -> Self {
        Self {
            positions: BTreeMap::new(),
            closed: Vec::new(),
            ladder,
            tolerance,
            position_seq: 0,
        }
    }

    /// 다음 포지션 ID 발급 (예: "BTCUSDT-7").
    pub fn next_position_id(&mut self, symbol: &str) -> String {
        self.position_seq += 1;
        format!("{}-{}", symbol, self.position_seq)
    }

    // ==================== 체결 ====================

    /// 최초 진입 체결로 포지션 생성.
    pub fn open_position(
        &mut self,
        position_id: &str,
        fill: &FillEvent,
        leverage: u32,
    ) -> Result<&Position, LedgerError> {
        if self.positions.contains_key(&fill.symbol) {
            return Err(LedgerError::PositionExists(fill.symbol.clone()));
        }

        let mut position = Position::open(
            position_id,
            &fill.symbol,
            fill.side,
            fill.quantity,
            fill.price,
            leverage,
            fill.timestamp,
        );
        position.fees = fill.fee;

        info!(
            position_id = %position_id,
            symbol = %fill.symbol,
            side = ?fill.side,
            quantity = %fill.quantity,
            price = %fill.price,
            "Position opened"
        );
        Ok(self.positions.entry(fill.symbol.clone()).or_insert(position))
    }

    /// 진입/DCA 체결 반영.
    pub fn apply_fill(&mut self, position_id: &str, fill: &FillEvent) -> Result<&Position, LedgerError> {
        let parts = ClientOrderId::parse(&fill.client_order_id)
            .ok_or_else(|| LedgerError::ForeignFill(fill.client_order_id.clone()))?;
        let level = match parts.kind {
            IntentKind::DcaAdd => Some(
                self.ladder
                    .get(parts.ladder_index as usize)
                    .copied()
                    .ok_or_else(|| {
                        LedgerError::Invariant(format!(
                            "DCA index {} beyond ladder length {}",
                            parts.ladder_index,
                            self.ladder.len()
                        ))
                    })?,
            ),
            IntentKind::Entry => None,
            other => {
                return Err(LedgerError::Invariant(format!(
                    "{:?} fill applied as an increase: {}",
                    other, fill.client_order_id
                )))
            }
        };

        let position = self.find_mut(position_id)?;
        if position.side != fill.side {
            return Err(LedgerError::Invariant(format!(
                "increase fill side {:?} does not match position {} side {:?}",
                fill.side, position_id, position.side
            )));
        }

        match level {
            None => {
                position.add_entry(fill.quantity, fill.price, fill.timestamp);
                if position.dca_fills.is_empty() {
                    // 분할 체결된 최초 진입은 앵커/기준 수량을 함께 갱신
                    position.anchor_price = position.avg_entry_price;
                    position.base_quantity = position.quantity;
                }
            }
            Some(level) => {
                Self::record_dca(position, parts.ladder_index, level, fill)?;
                position.add_entry(fill.quantity, fill.price, fill.timestamp);
            }
        }
        position.fees += fill.fee;

        debug!(
            position_id = %position_id,
            kind = ?parts.kind,
            quantity = %position.quantity,
            avg_entry_price = %position.avg_entry_price,
            "Increase fill applied"
        );
        Ok(position)
    }

    fn record_dca(
        position: &mut Position,
        ladder_index: u32,
        level: DcaLevel,
        fill: &FillEvent,
    ) -> Result<(), LedgerError> {
        // 같은 주문의 분할 체결은 하나의 DCA 체결로 합칩니다
        if let Some(last) = position.dca_fills.last_mut() {
            if last.ladder_index == ladder_index {
                let total = last.quantity + fill.quantity;
                last.price = (last.price * last.quantity + fill.price * fill.quantity) / total;
                last.quantity = total;
                return Ok(());
            }
            if level.level_pct >= last.level_pct {
                return Err(LedgerError::Invariant(format!(
                    "DCA level {} is not deeper than {} for {}",
                    level.level_pct, last.level_pct, position.id
                )));
            }
        }
        if ladder_index as usize != position.dca_fills.len() {
            return Err(LedgerError::Invariant(format!(
                "DCA index {} out of order for {} ({} fills recorded)",
                ladder_index,
                position.id,
                position.dca_fills.len()
            )));
        }

        position.dca_fills.push(DcaFill {
            ladder_index,
            level_pct: level.level_pct,
            multiplier: level.multiplier,
            price: fill.price,
            quantity: fill.quantity,
            timestamp: fill.timestamp,
        });
        Ok(())
    }

    /// 청산 체결 반영 (손절/익절/트레일링/강제 청산).
    pub fn apply_exit_fill(&mut self, position_id: &str, fill: &FillEvent) -> Result<ExitFill, LedgerError> {
        let parts = ClientOrderId::parse(&fill.client_order_id)
            .ok_or_else(|| LedgerError::ForeignFill(fill.client_order_id.clone()))?;
        let kind = match parts.kind {
            IntentKind::StopLoss => Some(ExitKind::StopLoss),
            IntentKind::TakeProfit => Some(ExitKind::TakeProfit),
            IntentKind::Trailing => Some(ExitKind::Trailing),
            IntentKind::Flatten => None,
            other => {
                return Err(LedgerError::Invariant(format!(
                    "{:?} fill applied as an exit: {}",
                    other, fill.client_order_id
                )))
            }
        };

        let position = self.find_mut(position_id)?;
        let realized_pnl = position.reduce(fill.quantity, fill.price, fill.timestamp)?;
        position.fees += fill.fee;

        match position
            .exits
            .iter_mut()
            .find(|e| e.client_order_id.as_deref() == Some(fill.client_order_id.as_str()))
        {
            Some(exit) => {
                exit.filled_quantity += fill.quantity;
                if exit.filled_quantity >= exit.quantity {
                    exit.status = ExitStatus::Filled;
                }
            }
            None if kind.is_some() => {
                warn!(
                    position_id = %position_id,
                    client_order_id = %fill.client_order_id,
                    "Exit fill for an untracked exit order"
                );
            }
            None => {}
        }

        debug!(
            position_id = %position_id,
            kind = ?kind,
            quantity = %fill.quantity,
            price = %fill.price,
            realized_pnl = %realized_pnl,
            remaining = %position.quantity,
            "Exit fill applied"
        );
        Ok(ExitFill {
            kind,
            realized_pnl,
            fee: fill.fee,
            remaining: position.quantity,
        })
    }

    // ==================== 보관 ====================

    /// 수량이 0이 된 포지션을 거래 기록으로 보관.
    pub fn archive(
        &mut self,
        position_id: &str,
        reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Result<Trade, LedgerError> {
        let symbol = self.symbol_of(position_id)?;
        let position = self
            .positions
            .get(&symbol)
            .ok_or_else(|| LedgerError::PositionNotFound(position_id.to_string()))?;
        if !position.is_closed() {
            return Err(LedgerError::Invariant(format!(
                "cannot archive {} with open quantity {}",
                position_id, position.quantity
            )));
        }

        let position = self
            .positions
            .remove(&symbol)
            .ok_or_else(|| LedgerError::PositionNotFound(position_id.to_string()))?;
        let trade = Trade::from_position(&position, reason, closed_at);
        info!(
            position_id = %position_id,
            symbol = %symbol,
            reason = ?reason,
            realized_pnl = %trade.realized_pnl,
            dca_count = trade.dca_count,
            "Position archived"
        );
        self.closed.push(trade.clone());
        Ok(trade)
    }

    // ==================== 청산 주문 ====================

    /// 청산 주문 등록. 취소된 주문 기록은 정리됩니다.
    pub fn register_exit(&mut self, position_id: &str, exit: ExitOrder) -> Result<(), LedgerError> {
        let position = self.find_mut(position_id)?;
        if exit.kind == ExitKind::StopLoss && exit.is_open() && position.open_exit(ExitKind::StopLoss, 0).is_some() {
            return Err(LedgerError::Invariant(format!(
                "second stop loss registered for {}",
                position_id
            )));
        }
        position.exits.retain(|e| e.status != ExitStatus::Cancelled);
        position.exits.push(exit);
        Ok(())
    }

    /// 청산 주문 상태 갱신.
    pub fn set_exit_status(
        &mut self,
        position_id: &str,
        client_order_id: &str,
        status: ExitStatus,
        remote_order_id: Option<String>,
    ) -> Result<(), LedgerError> {
        let position = self.find_mut(position_id)?;
        let exit = position
            .exits
            .iter_mut()
            .find(|e| e.client_order_id.as_deref() == Some(client_order_id))
            .ok_or_else(|| LedgerError::ExitNotFound(client_order_id.to_string()))?;

        // 체결 완료는 되돌리지 않음
        if exit.status == ExitStatus::Filled {
            return Ok(());
        }
        exit.status = status;
        if remote_order_id.is_some() {
            exit.remote_order_id = remote_order_id;
        }
        Ok(())
    }

    /// 최초 손절 거리 R 설정.
    pub fn set_initial_risk(&mut self, position_id: &str, initial_risk: Price) -> Result<(), LedgerError> {
        self.find_mut(position_id)?.initial_risk = initial_risk;
        Ok(())
    }

    /// 트레일링 상태 갱신. 레벨이 바뀌면 새 레벨을 반환합니다.
    pub fn update_trailing(
        &mut self,
        position_id: &str,
        price: Price,
        activation_price: Price,
        break_even: Price,
        distance: Price,
    ) -> Result<Option<Price>, LedgerError> {
        let position = self.find_mut(position_id)?;
        let side = position.side;
        Ok(position
            .trailing
            .update(side, price, activation_price, break_even, distance))
    }

    // ==================== 조정 ====================

    /// 거래소 스냅샷과 조정.
    ///
    /// 수량 차이가 허용 오차를 넘으면 원격 값으로 보정하고 드리프트를 기록합니다.
    pub fn reconcile(
        &mut self,
        remote: &PositionSnapshot,
        at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, LedgerError> {
        let Some(local) = self.positions.get(&remote.symbol) else {
            if remote.is_flat() {
                return Ok(ReconcileOutcome::InSync);
            }
            warn!(
                symbol = %remote.symbol,
                side = ?remote.side,
                remote_quantity = %remote.quantity,
                "Drift: remote position unknown locally"
            );
            return Ok(ReconcileOutcome::UnknownRemote(remote.clone()));
        };

        let position_id = local.id.clone();
        let local_quantity = local.quantity;
        let side_matches = remote.side == Some(local.side);

        if remote.is_flat() || !side_matches {
            let mark = if remote.mark_price > Decimal::ZERO {
                remote.mark_price
            } else {
                local.avg_entry_price
            };
            warn!(
                position_id = %position_id,
                symbol = %remote.symbol,
                local_quantity = %local_quantity,
                remote_side = ?remote.side,
                mark_price = %mark,
                "Drift: position closed remotely, archiving at mark price"
            );
            let position = self.find_mut(&position_id)?;
            let realized_pnl = position.reduce(local_quantity, mark, at)?;
            for exit in position.exits.iter_mut().filter(|e| e.is_open()) {
                exit.status = ExitStatus::Cancelled;
            }
            let trade = self.archive(&position_id, ExitReason::Reconciled, at)?;
            return Ok(ReconcileOutcome::ClosedRemotely { trade, realized_pnl });
        }

        let diff = remote.quantity - local_quantity;
        if diff.abs() <= self.tolerance {
            return Ok(ReconcileOutcome::InSync);
        }

        let position = self.find_mut(&position_id)?;
        let realized_pnl = if diff > Decimal::ZERO {
            let price = if remote.mark_price > Decimal::ZERO {
                remote.mark_price
            } else {
                position.avg_entry_price
            };
            position.add_entry(diff, price, at);
            if remote.entry_price > Decimal::ZERO {
                position.avg_entry_price = remote.entry_price;
            }
            Decimal::ZERO
        } else {
            let mark = if remote.mark_price > Decimal::ZERO {
                remote.mark_price
            } else {
                position.avg_entry_price
            };
            position.reduce(-diff, mark, at)?
        };

        warn!(
            position_id = %position_id,
            symbol = %remote.symbol,
            local_quantity = %local_quantity,
            remote_quantity = %remote.quantity,
            "Drift: ledger quantity corrected to exchange"
        );
        Ok(ReconcileOutcome::Corrected {
            position_id,
            local: local_quantity,
            remote: remote.quantity,
            realized_pnl,
        })
    }

    /// 로컬에 없는 원격 포지션 채택.
    pub fn adopt_remote(
        &mut self,
        remote: &PositionSnapshot,
        leverage: u32,
        at: DateTime<Utc>,
    ) -> Result<&Position, LedgerError> {
        let side = remote.side.ok_or_else(|| {
            LedgerError::Invariant(format!("cannot adopt flat position for {}", remote.symbol))
        })?;
        if self.positions.contains_key(&remote.symbol) {
            return Err(LedgerError::PositionExists(remote.symbol.clone()));
        }
        let price = if remote.entry_price > Decimal::ZERO {
            remote.entry_price
        } else {
            remote.mark_price
        };
        let position_id = self.next_position_id(&remote.symbol);
        let position = Position::open(&position_id, &remote.symbol, side, remote.quantity, price, leverage, at);

        info!(
            position_id = %position_id,
            symbol = %remote.symbol,
            side = ?side,
            quantity = %remote.quantity,
            entry_price = %price,
            "Remote position adopted"
        );
        Ok(self.positions.entry(remote.symbol.clone()).or_insert(position))
    }

    // ==================== 복구 ====================

    /// 복구용 열린 포지션 목록 (심볼 순).
    pub fn export_positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    /// 포지션 ID 시퀀스.
    pub fn position_seq(&self) -> u64 {
        self.position_seq
    }

    /// 복구 스냅샷에서 포지션을 가져옵니다. 기존 포지션이 있으면 거부합니다.
    pub fn import_positions(&mut self, positions: Vec<Position>, position_seq: u64) -> Result<(), LedgerError> {
        if let Some(symbol) = self.positions.keys().next() {
            return Err(LedgerError::PositionExists(symbol.clone()));
        }
        for position in positions {
            if position.dca_fills.len() > self.ladder.len() {
                return Err(LedgerError::Invariant(format!(
                    "restored position {} has {} DCA fills, ladder has {}",
                    position.id,
                    position.dca_fills.len(),
                    self.ladder.len()
                )));
            }
            if self.positions.contains_key(&position.symbol) {
                return Err(LedgerError::PositionExists(position.symbol.clone()));
            }
            self.positions.insert(position.symbol.clone(), position);
        }
        self.position_seq = self.position_seq.max(position_seq);
        info!(count = self.positions.len(), position_seq = self.position_seq, "Ledger restored");
        Ok(())
    }

    // ==================== 조회 ====================

    /// 심볼의 열린 포지션 복사본.
    pub fn snapshot(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).cloned()
    }

    /// 심볼의 열린 포지션 참조.
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// 열린 포지션 (심볼 순).
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// 열린 포지션 수.
    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// 보관된 거래 기록.
    pub fn closed_trades(&self) -> &[Trade] {
        &self.closed
    }

    /// DCA 래더.
    pub fn ladder(&self) -> &[DcaLevel] {
        &self.ladder
    }

    fn symbol_of(&self, position_id: &str) -> Result<String, LedgerError> {
        self.positions
            .values()
            .find(|p| p.id == position_id)
            .map(|p| p.symbol.clone())
            .ok_or_else(|| LedgerError::PositionNotFound(position_id.to_string()))
    }

    fn find_mut(&mut self, position_id: &str) -> Result<&mut Position, LedgerError> {
        self.positions
            .values_mut()
            .find(|p| p.id == position_id)
            .ok_or_else(|| LedgerError::PositionNotFound(position_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use trader_core::Side;

    use crate::config::DcaConfig;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn ledger() -> PositionLedger {
        PositionLedger::new(DcaConfig::default().levels().unwrap(), dec!(0.000001))
    }

    fn fill(kind: IntentKind, index: u32, nonce: u64, side: Side, qty: Decimal, price: Decimal) -> FillEvent {
        FillEvent {
            symbol: "BTCUSDT".to_string(),
            order_id: format!("SIM-{}", nonce),
            client_order_id: ClientOrderId::new("BTCUSDT-1", kind, index, nonce).to_string(),
            side,
            quantity: qty,
            price,
            fee: dec!(0.1),
            is_maker: false,
            timestamp: at(nonce as i64),
        }
    }

    fn opened() -> PositionLedger {
        let mut ledger = ledger();
        let id = ledger.next_position_id("BTCUSDT");
        assert_eq!(id, "BTCUSDT-1");
        ledger
            .open_position(&id, &fill(IntentKind::Entry, 0, 1, Side::Buy, dec!(1), dec!(100)), 5)
            .unwrap();
        ledger
    }

    fn live_tp(index: u32, qty: Decimal, nonce: u64) -> ExitOrder {
        let mut exit = ExitOrder::planned(ExitKind::TakeProfit, index, dec!(110), dec!(0.4), qty);
        exit.client_order_id =
            Some(ClientOrderId::new("BTCUSDT-1", IntentKind::TakeProfit, index, nonce).to_string());
        exit.status = ExitStatus::Live;
        exit
    }

    #[test]
    fn test_open_and_dca_fill() {
        let mut ledger = opened();

        let position = ledger
            .apply_fill("BTCUSDT-1", &fill(IntentKind::DcaAdd, 0, 2, Side::Buy, dec!(1), dec!(99.4)))
            .unwrap();
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.avg_entry_price, dec!(99.7));
        assert_eq!(position.anchor_price, dec!(100));
        assert_eq!(position.dca_fills.len(), 1);
        assert_eq!(position.dca_fills[0].level_pct, dec!(-0.6));
        assert_eq!(position.fees, dec!(0.2));
    }

    #[test]
    fn test_split_dca_fill_merges() {
        let mut ledger = opened();
        ledger
            .apply_fill("BTCUSDT-1", &fill(IntentKind::DcaAdd, 0, 2, Side::Buy, dec!(0.5), dec!(99)))
            .unwrap();
        let position = ledger
            .apply_fill("BTCUSDT-1", &fill(IntentKind::DcaAdd, 0, 2, Side::Buy, dec!(0.5), dec!(98)))
            .unwrap();
        assert_eq!(position.dca_fills.len(), 1);
        assert_eq!(position.dca_fills[0].quantity, dec!(1));
        assert_eq!(position.dca_fills[0].price, dec!(98.5));
    }

    #[test]
    fn test_dca_out_of_order_is_invariant_violation() {
        let mut ledger = opened();
        let err = ledger
            .apply_fill("BTCUSDT-1", &fill(IntentKind::DcaAdd, 1, 2, Side::Buy, dec!(1), dec!(98)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Invariant(_)));
        assert_eq!(err.class(), ErrorClass::Fatal);

        // 래더 길이를 넘는 인덱스
        let err = ledger
            .apply_fill("BTCUSDT-1", &fill(IntentKind::DcaAdd, 3, 3, Side::Buy, dec!(1), dec!(97)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Invariant(_)));
    }

    #[test]
    fn test_exit_fill_updates_exit_and_archives() {
        let mut ledger = opened();
        ledger.register_exit("BTCUSDT-1", live_tp(0, dec!(0.4), 3)).unwrap();

        let result = ledger
            .apply_exit_fill("BTCUSDT-1", &fill(IntentKind::TakeProfit, 0, 3, Side::Sell, dec!(0.4), dec!(110)))
            .unwrap();
        assert_eq!(result.kind, Some(ExitKind::TakeProfit));
        assert_eq!(result.realized_pnl, dec!(4));
        assert_eq!(result.net_pnl(), dec!(3.9));
        assert!(!result.closes_position());
        let position = ledger.position("BTCUSDT").unwrap();
        assert_eq!(position.exits[0].status, ExitStatus::Filled);

        // 보유 수량이 남아 있으면 보관 불가
        assert!(ledger.archive("BTCUSDT-1", ExitReason::TakeProfit, at(10)).is_err());

        let result = ledger
            .apply_exit_fill("BTCUSDT-1", &fill(IntentKind::Flatten, 0, 4, Side::Sell, dec!(0.6), dec!(105)))
            .unwrap();
        assert!(result.closes_position());
        let trade = ledger.archive("BTCUSDT-1", ExitReason::Flatten, at(10)).unwrap();
        assert_eq!(trade.quantity, dec!(1));
        // 4 + 3 - 수수료 0.3
        assert_eq!(trade.realized_pnl, dec!(6.7));
        assert!(ledger.position("BTCUSDT").is_none());
        assert_eq!(ledger.closed_trades().len(), 1);
    }

    #[test]
    fn test_exit_fill_beyond_quantity_rejected() {
        let mut ledger = opened();
        let err = ledger
            .apply_exit_fill("BTCUSDT-1", &fill(IntentKind::StopLoss, 0, 3, Side::Sell, dec!(2), dec!(99)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Invariant(_)));
        assert_eq!(ledger.position("BTCUSDT").unwrap().quantity, dec!(1));
    }

    #[test]
    fn test_single_live_stop_loss() {
        let mut ledger = opened();
        let mut sl = ExitOrder::planned(ExitKind::StopLoss, 0, dec!(99), Decimal::ONE, dec!(1));
        sl.client_order_id = Some("le-1-SL0-2".to_string());
        ledger.register_exit("BTCUSDT-1", sl.clone()).unwrap();
        assert!(ledger.register_exit("BTCUSDT-1", sl).is_err());

        // 취소 후에는 새 손절 등록 가능
        ledger
            .set_exit_status("BTCUSDT-1", "le-1-SL0-2", ExitStatus::Cancelled, None)
            .unwrap();
        let mut replacement = ExitOrder::planned(ExitKind::StopLoss, 0, dec!(98), Decimal::ONE, dec!(1));
        replacement.client_order_id = Some("le-1-SL0-3".to_string());
        ledger.register_exit("BTCUSDT-1", replacement).unwrap();
        assert_eq!(ledger.position("BTCUSDT").unwrap().exits.len(), 1);
    }

    #[test]
    fn test_reconcile_corrects_quantity_drift() {
        let mut ledger = opened();
        let remote = PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: Some(Side::Buy),
            quantity: dec!(0.7),
            entry_price: dec!(100),
            mark_price: dec!(102),
        };

        let outcome = ledger.reconcile(&remote, at(20)).unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Corrected {
                position_id: "BTCUSDT-1".to_string(),
                local: dec!(1),
                remote: dec!(0.7),
                realized_pnl: dec!(0.6),
            }
        );
        assert_eq!(ledger.snapshot("BTCUSDT").unwrap().quantity, dec!(0.7));

        // 다시 조정하면 일치
        assert_eq!(ledger.reconcile(&remote, at(21)).unwrap(), ReconcileOutcome::InSync);
    }

    #[test]
    fn test_reconcile_increase_takes_remote_entry() {
        let mut ledger = opened();
        let remote = PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: Some(Side::Buy),
            quantity: dec!(1.5),
            entry_price: dec!(99.5),
            mark_price: dec!(99),
        };
        ledger.reconcile(&remote, at(20)).unwrap();
        let position = ledger.position("BTCUSDT").unwrap();
        assert_eq!(position.quantity, dec!(1.5));
        assert_eq!(position.avg_entry_price, dec!(99.5));
    }

    #[test]
    fn test_reconcile_remote_flat_archives_at_mark() {
        let mut ledger = opened();
        let outcome = ledger
            .reconcile(&PositionSnapshot::flat("BTCUSDT", dec!(97)), at(30))
            .unwrap();
        match outcome {
            ReconcileOutcome::ClosedRemotely { trade, realized_pnl } => {
                assert_eq!(realized_pnl, dec!(-3));
                assert_eq!(trade.avg_exit_price, dec!(97));
                assert_eq!(trade.exit_reason, ExitReason::Reconciled);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ledger.open_count(), 0);
    }

    #[test]
    fn test_unknown_remote_is_adopted() {
        let mut ledger = ledger();
        let remote = PositionSnapshot {
            symbol: "ETHUSDT".to_string(),
            side: Some(Side::Sell),
            quantity: dec!(2),
            entry_price: dec!(2000),
            mark_price: dec!(1990),
        };
        assert_eq!(
            ledger.reconcile(&remote, at(0)).unwrap(),
            ReconcileOutcome::UnknownRemote(remote.clone())
        );

        let position = ledger.adopt_remote(&remote, 5, at(0)).unwrap();
        assert_eq!(position.id, "ETHUSDT-1");
        assert_eq!(position.side, Side::Sell);
        assert_eq!(position.anchor_price, dec!(2000));
        assert_eq!(ledger.reconcile(&remote, at(1)).unwrap(), ReconcileOutcome::InSync);
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut ledger = opened();
        ledger.register_exit("BTCUSDT-1", live_tp(0, dec!(0.4), 3)).unwrap();
        let positions = ledger.export_positions();

        let mut restored = PositionLedger::new(DcaConfig::default().levels().unwrap(), dec!(0.000001));
        restored.import_positions(positions, ledger.position_seq()).unwrap();
        assert_eq!(restored.snapshot("BTCUSDT"), ledger.snapshot("BTCUSDT"));
        assert_eq!(restored.next_position_id("BTCUSDT"), "BTCUSDT-2");

        // 이미 포지션이 있으면 거부
        assert!(restored.import_positions(ledger.export_positions(), 1).is_err());
    }
}
