//! 포지션 및 주문 라이프사이클 엔진.
//!
//! 이 crate는 다음을 제공합니다:
//! - 체결 이벤트로만 갱신되는 단일 작성자 포지션 원장
//! - 진입, DCA, 손절/익절/트레일링 청산을 관리하는 라이프사이클 엔진
//! - 거래소와 원장을 맞추는 조정 루프
//! - 라이브/모의투자/백테스트 실행 모드 어댑터
//! - 거래 로그, 자산 시계열, 복구 스냅샷 영속화
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_execution::{EngineConfig, OrderLifecycleEngine, Runner, SimulatedAdapter};
//!
//! let adapter = SimulatedAdapter::backtest(SimulatedConfig::default(), start);
//! let engine = OrderLifecycleEngine::new(EngineConfig::default(), risk, adapter, &symbols)?;
//! let summary = Runner::new(engine, None).run_backtest(events).await?;
//! ```

pub mod config;
pub mod engine;
pub mod exits;
pub mod ledger;
pub mod mode;
pub mod persistence;
pub mod reconcile;
pub mod runner;

// 주요 타입 재내보내기
pub use config::{DcaConfig, DcaLevel, EngineConfig, ExitConfig, ReconcileConfig, SignalFilterConfig};
pub use engine::{
    EngineError, EngineResult, IgnoreReason, OrderLifecycleEngine, PositionPhase, SignalDecision,
};
pub use exits::{DesiredExit, ExitPlanner, ReplaceDecision};
pub use ledger::{ExitFill, LedgerError, PositionLedger, ReconcileOutcome};
pub use mode::{AdapterResult, ExecutionAdapter, LiveAdapter, SimulatedAdapter};
pub use persistence::{
    EquityLog, EquityPoint, Persistence, PersistenceError, RecoverySnapshot, RecoveryStore,
    TradeLog,
};
pub use reconcile::{ReconcileReport, ReconciliationLoop};
pub use runner::{RunSummary, Runner};
