//! 트레이딩 운영을 위한 도메인 모델.

mod account;
mod exit;
mod market;
mod order;
mod position;
mod signal;
mod trade;

pub use account::*;
pub use exit::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use signal::*;
pub use trade::*;
