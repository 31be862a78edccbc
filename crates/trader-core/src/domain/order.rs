//! 주문 의도, 클라이언트 주문 ID, 주문 응답.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Price, Quantity};

/// 주문 방향. 포지션 방향으로도 사용합니다 (Buy = 롱, Sell = 숏).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl Side {
    /// 반대 방향.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// 손익 부호 (롱 +1, 숏 -1).
    pub fn sign(&self) -> rust_decimal::Decimal {
        match self {
            Side::Buy => rust_decimal::Decimal::ONE,
            Side::Sell => rust_decimal::Decimal::NEGATIVE_ONE,
        }
    }

    /// 거래소 표기.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// 시장가
    Market,
    /// 지정가
    Limit,
    /// 스탑 시장가 (손절/트레일링)
    StopMarket,
}

impl OrderType {
    /// 거래소 표기.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }
}

/// 주문 의도의 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// 최초 진입
    Entry,
    /// DCA 추가 진입
    DcaAdd,
    /// 손절
    StopLoss,
    /// 익절 래더 레그
    TakeProfit,
    /// 트레일링 스탑
    Trailing,
    /// 강제 청산
    Flatten,
}

impl IntentKind {
    /// 클라이언트 주문 ID에 사용되는 코드.
    pub fn code(&self) -> &'static str {
        match self {
            IntentKind::Entry => "EN",
            IntentKind::DcaAdd => "DC",
            IntentKind::StopLoss => "SL",
            IntentKind::TakeProfit => "TP",
            IntentKind::Trailing => "TR",
            IntentKind::Flatten => "FL",
        }
    }

    /// 코드에서 종류 복원.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "EN" => Some(IntentKind::Entry),
            "DC" => Some(IntentKind::DcaAdd),
            "SL" => Some(IntentKind::StopLoss),
            "TP" => Some(IntentKind::TakeProfit),
            "TR" => Some(IntentKind::Trailing),
            "FL" => Some(IntentKind::Flatten),
            _ => None,
        }
    }

    /// 포지션을 늘리는 주문인지 확인.
    pub fn is_increase(&self) -> bool {
        matches!(self, IntentKind::Entry | IntentKind::DcaAdd)
    }
}

/// 결정적 클라이언트 주문 ID.
///
/// 형식: `le-{position_tag}-{kind}{ladder_index}-{nonce}`. 태그, 인덱스, nonce는 36진수입니다.
/// 포지션 태그는 포지션 ID(`{symbol}-{seq}`)의 시퀀스이며 심볼은 주문 자체에 있으므로 생략합니다.
/// Binance `newClientOrderId` 한도([`MAX_CLIENT_ORDER_ID_LEN`]) 안에 들어갑니다.
///
/// 타임아웃 후 재시도된 제출은 같은 ID를 가지므로 거래소가 중복으로 인식합니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrderId(String);

/// 엔진이 발행한 주문 ID 접두어.
pub const CLIENT_ORDER_PREFIX: &str = "le-";

/// 거래소 클라이언트 주문 ID 최대 길이.
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 36;

/// 클라이언트 주문 ID 구성 요소.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOrderIdParts {
    /// 포지션 태그 (36진수 시퀀스)
    pub position_tag: String,
    pub kind: IntentKind,
    pub ladder_index: u32,
    pub nonce: u64,
}

impl ClientOrderIdParts {
    /// 이 주문이 주어진 포지션의 것인지 확인.
    pub fn belongs_to(&self, position_id: &str) -> bool {
        self.position_tag == position_tag(position_id)
    }
}

/// 포지션 ID의 주문 ID용 태그. `{symbol}-{seq}` 형식이 아니면 영숫자만 남깁니다.
fn position_tag(position_id: &str) -> String {
    match position_id
        .rsplit_once('-')
        .and_then(|(_, seq)| seq.parse::<u64>().ok())
    {
        Some(seq) => to_base36(seq),
        None => position_id
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_lowercase(),
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.iter().rev().map(|&b| b as char).collect()
}

impl ClientOrderId {
    /// 구성 요소에서 ID 생성.
    pub fn new(position_id: &str, kind: IntentKind, ladder_index: u32, nonce: u64) -> Self {
        Self(format!(
            "{}{}-{}{}-{}",
            CLIENT_ORDER_PREFIX,
            position_tag(position_id),
            kind.code(),
            to_base36(u64::from(ladder_index)),
            to_base36(nonce)
        ))
    }

    /// 문자열 참조.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 엔진이 발행한 ID인지 확인.
    pub fn is_engine_issued(raw: &str) -> bool {
        raw.starts_with(CLIENT_ORDER_PREFIX)
    }

    /// 구성 요소로 분해. 엔진 형식이 아니면 None.
    pub fn parse(raw: &str) -> Option<ClientOrderIdParts> {
        let body = raw.strip_prefix(CLIENT_ORDER_PREFIX)?;
        let (rest, nonce) = body.rsplit_once('-')?;
        let (tag, kind_index) = rest.rsplit_once('-')?;
        if kind_index.len() < 3 || tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        let (code, index) = kind_index.split_at(2);
        Some(ClientOrderIdParts {
            position_tag: tag.to_lowercase(),
            kind: IntentKind::from_code(code)?,
            ladder_index: u32::from_str_radix(index, 36).ok()?,
            nonce: u64::from_str_radix(nonce, 36).ok()?,
        })
    }
}

impl std::fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 거래소로 보낼 주문 의도.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// 거래 심볼
    pub symbol: String,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 수량
    pub quantity: Quantity,
    /// 지정가
    pub price: Option<Price>,
    /// 스탑 트리거 가격
    pub stop_price: Option<Price>,
    /// 포지션 축소 전용
    pub reduce_only: bool,
    /// 의도 종류
    pub kind: IntentKind,
    /// 클라이언트 주문 ID
    pub client_order_id: ClientOrderId,
}

impl OrderIntent {
    /// 시장가 주문 의도.
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        kind: IntentKind,
        client_order_id: ClientOrderId,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only: !kind.is_increase(),
            kind,
            client_order_id,
        }
    }

    /// 축소 전용 지정가 주문 의도 (익절 레그).
    pub fn reduce_limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        price: Price,
        kind: IntentKind,
        client_order_id: ClientOrderId,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            reduce_only: true,
            kind,
            client_order_id,
        }
    }

    /// 축소 전용 스탑 시장가 주문 의도 (손절/트레일링).
    pub fn reduce_stop(
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        stop_price: Price,
        kind: IntentKind,
        client_order_id: ClientOrderId,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::StopMarket,
            quantity,
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
            kind,
            client_order_id,
        }
    }
}

/// 주문 상태 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatusType {
    /// 접수됨
    New,
    /// 부분 체결
    PartiallyFilled,
    /// 전량 체결
    Filled,
    /// 취소됨
    Cancelled,
    /// 거부됨
    Rejected,
    /// 만료됨
    Expired,
}

impl OrderStatusType {
    /// 거래소에 살아 있는 주문인지 확인.
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatusType::New | OrderStatusType::PartiallyFilled)
    }

    /// Binance 상태 문자열 파싱.
    pub fn from_exchange(status: &str) -> Self {
        match status {
            "PARTIALLY_FILLED" => OrderStatusType::PartiallyFilled,
            "FILLED" => OrderStatusType::Filled,
            "CANCELED" | "CANCELLED" => OrderStatusType::Cancelled,
            "REJECTED" => OrderStatusType::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatusType::Expired,
            _ => OrderStatusType::New,
        }
    }
}

/// 주문 제출 응답.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    /// 거래소 주문 ID
    pub order_id: String,
    /// 클라이언트 주문 ID
    pub client_order_id: String,
    /// 상태
    pub status: OrderStatusType,
    /// 체결 수량 (응답 시점)
    pub filled_quantity: Quantity,
    /// 평균 체결 가격
    pub average_price: Option<Price>,
    /// 응답 시점까지 지불한 수수료
    pub fee: rust_decimal::Decimal,
    /// 응답 시각
    pub timestamp: DateTime<Utc>,
}
