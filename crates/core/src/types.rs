use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Locally generated order identifier, assigned before the venue sees the order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientOrderId(pub String);

/// Identifier assigned by the venue once it accepts an order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeOrderId(pub String);

/// Venue-unique identifier of a single execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(ClientOrderId);
string_id!(ExchangeOrderId);
string_id!(TradeId);

/// Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
    LimitMaker,
}

impl OrderType {
    /// Maker-only orders are charged the maker fee; everything else may take.
    pub fn is_maker(&self) -> bool {
        matches!(self, OrderType::LimitMaker)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Market => write!(f, "MARKET"),
            OrderType::LimitMaker => write!(f, "LIMIT_MAKER"),
        }
    }
}

/// Order lifecycle state.
///
/// ```text
/// PendingCreate -> Open <-> PartiallyFilled -> Filled | Cancelled | Failed
/// PendingCreate -> Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    PendingCreate,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Failed
        )
    }

    /// Acknowledged by the venue and still working.
    pub fn is_live(&self) -> bool {
        matches!(self, OrderState::Open | OrderState::PartiallyFilled)
    }

    /// Whether the lifecycle table permits moving from `self` to `next`.
    /// Self-transitions are not transitions.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        match (*self, next) {
            (a, b) if a == b => false,
            (Filled | Cancelled | Failed, _) => false,
            (PendingCreate, _) => true,
            (Open | PartiallyFilled, PendingCreate) => false,
            (Open | PartiallyFilled, _) => true,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::PendingCreate => "PENDING_CREATE",
            OrderState::Open => "OPEN",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::Filled => "FILLED",
            OrderState::Cancelled => "CANCELLED",
            OrderState::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// What the engine asks the connector to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub trading_pair: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub amount: Decimal,
}

/// One execution against an order. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub client_order_id: ClientOrderId,
    pub price: Decimal,
    pub amount: Decimal,
    /// Quote-denominated fee charged for this execution.
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// An order submitted by this connector instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub trading_pair: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    /// Sum of `price * amount` over all applied fills.
    pub filled_quote: Decimal,
    pub fee_paid: Decimal,
    pub state: OrderState,
    pub fills: Vec<Trade>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A fresh order in `PendingCreate`.
    pub fn new(client_order_id: ClientOrderId, spec: &OrderSpec, now: DateTime<Utc>) -> Self {
        Self {
            client_order_id,
            exchange_order_id: None,
            trading_pair: spec.trading_pair.clone(),
            side: spec.side,
            order_type: spec.order_type,
            price: spec.price,
            amount: spec.amount,
            filled_amount: Decimal::ZERO,
            filled_quote: Decimal::ZERO,
            fee_paid: Decimal::ZERO,
            state: OrderState::PendingCreate,
            fills: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn remaining_amount(&self) -> Decimal {
        (self.amount - self.filled_amount).max(Decimal::ZERO)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_amount >= self.amount
    }

    pub fn has_trade(&self, trade_id: &TradeId) -> bool {
        self.fills.iter().any(|t| &t.trade_id == trade_id)
    }

    /// Volume-weighted fill price, if anything has filled.
    pub fn average_fill_price(&self) -> Option<Decimal> {
        if self.filled_amount.is_zero() {
            None
        } else {
            Some(self.filled_quote / self.filled_amount)
        }
    }
}

/// A venue-reported state change, from either polling or the user stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub client_order_id: Option<ClientOrderId>,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub new_state: OrderState,
    pub timestamp: DateTime<Utc>,
}

impl OrderUpdate {
    pub fn for_client(id: ClientOrderId, new_state: OrderState, timestamp: DateTime<Utc>) -> Self {
        Self {
            client_order_id: Some(id),
            exchange_order_id: None,
            new_state,
            timestamp,
        }
    }

    pub fn with_exchange_id(mut self, id: ExchangeOrderId) -> Self {
        self.exchange_order_id = Some(id);
        self
    }

    /// The venue confirming creation: `Open` with both identifiers attached.
    pub fn is_create_ack(&self) -> bool {
        self.new_state == OrderState::Open
            && self.client_order_id.is_some()
            && self.exchange_order_id.is_some()
    }

    /// Human-readable reference for logs and errors.
    pub fn order_ref(&self) -> String {
        describe_ref(self.client_order_id.as_ref(), self.exchange_order_id.as_ref())
    }
}

/// A venue-reported fill. May name its order by either identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    pub trade_id: TradeId,
    pub client_order_id: Option<ClientOrderId>,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl TradeUpdate {
    pub fn order_ref(&self) -> String {
        describe_ref(self.client_order_id.as_ref(), self.exchange_order_id.as_ref())
    }
}

fn describe_ref(client: Option<&ClientOrderId>, exchange: Option<&ExchangeOrderId>) -> String {
    match (client, exchange) {
        (Some(c), Some(e)) => format!("{c} ({e})"),
        (Some(c), None) => c.to_string(),
        (None, Some(e)) => format!("exchange:{e}"),
        (None, None) => "<no id>".to_string(),
    }
}

/// A decoded message from the authenticated user stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Order(OrderUpdate),
    Trade(TradeUpdate),
}

/// Venue confirmation of a creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateAck {
    pub exchange_order_id: ExchangeOrderId,
    pub timestamp: DateTime<Utc>,
}

/// How the venue answered a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The order already reached a terminal state at the venue.
    AlreadyDone,
    NotFound,
}

/// What the connector reports back for a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Cancelled,
    /// The venue says the order is already filled or gone; the next poll or
    /// stream event settles its final state.
    Deferred,
    /// Already terminal locally, nothing was sent.
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEventKind {
    OrderCreated,
    OrderOpened,
    OrderPartiallyFilled,
    OrderFilled,
    OrderCancelled,
    OrderFailed,
}

impl fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lifecycle event delivered to the bot engine, carrying the post-update order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub client_order_id: ClientOrderId,
    pub order: Order,
    /// The fill that caused a fill event, when there was one.
    pub trade: Option<Trade>,
}

/// Produces `{prefix}{B|S}{nonce}` ids, unique for the life of the generator.
#[derive(Debug)]
pub struct ClientOrderIdGenerator {
    prefix: String,
    nonce: AtomicU64,
}

/// Decimal digits in `u64::MAX`.
const MAX_NONCE_DIGITS: usize = 20;

impl ClientOrderIdGenerator {
    pub fn new(prefix: &str, max_length: usize) -> crate::Result<Self> {
        if prefix.len() + 1 + MAX_NONCE_DIGITS > max_length {
            return Err(crate::Error::Config(format!(
                "client order id prefix '{prefix}' too long for max id length {max_length}"
            )));
        }
        let seed = Utc::now().timestamp_micros().max(0) as u64;
        Ok(Self {
            prefix: prefix.to_string(),
            nonce: AtomicU64::new(seed),
        })
    }

    pub fn next_id(&self, side: Side) -> ClientOrderId {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let side = match side {
            Side::Buy => 'B',
            Side::Sell => 'S',
        };
        ClientOrderId(format!("{}{}{}", self.prefix, side, nonce))
    }
}
