use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bxconnect_core::{
    CancelOutcome, ClientOrderId, Config, CreateAck, Error, ExchangeOrderId, FeeConfig, Order,
    OrderSpec, OrderState, OrderType, OrderUpdate, Result, Side, TradeId, TradeUpdate, UserEvent,
};
use bxconnect_venue::{ConfiguredProfile, Transport, UserEventStream, VenueProfile};
use chrono::{DateTime, Duration, Utc};
use futures::stream;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// How the next create request misbehaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateFault {
    /// The venue accepts the order but the response never arrives.
    Timeout,
    /// The request never reaches the venue.
    Lost,
    /// The venue refuses the order.
    Reject(String),
}

/// One order as the simulated venue sees it.
#[derive(Debug, Clone)]
struct VenueOrder {
    client_order_id: ClientOrderId,
    exchange_order_id: ExchangeOrderId,
    spec: OrderSpec,
    state: OrderState,
    filled: Decimal,
    fills: Vec<TradeUpdate>,
}

impl VenueOrder {
    fn remaining(&self) -> Decimal {
        (self.spec.amount - self.filled).max(Decimal::ZERO)
    }

    fn status(&self, timestamp: DateTime<Utc>) -> OrderUpdate {
        OrderUpdate::for_client(self.client_order_id.clone(), self.state, timestamp)
            .with_exchange_id(self.exchange_order_id.clone())
    }
}

type StreamSender = mpsc::UnboundedSender<Result<UserEvent>>;

/// Internal mutable state for the simulated venue.
#[derive(Default)]
struct VenueState {
    orders: HashMap<ExchangeOrderId, VenueOrder>,
    by_client: HashMap<ClientOrderId, ExchangeOrderId>,
    /// Monotonic counters for venue order and trade ids.
    next_order: u64,
    next_trade: u64,
    create_fault: Option<CreateFault>,
    stream: Option<StreamSender>,
    /// Venue-side events are not published while muted.
    stream_muted: bool,
    stream_refused: bool,
}

impl VenueState {
    fn find(&self, order: &Order) -> Option<&ExchangeOrderId> {
        order
            .exchange_order_id
            .as_ref()
            .and_then(|x| self.orders.get_key_value(x).map(|(k, _)| k))
            .or_else(|| self.by_client.get(&order.client_order_id))
    }

    fn publish(&mut self, event: UserEvent) {
        if self.stream_muted {
            return;
        }
        if let Some(tx) = &self.stream {
            if tx.send(Ok(event)).is_err() {
                self.stream = None;
            }
        }
    }

    /// Execute `amount` of order `id` at `price`, publishing the trade and
    /// then the new status.
    fn execute(
        &mut self,
        id: &ExchangeOrderId,
        price: Decimal,
        amount: Decimal,
        fees: &FeeConfig,
    ) -> Option<TradeUpdate> {
        self.next_trade += 1;
        let trade_id = TradeId(format!("sim-t{}", self.next_trade));
        let now = Utc::now();

        let order = self.orders.get_mut(id)?;
        if order.state.is_terminal() {
            return None;
        }
        let amount = amount.min(order.remaining());
        if amount <= Decimal::ZERO {
            return None;
        }

        let trade = TradeUpdate {
            trade_id,
            client_order_id: Some(order.client_order_id.clone()),
            exchange_order_id: Some(order.exchange_order_id.clone()),
            price,
            amount,
            fee: fees.estimate(order.spec.order_type, amount, price),
            timestamp: now,
        };
        order.filled += amount;
        order.fills.push(trade.clone());
        order.state = if order.remaining().is_zero() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        let status = order.status(now);

        info!(
            client_order_id = %order.client_order_id,
            side = %order.spec.side,
            price = %price,
            amount = %amount,
            state = %order.state,
            "simulated fill"
        );

        self.publish(UserEvent::Trade(trade.clone()));
        self.publish(UserEvent::Order(status));
        Some(trade)
    }
}

/// An in-process venue for paper trading and tests. Orders rest until
/// filled through [`SimulatedVenue::fill`] or [`SimulatedVenue::match_at`],
/// or cancelled.
pub struct SimulatedVenue {
    state: Arc<Mutex<VenueState>>,
    profile: ConfiguredProfile,
    clock_skew_ms: AtomicI64,
    requests: AtomicUsize,
    closed: AtomicBool,
}

impl SimulatedVenue {
    pub fn new(profile: ConfiguredProfile) -> Self {
        Self {
            state: Arc::new(Mutex::new(VenueState::default())),
            profile,
            clock_skew_ms: AtomicI64::new(0),
            requests: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ConfiguredProfile::from_config(config))
    }

    /// Make the next create request misbehave once.
    pub async fn fail_next_create(&self, fault: CreateFault) {
        self.state.lock().await.create_fault = Some(fault);
    }

    /// Execute part of a resting order. Returns `None` if the venue has no
    /// such live order.
    pub async fn fill(
        &self,
        client_order_id: &ClientOrderId,
        price: Decimal,
        amount: Decimal,
    ) -> Option<TradeUpdate> {
        let mut state = self.state.lock().await;
        let id = state.by_client.get(client_order_id)?.clone();
        state.execute(&id, price, amount, self.profile.fee_config())
    }

    /// Fill every resting order on `pair` that a trade at `price` crosses.
    ///
    /// - Buy orders fill when `price <= order price`
    /// - Sell orders fill when `price >= order price`
    ///
    /// Crossed orders fill completely at their own limit price.
    pub async fn match_at(&self, pair: &str, price: Decimal) -> Vec<TradeUpdate> {
        let mut state = self.state.lock().await;
        let mut crossed: Vec<(ExchangeOrderId, Decimal, Decimal)> = state
            .orders
            .values()
            .filter(|o| o.spec.trading_pair == pair && !o.state.is_terminal())
            .filter(|o| match o.spec.side {
                Side::Buy => price <= o.spec.price,
                Side::Sell => price >= o.spec.price,
            })
            .map(|o| (o.exchange_order_id.clone(), o.spec.price, o.remaining()))
            .collect();
        crossed.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        crossed
            .into_iter()
            .filter_map(|(id, limit, amount)| {
                state.execute(&id, limit, amount, self.profile.fee_config())
            })
            .collect()
    }

    /// Cancel a resting order venue-side, as an expiry or an operator would.
    pub async fn expire(&self, client_order_id: &ClientOrderId) -> bool {
        let mut state = self.state.lock().await;
        let Some(id) = state.by_client.get(client_order_id).cloned() else {
            return false;
        };
        let Some(order) = state.orders.get_mut(&id) else {
            return false;
        };
        if order.state.is_terminal() {
            return false;
        }
        order.state = OrderState::Cancelled;
        let status = order.status(Utc::now());
        state.publish(UserEvent::Order(status));
        true
    }

    /// End the current user-stream subscription.
    pub async fn disconnect_stream(&self) {
        if self.state.lock().await.stream.take().is_some() {
            debug!("simulated user stream disconnected");
        }
    }

    /// Fail the current subscription with a transport error.
    pub async fn break_stream(&self) {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.stream.take() {
            let _ = tx.send(Err(Error::Transport("simulated stream failure".into())));
        }
    }

    /// Stop publishing venue events, as if the stream silently lost them.
    pub async fn mute_stream(&self, muted: bool) {
        self.state.lock().await.stream_muted = muted;
    }

    /// Refuse new subscriptions while set.
    pub async fn refuse_subscriptions(&self, refused: bool) {
        self.state.lock().await.stream_refused = refused;
    }

    pub async fn is_stream_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .stream
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn set_clock_skew(&self, skew: Duration) {
        self.clock_skew_ms
            .store(skew.num_milliseconds(), Ordering::Release);
    }

    /// Venue-side state and filled amount for an order.
    pub async fn venue_order(&self, client_order_id: &ClientOrderId) -> Option<(OrderState, Decimal)> {
        let state = self.state.lock().await;
        let id = state.by_client.get(client_order_id)?;
        state.orders.get(id).map(|o| (o.state, o.filled))
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Requests served so far, of any kind.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }

    fn begin_request(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("simulated venue is closed".into()));
        }
        self.requests.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[async_trait]
impl Transport for SimulatedVenue {
    fn profile(&self) -> &dyn VenueProfile {
        &self.profile
    }

    async fn request_order_status(&self, order: &Order) -> Result<Option<OrderUpdate>> {
        self.begin_request()?;
        let state = self.state.lock().await;
        Ok(state
            .find(order)
            .and_then(|id| state.orders.get(id))
            .map(|o| o.status(Utc::now())))
    }

    async fn request_fills(&self, order: &Order) -> Result<Vec<TradeUpdate>> {
        self.begin_request()?;
        let state = self.state.lock().await;
        Ok(state
            .find(order)
            .and_then(|id| state.orders.get(id))
            .map(|o| o.fills.clone())
            .unwrap_or_default())
    }

    async fn request_create_order(
        &self,
        client_order_id: &ClientOrderId,
        spec: &OrderSpec,
    ) -> Result<CreateAck> {
        self.begin_request()?;
        let mut state = self.state.lock().await;

        let fault = state.create_fault.take();
        match &fault {
            Some(CreateFault::Reject(reason)) => {
                return Err(Error::VenueRejection(reason.clone()));
            }
            Some(CreateFault::Lost) => {
                return Err(Error::Transport("simulated request lost".into()));
            }
            _ => {}
        }
        if state.by_client.contains_key(client_order_id) {
            return Err(Error::VenueRejection(format!(
                "client order id {client_order_id} already used"
            )));
        }
        if !self
            .profile
            .supported_order_types()
            .contains(&spec.order_type)
        {
            return Err(Error::VenueRejection(format!(
                "order type {} not supported",
                spec.order_type
            )));
        }

        state.next_order += 1;
        let exchange_order_id = ExchangeOrderId(format!("sim-{}", state.next_order));
        let order = VenueOrder {
            client_order_id: client_order_id.clone(),
            exchange_order_id: exchange_order_id.clone(),
            spec: spec.clone(),
            state: OrderState::Open,
            filled: Decimal::ZERO,
            fills: Vec::new(),
        };
        let now = Utc::now();
        let status = order.status(now);

        debug!(
            client_order_id = %client_order_id,
            exchange_order_id = %exchange_order_id,
            side = %spec.side,
            price = %spec.price,
            amount = %spec.amount,
            "simulated order accepted"
        );

        state.orders.insert(exchange_order_id.clone(), order);
        state
            .by_client
            .insert(client_order_id.clone(), exchange_order_id.clone());
        state.publish(UserEvent::Order(status));

        if fault == Some(CreateFault::Timeout) {
            return Err(Error::Transport("simulated create timeout".into()));
        }
        Ok(CreateAck {
            exchange_order_id,
            timestamp: now,
        })
    }

    async fn request_cancel_order(&self, order: &Order) -> Result<CancelOutcome> {
        self.begin_request()?;
        let mut state = self.state.lock().await;
        let Some(id) = state.find(order).cloned() else {
            debug!(client_order_id = %order.client_order_id, "cancel: order not found");
            return Ok(CancelOutcome::NotFound);
        };
        let Some(venue_order) = state.orders.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if venue_order.state.is_terminal() {
            debug!(client_order_id = %order.client_order_id, state = %venue_order.state, "cancel: order already done");
            return Ok(CancelOutcome::AlreadyDone);
        }

        venue_order.state = OrderState::Cancelled;
        let status = venue_order.status(Utc::now());
        debug!(client_order_id = %order.client_order_id, "simulated order cancelled");
        state.publish(UserEvent::Order(status));
        Ok(CancelOutcome::Cancelled)
    }

    async fn subscribe_user_events(&self) -> Result<UserEventStream> {
        self.begin_request()?;
        let mut state = self.state.lock().await;
        if state.stream_refused {
            return Err(Error::Transport("simulated subscription refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.stream = Some(tx);
        debug!("simulated user stream subscribed");

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(events))
    }

    async fn request_server_time(&self) -> Result<DateTime<Utc>> {
        self.begin_request()?;
        Ok(Utc::now() + Duration::milliseconds(self.clock_skew_ms.load(Ordering::Acquire)))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().await.stream = None;
            info!("simulated venue closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use rust_decimal_macros::dec;

    fn venue() -> SimulatedVenue {
        let config: Config = toml::from_str(
            r#"
            mode = "paper"

            [venue]
            name = "sim"

            [[trading_pairs]]
            symbol = "SOL-USDC"
            min_order_size = 0.1
            price_increment = 0.01
            amount_increment = 0.1
            "#,
        )
        .unwrap();
        SimulatedVenue::from_config(&config)
    }

    fn spec(side: Side, price: Decimal) -> OrderSpec {
        OrderSpec {
            trading_pair: "SOL-USDC".into(),
            side,
            order_type: OrderType::Limit,
            price,
            amount: dec!(2),
        }
    }

    fn order_for(id: &str, spec: &OrderSpec) -> Order {
        Order::new(ClientOrderId::from(id), spec, Utc::now())
    }

    #[tokio::test]
    async fn create_then_cancel() {
        let venue = venue();
        let s = spec(Side::Buy, dec!(100));
        let ack = venue
            .request_create_order(&ClientOrderId::from("A"), &s)
            .await
            .unwrap();
        assert_eq!(ack.exchange_order_id.as_str(), "sim-1");

        let order = order_for("A", &s);
        let outcome = venue.request_cancel_order(&order).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        let again = venue.request_cancel_order(&order).await.unwrap();
        assert_eq!(again, CancelOutcome::AlreadyDone);
    }

    #[tokio::test]
    async fn lookup_prefers_exchange_id_then_client_id() {
        let venue = venue();
        let s = spec(Side::Buy, dec!(100));
        let ack = venue
            .request_create_order(&ClientOrderId::from("A"), &s)
            .await
            .unwrap();

        let mut known = order_for("other", &s);
        known.exchange_order_id = Some(ack.exchange_order_id.clone());
        let status = venue.request_order_status(&known).await.unwrap().unwrap();
        assert_eq!(status.client_order_id, Some(ClientOrderId::from("A")));

        let mut stale = order_for("A", &s);
        stale.exchange_order_id = Some(ExchangeOrderId::from("sim-999"));
        let status = venue.request_order_status(&stale).await.unwrap().unwrap();
        assert_eq!(status.exchange_order_id, Some(ack.exchange_order_id));

        assert!(venue.request_order_status(&order_for("B", &s)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn match_at_crosses_by_side() {
        let venue = venue();
        let buy = spec(Side::Buy, dec!(100));
        let sell = spec(Side::Sell, dec!(105));
        venue.request_create_order(&ClientOrderId::from("B"), &buy).await.unwrap();
        venue.request_create_order(&ClientOrderId::from("S"), &sell).await.unwrap();

        let fills = venue.match_at("SOL-USDC", dec!(99)).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].client_order_id, Some(ClientOrderId::from("B")));
        assert_eq!(fills[0].price, dec!(100));

        let (state, filled) = venue.venue_order(&ClientOrderId::from("B")).await.unwrap();
        assert_eq!(state, OrderState::Filled);
        assert_eq!(filled, dec!(2));

        let fills = venue.match_at("SOL-USDC", dec!(106)).await;
        assert_eq!(fills.len(), 1);
        assert!(venue.match_at("SOL-USDC", dec!(106)).await.is_empty());
    }

    #[tokio::test]
    async fn timeout_fault_still_creates_order() {
        let venue = venue();
        venue.fail_next_create(CreateFault::Timeout).await;
        let err = venue
            .request_create_order(&ClientOrderId::from("A"), &spec(Side::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(venue.order_count().await, 1);
    }

    #[tokio::test]
    async fn stream_publishes_fills() {
        let venue = venue();
        let mut events = venue.subscribe_user_events().await.unwrap();
        venue
            .request_create_order(&ClientOrderId::from("A"), &spec(Side::Buy, dec!(100)))
            .await
            .unwrap();
        venue.fill(&ClientOrderId::from("A"), dec!(100), dec!(1)).await.unwrap();

        assert!(matches!(events.next().await, Some(Ok(UserEvent::Order(_)))));
        assert!(matches!(events.next().await, Some(Ok(UserEvent::Trade(_)))));
        match events.next().await {
            Some(Ok(UserEvent::Order(update))) => {
                assert_eq!(update.new_state, OrderState::PartiallyFilled)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        venue.disconnect_stream().await;
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_venue_refuses_requests() {
        let venue = venue();
        venue.close().await;
        let err = venue.request_server_time().await.unwrap_err();
        assert!(err.is_transport());
    }
}
