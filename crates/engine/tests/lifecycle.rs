//! Placement, cancellation and polling against the simulated venue, driven
//! one step at a time without the background tasks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bxconnect_core::{
    CancelAck, CancelOutcome, ClientOrderId, Config, CreateAck, Error, Order, OrderEventKind,
    OrderSpec, OrderState, OrderType, OrderUpdate, Result, Side, SynchronizedClock, TradeUpdate,
};
use bxconnect_engine::{Connector, CreateFault, EventStream, SimulatedVenue};
use bxconnect_venue::{Transport, UserEventStream, VenueProfile};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const CONFIG: &str = r#"
mode = "paper"

[venue]
name = "sim"
order_types = ["limit", "limit_maker"]

[reconciliation]
max_not_found_retries = 2

[transport]
request_timeout_ms = 0

[fees]
maker_percent = "0.1"
taker_percent = "0.2"

[[trading_pairs]]
symbol = "SOL-USDC"
min_order_size = "0.1"
price_increment = "0.01"
amount_increment = "0.1"
"#;

fn config() -> Config {
    toml::from_str(CONFIG).unwrap()
}

fn setup_with(config: Config) -> (Arc<SimulatedVenue>, Connector<SimulatedVenue>, EventStream) {
    let venue = Arc::new(SimulatedVenue::from_config(&config));
    let connector =
        Connector::new(venue.clone(), Arc::new(SynchronizedClock::new()), config).unwrap();
    let events = connector.events().unwrap();
    (venue, connector, events)
}

fn setup() -> (Arc<SimulatedVenue>, Connector<SimulatedVenue>, EventStream) {
    setup_with(config())
}

fn buy(price: Decimal, amount: Decimal) -> OrderSpec {
    OrderSpec {
        trading_pair: "SOL-USDC".into(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        price,
        amount,
    }
}

fn drain(events: &mut EventStream) -> Vec<OrderEventKind> {
    let mut kinds = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test]
async fn placed_order_rests_open() {
    let (_venue, connector, mut events) = setup();
    let id = connector.place_order(buy(dec!(100), dec!(1))).await.unwrap();

    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.state, OrderState::Open);
    assert_eq!(order.exchange_order_id.unwrap().as_str(), "sim-1");
    assert!(id.as_str().starts_with("BXB"));
    assert_eq!(
        drain(&mut events),
        vec![OrderEventKind::OrderCreated, OrderEventKind::OrderOpened]
    );
}

#[tokio::test]
async fn timeout_then_poll_reaches_open() {
    let (venue, connector, _events) = setup();
    venue.fail_next_create(CreateFault::Timeout).await;

    let id = connector.place_order(buy(dec!(100), dec!(1))).await.unwrap();
    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.state, OrderState::PendingCreate);
    assert!(order.exchange_order_id.is_none());

    connector.poll_now().await;
    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.state, OrderState::Open);
    assert_eq!(order.exchange_order_id.unwrap().as_str(), "sim-1");
}

#[tokio::test]
async fn lost_create_fails_after_retries() {
    let (venue, connector, mut events) = setup();
    venue.fail_next_create(CreateFault::Lost).await;

    let id = connector.place_order(buy(dec!(100), dec!(1))).await.unwrap();
    connector.poll_now().await;
    assert_eq!(
        connector.get_order(&id).await.unwrap().state,
        OrderState::PendingCreate
    );

    connector.poll_now().await;
    assert_eq!(connector.get_order(&id).await.unwrap().state, OrderState::Failed);
    assert_eq!(
        drain(&mut events),
        vec![OrderEventKind::OrderCreated, OrderEventKind::OrderFailed]
    );
}

#[tokio::test]
async fn young_pending_order_is_not_counted_missing() {
    let mut config = config();
    config.transport.request_timeout_ms = 60_000;
    let (venue, connector, _events) = setup_with(config);
    venue.fail_next_create(CreateFault::Lost).await;

    let id = connector.place_order(buy(dec!(100), dec!(1))).await.unwrap();
    for _ in 0..3 {
        connector.poll_now().await;
    }
    assert_eq!(
        connector.get_order(&id).await.unwrap().state,
        OrderState::PendingCreate
    );
}

/// Holds every create request back before handing it to the venue.
struct SlowCreates {
    venue: Arc<SimulatedVenue>,
    delay: Duration,
}

#[async_trait]
impl Transport for SlowCreates {
    fn profile(&self) -> &dyn VenueProfile {
        self.venue.profile()
    }

    async fn request_order_status(&self, order: &Order) -> Result<Option<OrderUpdate>> {
        self.venue.request_order_status(order).await
    }

    async fn request_fills(&self, order: &Order) -> Result<Vec<TradeUpdate>> {
        self.venue.request_fills(order).await
    }

    async fn request_create_order(&self, id: &ClientOrderId, spec: &OrderSpec) -> Result<CreateAck> {
        tokio::time::sleep(self.delay).await;
        self.venue.request_create_order(id, spec).await
    }

    async fn request_cancel_order(&self, order: &Order) -> Result<CancelOutcome> {
        self.venue.request_cancel_order(order).await
    }

    async fn subscribe_user_events(&self) -> Result<UserEventStream> {
        self.venue.subscribe_user_events().await
    }

    async fn request_server_time(&self) -> Result<DateTime<Utc>> {
        self.venue.request_server_time().await
    }
}

#[tokio::test]
async fn slow_create_survives_polls_while_in_flight() {
    let mut config = config();
    config.transport.request_timeout_ms = 100;
    let venue = Arc::new(SimulatedVenue::from_config(&config));
    let transport = Arc::new(SlowCreates {
        venue: venue.clone(),
        delay: Duration::from_millis(400),
    });
    let connector =
        Connector::new(transport, Arc::new(SynchronizedClock::new()), config).unwrap();

    let id = ClientOrderId::from("slow-create");
    let (placed, ()) = tokio::join!(
        connector.place_order_with_id(id.clone(), buy(dec!(100), dec!(1))),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            connector.poll_now().await;
            connector.poll_now().await;
        },
    );
    placed.unwrap();

    assert_eq!(connector.get_order(&id).await.unwrap().state, OrderState::Open);
    assert_eq!(venue.venue_order(&id).await, Some((OrderState::Open, dec!(0))));
}

#[test]
fn connector_refuses_unbounded_grace_period() {
    let mut config = config();
    config.reconciliation.fill_grace_period_secs = f64::INFINITY;
    let venue = Arc::new(SimulatedVenue::from_config(&config));
    let result = Connector::new(venue, Arc::new(SynchronizedClock::new()), config);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn venue_rejection_fails_order() {
    let (venue, connector, _events) = setup();
    venue
        .fail_next_create(CreateFault::Reject("insufficient balance".into()))
        .await;

    let id = connector.place_order(buy(dec!(100), dec!(1))).await.unwrap();
    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.state, OrderState::Failed);
    assert!(connector.tracked_orders().await.is_empty());
}

#[tokio::test]
async fn cancel_open_order() {
    let (_venue, connector, mut events) = setup();
    let id = connector.place_order(buy(dec!(100), dec!(1))).await.unwrap();

    assert_eq!(connector.cancel_order(&id).await.unwrap(), CancelAck::Cancelled);
    assert_eq!(
        connector.get_order(&id).await.unwrap().state,
        OrderState::Cancelled
    );
    assert_eq!(
        connector.cancel_order(&id).await.unwrap(),
        CancelAck::AlreadyTerminal
    );
    assert_eq!(drain(&mut events).last(), Some(&OrderEventKind::OrderCancelled));
}

#[tokio::test]
async fn cancel_on_venue_filled_order_is_a_benign_no_op() {
    let (venue, connector, mut events) = setup();
    let id = connector.place_order(buy(dec!(100), dec!(1))).await.unwrap();
    venue.fill(&id, dec!(100), dec!(1)).await.unwrap();
    drain(&mut events);

    assert_eq!(connector.cancel_order(&id).await.unwrap(), CancelAck::Deferred);
    assert_eq!(connector.get_order(&id).await.unwrap().state, OrderState::Open);
    assert!(drain(&mut events).is_empty());

    connector.poll_now().await;
    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_amount, dec!(1));
    assert_eq!(drain(&mut events), vec![OrderEventKind::OrderFilled]);
}

#[tokio::test]
async fn cancel_unknown_order() {
    let (_venue, connector, _events) = setup();
    let err = connector
        .cancel_order(&ClientOrderId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownOrder(_)));
}

#[tokio::test]
async fn polling_applies_fills_then_status() {
    let (venue, connector, mut events) = setup();
    let id = connector.place_order(buy(dec!(100), dec!(2))).await.unwrap();
    venue.fill(&id, dec!(100), dec!(0.5)).await.unwrap();
    venue.fill(&id, dec!(100), dec!(1.5)).await.unwrap();
    drain(&mut events);

    connector.poll_now().await;
    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.fills.len(), 2);
    // 0.2% taker fee on 200 USDC
    assert_eq!(order.fee_paid, dec!(0.4));
    assert_eq!(
        drain(&mut events),
        vec![
            OrderEventKind::OrderPartiallyFilled,
            OrderEventKind::OrderFilled,
        ]
    );

    // A second pass finds nothing new.
    assert_eq!(connector.poll_now().await, 0);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn venue_side_cancel_seen_by_poll() {
    let (venue, connector, _events) = setup();
    let id = connector.place_order(buy(dec!(100), dec!(2))).await.unwrap();
    venue.fill(&id, dec!(100), dec!(0.5)).await.unwrap();
    assert!(venue.expire(&id).await);

    connector.poll_now().await;
    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.state, OrderState::Cancelled);
    assert_eq!(order.filled_amount, dec!(0.5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_placements_are_all_tracked() {
    let (venue, connector, _events) = setup();
    let connector = Arc::new(connector);

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let connector = connector.clone();
            tokio::spawn(async move {
                let id = ClientOrderId(format!("C{i:03}"));
                connector
                    .place_order_with_id(id, buy(dec!(100), dec!(1)))
                    .await
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap());
    }

    assert_eq!(ids.len(), 100);
    let tracked = connector.all_orders().await;
    assert_eq!(tracked.len(), 100);
    let tracked_ids: HashSet<_> = tracked.into_iter().map(|o| o.client_order_id).collect();
    assert_eq!(tracked_ids, ids);
    assert_eq!(venue.order_count().await, 100);
}

#[tokio::test]
async fn duplicate_client_id_is_rejected() {
    let (_venue, connector, _events) = setup();
    let id = ClientOrderId::from("DUP1");
    connector
        .place_order_with_id(id.clone(), buy(dec!(100), dec!(1)))
        .await
        .unwrap();
    let err = connector
        .place_order_with_id(id, buy(dec!(100), dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateOrder(_)));
}

#[tokio::test]
async fn local_validation() {
    let (venue, connector, _events) = setup();

    let mut spec = buy(dec!(100), dec!(1));
    spec.trading_pair = "BTC-USDC".into();
    let err = connector.place_order(spec).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOrder(_)));

    let mut spec = buy(dec!(100), dec!(1));
    spec.order_type = OrderType::Market;
    let err = connector.place_order(spec).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOrder(_)));

    let err = connector
        .place_order(buy(dec!(100), dec!(0.05)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOrder(_)));

    assert_eq!(venue.request_count(), 0);
}

#[tokio::test]
async fn orders_are_quantized_before_submission() {
    let (_venue, connector, _events) = setup();
    let id = connector
        .place_order(buy(dec!(100.019), dec!(1.27)))
        .await
        .unwrap();
    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.price, dec!(100.01));
    assert_eq!(order.amount, dec!(1.2));
}

#[tokio::test]
async fn trading_disabled_rejects_placement() {
    let mut config = config();
    config.trading_required = false;
    let (_venue, connector, _events) = setup_with(config);

    assert!(!connector.is_trading_required());
    let err = connector
        .place_order(buy(dec!(100), dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOrder(_)));
}

#[tokio::test]
async fn connector_metadata() {
    let (_venue, connector, _events) = setup();
    assert_eq!(connector.name(), "sim");
    assert!(connector.is_cancel_request_synchronous());
    assert_eq!(
        connector.supported_order_types(),
        vec![OrderType::Limit, OrderType::LimitMaker]
    );
    assert_eq!(
        connector.estimate_fee(OrderType::LimitMaker, dec!(2), dec!(100)),
        dec!(0.2)
    );
    assert_eq!(
        connector.estimate_fee(OrderType::Limit, dec!(2), dec!(100)),
        dec!(0.4)
    );
    assert!(connector.events().is_none());
    assert!(!connector.is_ready());
}
