use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bxconnect_core::{
    CancelAck, CancelOutcome, ClientOrderId, Config, Error, Order, OrderSpec, OrderState,
    OrderUpdate, ReconciliationConfig, Result, SynchronizedClock, UserEvent,
};
use bxconnect_venue::Transport;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::tracker::OrderTracker;

const STREAM_BACKOFF_MIN: Duration = Duration::from_secs(1);
const STREAM_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Marks a create request as outstanding until dropped, so a cancelled
/// `place_order` future cannot leave the id marked forever.
struct InFlight<'a> {
    set: &'a std::sync::Mutex<HashSet<ClientOrderId>>,
    id: ClientOrderId,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a std::sync::Mutex<HashSet<ClientOrderId>>, id: &ClientOrderId) -> Self {
        set.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone());
        Self { set, id: id.clone() }
    }

    fn contains(set: &std::sync::Mutex<HashSet<ClientOrderId>>, id: &ClientOrderId) -> bool {
        set.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// Drives the tracker towards the venue's truth from two sources: periodic
/// polling and the authenticated user stream. Both feed the same tracker
/// entry points, so whichever arrives first wins and the other is a no-op.
pub struct ReconciliationEngine<T: Transport> {
    transport: Arc<T>,
    tracker: OrderTracker,
    clock: Arc<SynchronizedClock>,
    config: ReconciliationConfig,
    request_timeout: Duration,
    /// Consecutive "venue does not know this order" answers per order.
    not_found: Mutex<HashMap<ClientOrderId, u32>>,
    /// Orders whose create request has not returned yet.
    in_flight: std::sync::Mutex<HashSet<ClientOrderId>>,
    stream_up: AtomicBool,
    wake: Notify,
}

impl<T: Transport> ReconciliationEngine<T> {
    pub fn new(
        transport: Arc<T>,
        tracker: OrderTracker,
        clock: Arc<SynchronizedClock>,
        config: &Config,
    ) -> Self {
        Self {
            transport,
            tracker,
            clock,
            config: config.reconciliation.clone(),
            request_timeout: config.transport.request_timeout(),
            not_found: Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            stream_up: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn tracker(&self) -> &OrderTracker {
        &self.tracker
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn is_stream_up(&self) -> bool {
        self.stream_up.load(Ordering::Acquire)
    }

    /// Register `spec` under `client_order_id` and submit it.
    ///
    /// A venue rejection fails the order. Any other error leaves it in
    /// `PendingCreate`, since the venue may or may not have it; polling
    /// settles it either way. Only registration errors are returned.
    pub async fn place_order(&self, client_order_id: ClientOrderId, spec: OrderSpec) -> Result<Order> {
        let order = Order::new(client_order_id.clone(), &spec, self.clock.now());
        self.tracker.register(order).await?;

        let result = {
            let _in_flight = InFlight::enter(&self.in_flight, &client_order_id);
            self.transport
                .request_create_order(&client_order_id, &spec)
                .await
        };

        match result {
            Ok(ack) => {
                let update = OrderUpdate::for_client(
                    client_order_id.clone(),
                    OrderState::Open,
                    ack.timestamp,
                )
                .with_exchange_id(ack.exchange_order_id);
                self.apply_update(update).await;
            }
            Err(Error::VenueRejection(reason)) => {
                warn!(client_order_id = %client_order_id, reason = %reason, "order rejected by venue");
                let update =
                    OrderUpdate::for_client(client_order_id.clone(), OrderState::Failed, Utc::now());
                self.apply_update(update).await;
            }
            Err(e) => {
                warn!(
                    client_order_id = %client_order_id,
                    error = %e,
                    "create outcome unknown; leaving order pending for polling"
                );
                self.wake.notify_one();
            }
        }

        self.tracker
            .get(&client_order_id)
            .await
            .ok_or_else(|| Error::UnknownOrder(client_order_id.to_string()))
    }

    /// Ask the venue to cancel. The tracker only moves on a confirmed cancel;
    /// "already filled" or "gone" answers leave the final state to the next
    /// poll or stream event.
    pub async fn cancel_order(&self, id: &ClientOrderId) -> Result<CancelAck> {
        let order = self
            .tracker
            .get(id)
            .await
            .ok_or_else(|| Error::UnknownOrder(id.to_string()))?;

        if order.is_terminal() {
            debug!(client_order_id = %id, state = %order.state, "cancel skipped, order already terminal");
            return Ok(CancelAck::AlreadyTerminal);
        }

        match self.transport.request_cancel_order(&order).await {
            Ok(CancelOutcome::Cancelled) => {
                let update = OrderUpdate::for_client(id.clone(), OrderState::Cancelled, Utc::now());
                self.apply_update(update).await;
                Ok(CancelAck::Cancelled)
            }
            Ok(outcome) => {
                info!(client_order_id = %id, ?outcome, "cancel deferred to reconciliation");
                self.wake.notify_one();
                Ok(CancelAck::Deferred)
            }
            Err(e) => {
                warn!(client_order_id = %id, error = %e, "cancel failed");
                Err(e)
            }
        }
    }

    /// One reconciliation pass over every live order. Per-order failures are
    /// logged and skipped. Returns the number of orders polled.
    pub async fn poll_once(&self) -> usize {
        let orders = self.tracker.snapshot().await;
        {
            let live: HashSet<&ClientOrderId> = orders.iter().map(|o| &o.client_order_id).collect();
            self.not_found.lock().await.retain(|id, _| live.contains(id));
        }
        for order in &orders {
            if let Err(e) = self.poll_order(order).await {
                warn!(client_order_id = %order.client_order_id, error = %e, "order poll failed");
            }
        }
        orders.len()
    }

    async fn poll_order(&self, order: &Order) -> Result<()> {
        // Fills first, so a FILLED status finds its trades already applied.
        if order.exchange_order_id.is_some() {
            for fill in self.transport.request_fills(order).await? {
                if let Err(e) = self.tracker.apply_trade_update(fill).await {
                    debug!(client_order_id = %order.client_order_id, error = %e, "polled fill not applied");
                }
            }
        }

        match self.transport.request_order_status(order).await? {
            Some(update) => {
                self.not_found.lock().await.remove(&order.client_order_id);
                self.tracker.apply_order_update(update).await?;
            }
            None => self.record_not_found(order).await,
        }
        Ok(())
    }

    async fn record_not_found(&self, order: &Order) {
        let id = &order.client_order_id;
        if InFlight::contains(&self.in_flight, id) {
            debug!(client_order_id = %id, "create still in flight; not counting miss");
            return;
        }
        if order.state == OrderState::PendingCreate {
            let timeout = chrono::Duration::from_std(self.request_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
            if self.clock.age_of(order.created_at) < timeout {
                debug!(client_order_id = %id, "pending order not yet visible at venue");
                return;
            }
        }

        let misses = {
            let mut not_found = self.not_found.lock().await;
            let count = not_found.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if misses < self.config.max_not_found_retries {
            debug!(client_order_id = %id, misses, "order not found at venue");
            return;
        }

        warn!(client_order_id = %id, misses, "order unknown to venue; marking failed");
        self.not_found.lock().await.remove(id);
        let update = OrderUpdate::for_client(id.clone(), OrderState::Failed, Utc::now());
        self.apply_update(update).await;
    }

    /// Take one server-time sample. Returns the resulting offset in ms.
    pub async fn sync_clock(&self) -> Result<i64> {
        let sent_at = Utc::now();
        let server_time = self.transport.request_server_time().await?;
        let received_at = Utc::now();
        let offset = self.clock.add_sample(sent_at, server_time, received_at);
        debug!(offset_ms = offset, "clock synchronized");
        Ok(offset)
    }

    /// Poll until `shutdown` flips. The cadence tightens while the user
    /// stream is down and never drops below the configured floor.
    pub async fn run_polling(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.config.poll_interval(),
            "polling loop started"
        );
        let mut last_poll = Instant::now();
        let mut last_sync = Instant::now();

        loop {
            let interval = if self.is_stream_up() {
                self.config.poll_interval()
            } else {
                self.config.stream_down_poll_interval()
            };

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = sleep(interval) => {}
                _ = self.wake.notified() => {
                    let floor = self.config.min_poll_interval();
                    let since = last_poll.elapsed();
                    if since < floor && !wait(floor - since, &mut shutdown).await {
                        break;
                    }
                }
            }
            if is_shutdown(&shutdown) {
                break;
            }

            if last_sync.elapsed() >= self.config.time_sync_interval() {
                if let Err(e) = self.sync_clock().await {
                    warn!(error = %e, "clock sync failed");
                }
                last_sync = Instant::now();
            }

            let polled = self.poll_once().await;
            last_poll = Instant::now();
            debug!(polled, stream_up = self.is_stream_up(), "poll cycle complete");

            self.tracker
                .drain_terminal(self.config.terminal_retention())
                .await;
        }
        info!("polling loop stopped");
    }

    /// Keep a user-event subscription alive until `shutdown` flips,
    /// resubscribing with bounded exponential backoff.
    pub async fn run_user_stream(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = STREAM_BACKOFF_MIN;

        while !is_shutdown(&shutdown) {
            self.clock.reset();
            if let Err(e) = self.sync_clock().await {
                warn!(error = %e, "clock sync before subscribe failed");
            }

            match self.transport.subscribe_user_events().await {
                Ok(mut events) => {
                    self.set_stream_up(true);
                    backoff = STREAM_BACKOFF_MIN;

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                self.set_stream_up(false);
                                info!("user stream stopped");
                                return;
                            }
                            next = events.next() => match next {
                                Some(Ok(event)) => self.apply_user_event(event).await,
                                Some(Err(e)) => {
                                    warn!(error = %e, "user stream failed");
                                    break;
                                }
                                None => {
                                    info!("user stream ended");
                                    break;
                                }
                            }
                        }
                    }
                    self.set_stream_up(false);
                }
                Err(e) => {
                    error!(error = %e, backoff = ?backoff, "user stream subscribe failed");
                }
            }

            if !wait(backoff, &mut shutdown).await {
                break;
            }
            backoff = (backoff * 2).min(STREAM_BACKOFF_MAX);
        }
        info!("user stream stopped");
    }

    async fn apply_user_event(&self, event: UserEvent) {
        let res = match event {
            UserEvent::Order(update) => self.tracker.apply_order_update(update).await,
            UserEvent::Trade(trade) => self.tracker.apply_trade_update(trade).await,
        };
        match res {
            Ok(_) => {}
            Err(Error::UnknownOrder(order)) => {
                warn!(order = %order, "dropping stream event for untracked order");
            }
            Err(e) => warn!(error = %e, "stream event not applied"),
        }
    }

    async fn apply_update(&self, update: OrderUpdate) {
        let order = update.order_ref();
        if let Err(e) = self.tracker.apply_order_update(update).await {
            warn!(order = %order, error = %e, "order update not applied");
        }
    }

    fn set_stream_up(&self, up: bool) {
        if self.stream_up.swap(up, Ordering::AcqRel) != up {
            if up {
                info!("user stream up");
            } else {
                warn!("user stream down; polling at tightened cadence");
            }
            self.wake.notify_one();
        }
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `duration` unless shutdown arrives first. Returns `false` on
/// shutdown.
async fn wait(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(duration) => !is_shutdown(shutdown),
        res = shutdown.changed() => res.is_ok() && !is_shutdown(shutdown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{CreateFault, SimulatedVenue};
    use bxconnect_core::{OrderType, Side};
    use rust_decimal_macros::dec;

    fn engine() -> (Arc<SimulatedVenue>, ReconciliationEngine<SimulatedVenue>) {
        let config: Config = toml::from_str(
            r#"
            mode = "paper"

            [venue]
            name = "sim"

            [reconciliation]
            max_not_found_retries = 3

            [transport]
            request_timeout_ms = 0

            [[trading_pairs]]
            symbol = "SOL-USDC"
            min_order_size = 0.1
            price_increment = 0.01
            amount_increment = 0.1
            "#,
        )
        .unwrap();
        let venue = Arc::new(SimulatedVenue::from_config(&config));
        let clock = Arc::new(SynchronizedClock::new());
        let (tracker, _events) =
            OrderTracker::new(clock.clone(), config.reconciliation.fill_grace_period());
        let engine = ReconciliationEngine::new(venue.clone(), tracker, clock, &config);
        (venue, engine)
    }

    fn spec() -> OrderSpec {
        OrderSpec {
            trading_pair: "SOL-USDC".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: dec!(100),
            amount: dec!(1),
        }
    }

    #[tokio::test]
    async fn miss_counts_dropped_once_order_leaves_live_set() {
        let (venue, engine) = engine();
        let id = ClientOrderId::from("lost");
        venue.fail_next_create(CreateFault::Lost).await;
        engine.place_order(id.clone(), spec()).await.unwrap();

        engine.poll_once().await;
        assert_eq!(engine.not_found.lock().await.get(&id), Some(&1));

        let update = OrderUpdate::for_client(id.clone(), OrderState::Cancelled, Utc::now());
        engine.tracker().apply_order_update(update).await.unwrap();

        assert_eq!(engine.poll_once().await, 0);
        assert!(engine.not_found.lock().await.is_empty());
    }

    #[tokio::test]
    async fn in_flight_create_is_not_counted_missing() {
        let (_venue, engine) = engine();
        let id = ClientOrderId::from("slow");
        let order = Order::new(id.clone(), &spec(), Utc::now());
        engine.tracker().register(order.clone()).await.unwrap();

        {
            let _guard = InFlight::enter(&engine.in_flight, &id);
            for _ in 0..5 {
                engine.record_not_found(&order).await;
            }
            assert!(engine.not_found.lock().await.is_empty());
        }
        assert!(!InFlight::contains(&engine.in_flight, &id));

        engine.record_not_found(&order).await;
        assert_eq!(engine.not_found.lock().await.get(&id), Some(&1));
        let tracked = engine.tracker().get(&id).await.unwrap();
        assert_eq!(tracked.state, OrderState::PendingCreate);
    }
}
