//! In-memory authoritative record of this connector's orders.
//!
//! All mutation goes through one lock, so cross-order checks (client id
//! uniqueness, exchange id mapping) are atomic and lifecycle events leave in
//! exactly the order the mutations happened.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bxconnect_core::{
    ClientOrderId, Error, ExchangeOrderId, Order, OrderEvent, OrderEventKind, OrderState,
    OrderUpdate, Result, SynchronizedClock, Trade, TradeUpdate,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Ordered lifecycle events for the bot engine.
pub type EventStream = Pin<Box<dyn Stream<Item = OrderEvent> + Send>>;

struct Entry {
    order: Order,
    /// When the venue first reported FILLED while trades were still missing.
    venue_filled_since: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TrackerState {
    orders: HashMap<ClientOrderId, Entry>,
    by_exchange_id: HashMap<ExchangeOrderId, ClientOrderId>,
    /// Drained ids. Never reusable within the session.
    retired: HashSet<ClientOrderId>,
}

impl TrackerState {
    fn resolve(
        &self,
        client_id: Option<&ClientOrderId>,
        exchange_id: Option<&ExchangeOrderId>,
    ) -> Option<ClientOrderId> {
        if let Some(id) = client_id {
            if self.orders.contains_key(id) {
                return Some(id.clone());
            }
        }
        exchange_id
            .and_then(|x| self.by_exchange_id.get(x))
            .cloned()
    }

    /// Remember a venue id learned from any update.
    fn learn_exchange_id(&mut self, client_id: &ClientOrderId, exchange_id: Option<&ExchangeOrderId>) {
        let Some(exchange_id) = exchange_id else {
            return;
        };
        let Some(entry) = self.orders.get_mut(client_id) else {
            return;
        };
        match &entry.order.exchange_order_id {
            None => {
                entry.order.exchange_order_id = Some(exchange_id.clone());
                self.by_exchange_id
                    .insert(exchange_id.clone(), client_id.clone());
                debug!(client_order_id = %client_id, exchange_order_id = %exchange_id, "exchange id assigned");
            }
            Some(known) if known != exchange_id => {
                warn!(
                    client_order_id = %client_id,
                    known = %known,
                    reported = %exchange_id,
                    "conflicting exchange id ignored"
                );
            }
            Some(_) => {}
        }
    }
}

/// Thread-safe order tracker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OrderTracker {
    state: Arc<Mutex<TrackerState>>,
    events: mpsc::UnboundedSender<OrderEvent>,
    clock: Arc<SynchronizedClock>,
    fill_grace: chrono::Duration,
}

impl OrderTracker {
    /// Build a tracker and the stream its lifecycle events are delivered on.
    ///
    /// * `fill_grace` -- how long a venue FILLED status may wait for the
    ///   trades that complete the order before it is applied anyway.
    pub fn new(clock: Arc<SynchronizedClock>, fill_grace: Duration) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            events: tx,
            clock,
            fill_grace: chrono::Duration::from_std(fill_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        };

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        (tracker, Box::pin(events))
    }

    /// Start tracking `order` in `PendingCreate`.
    pub async fn register(&self, mut order: Order) -> Result<Order> {
        let mut state = self.state.lock().await;
        let id = order.client_order_id.clone();
        if state.orders.contains_key(&id) || state.retired.contains(&id) {
            return Err(Error::DuplicateOrder(id));
        }

        let now = self.clock.now();
        order.state = OrderState::PendingCreate;
        order.created_at = now;
        order.updated_at = now;
        let exchange_id = order.exchange_order_id.take();

        state.orders.insert(
            id.clone(),
            Entry {
                order: order.clone(),
                venue_filled_since: None,
            },
        );
        state.learn_exchange_id(&id, exchange_id.as_ref());

        info!(
            client_order_id = %id,
            pair = %order.trading_pair,
            side = %order.side,
            order_type = %order.order_type,
            price = %order.price,
            amount = %order.amount,
            "order registered"
        );
        let order = state.orders[&id].order.clone();
        self.emit(OrderEventKind::OrderCreated, &order, None);
        Ok(order)
    }

    /// Apply a venue-reported state.
    ///
    /// Returns the updated order when something changed, `None` for no-ops:
    /// backward moves, repeated terminal states, or a create acknowledgment
    /// for an order this session never placed.
    pub async fn apply_order_update(&self, update: OrderUpdate) -> Result<Option<Order>> {
        let mut state = self.state.lock().await;
        let Some(id) = state.resolve(
            update.client_order_id.as_ref(),
            update.exchange_order_id.as_ref(),
        ) else {
            if update.is_create_ack() {
                debug!(order = %update.order_ref(), "ignoring create ack for untracked order");
                return Ok(None);
            }
            return Err(Error::UnknownOrder(update.order_ref()));
        };

        state.learn_exchange_id(&id, update.exchange_order_id.as_ref());

        let now = self.clock.now();
        let Some(entry) = state.orders.get_mut(&id) else {
            return Err(Error::UnknownOrder(update.order_ref()));
        };

        if entry.order.is_terminal() {
            debug!(client_order_id = %id, state = %entry.order.state, reported = %update.new_state, "update for terminal order ignored");
            return Ok(None);
        }

        let mut emitted = Vec::new();
        match update.new_state {
            OrderState::PendingCreate => {}
            OrderState::Open | OrderState::PartiallyFilled => {
                ensure_live(entry, now, &mut emitted);
            }
            OrderState::Filled => {
                if entry.order.is_fully_filled() {
                    transition(entry, OrderState::Filled, now, &mut emitted);
                } else {
                    let since = *entry.venue_filled_since.get_or_insert(now);
                    if now - since >= self.fill_grace {
                        warn!(
                            client_order_id = %id,
                            filled = %entry.order.filled_amount,
                            amount = %entry.order.amount,
                            "venue reports filled but trades are missing; forcing FILLED"
                        );
                        transition(entry, OrderState::Filled, now, &mut emitted);
                    } else {
                        debug!(client_order_id = %id, "venue reports filled, waiting for trades");
                        ensure_live(entry, now, &mut emitted);
                    }
                }
            }
            terminal @ (OrderState::Cancelled | OrderState::Failed) => {
                transition(entry, terminal, now, &mut emitted);
            }
        }

        if emitted.is_empty() {
            return Ok(None);
        }
        let order = entry.order.clone();
        for kind in emitted {
            self.emit(kind, &order, None);
        }
        Ok(Some(order))
    }

    /// Merge one fill. Applying the same trade id twice is a no-op.
    pub async fn apply_trade_update(&self, update: TradeUpdate) -> Result<Option<Order>> {
        let mut state = self.state.lock().await;
        let Some(id) = state.resolve(
            update.client_order_id.as_ref(),
            update.exchange_order_id.as_ref(),
        ) else {
            return Err(Error::UnknownOrder(update.order_ref()));
        };

        state.learn_exchange_id(&id, update.exchange_order_id.as_ref());

        let now = self.clock.now();
        let Some(entry) = state.orders.get_mut(&id) else {
            return Err(Error::UnknownOrder(update.order_ref()));
        };

        if entry.order.has_trade(&update.trade_id) {
            debug!(client_order_id = %id, trade_id = %update.trade_id, "duplicate trade ignored");
            return Ok(None);
        }

        let trade = Trade {
            trade_id: update.trade_id,
            client_order_id: id.clone(),
            price: update.price,
            amount: update.amount,
            fee: update.fee,
            timestamp: update.timestamp,
        };

        let remaining = entry.order.remaining_amount();
        let applied = trade.amount.min(remaining).max(Decimal::ZERO);
        if applied < trade.amount {
            warn!(
                client_order_id = %id,
                trade_id = %trade.trade_id,
                trade_amount = %trade.amount,
                remaining = %remaining,
                "fill exceeds remaining amount; capping"
            );
        }

        let mut emitted = Vec::new();
        // A fill proves the venue accepted the order.
        if entry.order.state == OrderState::PendingCreate {
            transition(entry, OrderState::Open, now, &mut emitted);
        }

        let order = &mut entry.order;
        order.filled_amount += applied;
        order.filled_quote += applied * trade.price;
        order.fee_paid += trade.fee;
        order.fills.push(trade.clone());
        order.updated_at = now;

        if applied.is_zero() {
            // Recorded for idempotence only.
            let order = order.clone();
            for kind in &emitted {
                self.emit(*kind, &order, None);
            }
            return Ok((!emitted.is_empty()).then_some(order));
        }

        let fill_kind = if order.is_terminal() {
            OrderEventKind::OrderPartiallyFilled
        } else if order.is_fully_filled() {
            order.state = OrderState::Filled;
            OrderEventKind::OrderFilled
        } else {
            order.state = OrderState::PartiallyFilled;
            OrderEventKind::OrderPartiallyFilled
        };

        info!(
            client_order_id = %id,
            trade_id = %trade.trade_id,
            price = %trade.price,
            amount = %applied,
            filled = %order.filled_amount,
            requested = %order.amount,
            state = %order.state,
            "fill applied"
        );

        let order = order.clone();
        for kind in emitted {
            self.emit(kind, &order, None);
        }
        self.emit(fill_kind, &order, Some(trade));
        Ok(Some(order))
    }

    /// Point-in-time copy of all non-terminal orders, oldest first.
    pub async fn snapshot(&self) -> Vec<Order> {
        let state = self.state.lock().await;
        let mut live: Vec<Order> = state
            .orders
            .values()
            .filter(|e| !e.order.is_terminal())
            .map(|e| e.order.clone())
            .collect();
        live.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.client_order_id.cmp(&b.client_order_id))
        });
        live
    }

    /// Every tracked order, terminal ones included, oldest first.
    pub async fn all_orders(&self) -> Vec<Order> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state.orders.values().map(|e| e.order.clone()).collect();
        orders.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.client_order_id.cmp(&b.client_order_id))
        });
        orders
    }

    pub async fn get(&self, id: &ClientOrderId) -> Option<Order> {
        let state = self.state.lock().await;
        state.orders.get(id).map(|e| e.order.clone())
    }

    pub async fn find_by_exchange_id(&self, id: &ExchangeOrderId) -> Option<Order> {
        let state = self.state.lock().await;
        state
            .by_exchange_id
            .get(id)
            .and_then(|cid| state.orders.get(cid))
            .map(|e| e.order.clone())
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn live_order_count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .orders
            .values()
            .filter(|e| !e.order.is_terminal())
            .count()
    }

    /// Remove terminal orders last updated more than `retention` ago.
    /// Their ids stay reserved for the rest of the session.
    pub async fn drain_terminal(&self, retention: Duration) -> Vec<Order> {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = self.clock.now() - retention;
        let mut state = self.state.lock().await;

        let expired: Vec<ClientOrderId> = state
            .orders
            .iter()
            .filter(|(_, e)| e.order.is_terminal() && e.order.updated_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut drained = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = state.orders.remove(&id) {
                if let Some(x) = &entry.order.exchange_order_id {
                    state.by_exchange_id.remove(x);
                }
                state.retired.insert(id);
                drained.push(entry.order);
            }
        }

        if !drained.is_empty() {
            debug!(count = drained.len(), "drained terminal orders");
        }
        drained
    }

    fn emit(&self, kind: OrderEventKind, order: &Order, trade: Option<Trade>) {
        let event = OrderEvent {
            kind,
            client_order_id: order.client_order_id.clone(),
            order: order.clone(),
            trade,
        };
        if self.events.send(event).is_err() {
            debug!(client_order_id = %order.client_order_id, %kind, "event receiver dropped");
        }
    }
}

/// Move a pending or live order to its fill-derived live state.
///
/// The live state is a function of the fills seen so far, never of which
/// channel reported first: `PartiallyFilled` once anything has filled,
/// otherwise `Open`.
fn ensure_live(entry: &mut Entry, now: DateTime<Utc>, emitted: &mut Vec<OrderEventKind>) {
    let target = if entry.order.filled_amount > Decimal::ZERO {
        OrderState::PartiallyFilled
    } else {
        OrderState::Open
    };
    if entry.order.state == OrderState::PendingCreate
        || (entry.order.state == OrderState::Open && target == OrderState::PartiallyFilled)
    {
        transition(entry, target, now, emitted);
    }
}

fn transition(
    entry: &mut Entry,
    next: OrderState,
    now: DateTime<Utc>,
    emitted: &mut Vec<OrderEventKind>,
) {
    let order = &mut entry.order;
    let prev = order.state;
    if !prev.can_transition_to(next) {
        debug!(client_order_id = %order.client_order_id, from = %prev, to = %next, "transition not permitted");
        return;
    }
    order.state = next;
    order.updated_at = now;

    info!(client_order_id = %order.client_order_id, from = %prev, to = %next, "order state updated");

    let kind = match next {
        OrderState::Open | OrderState::PartiallyFilled if prev == OrderState::PendingCreate => {
            Some(OrderEventKind::OrderOpened)
        }
        OrderState::PartiallyFilled => Some(OrderEventKind::OrderPartiallyFilled),
        OrderState::Filled => Some(OrderEventKind::OrderFilled),
        OrderState::Cancelled => Some(OrderEventKind::OrderCancelled),
        OrderState::Failed => Some(OrderEventKind::OrderFailed),
        OrderState::Open | OrderState::PendingCreate => None,
    };
    if let Some(kind) = kind {
        emitted.push(kind);
    }
}
