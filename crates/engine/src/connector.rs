use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use bxconnect_core::{
    CancelAck, ClientOrderId, ClientOrderIdGenerator, Config, Error, Order, OrderSpec, OrderType,
    Result, SynchronizedClock,
};
use bxconnect_venue::Transport;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::reconciler::ReconciliationEngine;
use crate::tracker::{EventStream, OrderTracker};

/// Engine-facing surface of one venue connection.
///
/// Validates and submits orders, exposes the tracked book, and owns the
/// background tasks that keep it reconciled once [`Connector::start`] runs.
pub struct Connector<T: Transport> {
    engine: Arc<ReconciliationEngine<T>>,
    config: Config,
    ids: ClientOrderIdGenerator,
    clock: Arc<SynchronizedClock>,
    events: std::sync::Mutex<Option<EventStream>>,
    started: AtomicBool,
}

impl<T: Transport> Connector<T> {
    /// Build a connector over `transport`. `clock` must be the clock the
    /// transport signs with.
    pub fn new(transport: Arc<T>, clock: Arc<SynchronizedClock>, config: Config) -> Result<Self> {
        config.validate()?;
        let profile = transport.profile();
        let ids = ClientOrderIdGenerator::new(
            profile.client_order_id_prefix(),
            profile.client_order_id_max_length(),
        )?;

        let (tracker, events) = OrderTracker::new(
            clock.clone(),
            config.reconciliation.fill_grace_period(),
        );
        let engine = Arc::new(ReconciliationEngine::new(
            transport,
            tracker,
            clock.clone(),
            &config,
        ));

        Ok(Self {
            engine,
            config,
            ids,
            clock,
            events: std::sync::Mutex::new(Some(events)),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.engine.transport().profile().name()
    }

    pub fn is_trading_required(&self) -> bool {
        self.config.trading_required
    }

    /// Cancellation is confirmed by the venue's reply, not by a later event.
    pub fn is_cancel_request_synchronous(&self) -> bool {
        true
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.transport.request_timeout()
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.reconciliation.poll_interval()
    }

    pub fn min_poll_interval(&self) -> Duration {
        self.config.reconciliation.min_poll_interval()
    }

    pub fn supported_order_types(&self) -> Vec<OrderType> {
        self.engine.transport().profile().supported_order_types().to_vec()
    }

    /// Quote-denominated fee estimate for a prospective order.
    pub fn estimate_fee(&self, order_type: OrderType, amount: Decimal, price: Decimal) -> Decimal {
        self.engine
            .transport()
            .profile()
            .fee_config()
            .estimate(order_type, amount, price)
    }

    /// Started, clock synchronized, and the user stream is up.
    pub fn is_ready(&self) -> bool {
        self.started.load(Ordering::Acquire)
            && self.clock.sample_count() > 0
            && self.engine.is_stream_up()
    }

    pub fn clock(&self) -> &Arc<SynchronizedClock> {
        &self.clock
    }

    pub fn transport(&self) -> &Arc<T> {
        self.engine.transport()
    }

    /// The lifecycle event stream. Handed out once.
    pub fn events(&self) -> Option<EventStream> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Place an order under a freshly generated client order id.
    ///
    /// Returns the id as soon as the venue has answered or the request has
    /// failed in transit; the order's fate is reported through events.
    pub async fn place_order(&self, spec: OrderSpec) -> Result<ClientOrderId> {
        let id = self.ids.next_id(spec.side);
        self.place_order_with_id(id, spec).await
    }

    /// Place an order under a caller-chosen client order id.
    pub async fn place_order_with_id(&self, id: ClientOrderId, spec: OrderSpec) -> Result<ClientOrderId> {
        let max_len = self.engine.transport().profile().client_order_id_max_length();
        if id.as_str().is_empty() || id.as_str().len() > max_len {
            return Err(Error::InvalidOrder(format!(
                "client order id '{id}' must be 1..={max_len} characters"
            )));
        }
        let spec = self.prepare(spec)?;

        let order = self.engine.place_order(id.clone(), spec).await?;
        info!(client_order_id = %id, state = %order.state, "placement finished");
        Ok(id)
    }

    pub async fn cancel_order(&self, id: &ClientOrderId) -> Result<CancelAck> {
        self.engine.cancel_order(id).await
    }

    /// Non-terminal orders.
    pub async fn tracked_orders(&self) -> Vec<Order> {
        self.engine.tracker().snapshot().await
    }

    pub async fn all_orders(&self) -> Vec<Order> {
        self.engine.tracker().all_orders().await
    }

    pub async fn get_order(&self, id: &ClientOrderId) -> Option<Order> {
        self.engine.tracker().get(id).await
    }

    /// Run one reconciliation pass now.
    pub async fn poll_now(&self) -> usize {
        self.engine.poll_once().await
    }

    /// Check an order against trading rules and snap it to the pair's
    /// increments.
    fn prepare(&self, mut spec: OrderSpec) -> Result<OrderSpec> {
        if !self.config.trading_required {
            return Err(Error::InvalidOrder("trading is disabled for this connector".into()));
        }
        let rules = self
            .config
            .trading_pair(&spec.trading_pair)
            .ok_or_else(|| {
                Error::InvalidOrder(format!("trading pair {} not configured", spec.trading_pair))
            })?;
        if !self.supported_order_types().contains(&spec.order_type) {
            return Err(Error::InvalidOrder(format!(
                "order type {} not supported by {}",
                spec.order_type,
                self.name()
            )));
        }

        if spec.order_type != OrderType::Market {
            spec.price = rules.quantize_price(spec.side, spec.price);
            if spec.price <= Decimal::ZERO {
                return Err(Error::InvalidOrder(format!(
                    "price {} must be positive",
                    spec.price
                )));
            }
        }
        spec.amount = rules.quantize_amount(spec.amount);
        if spec.amount <= Decimal::ZERO || spec.amount < rules.min_order_size {
            return Err(Error::InvalidOrder(format!(
                "amount {} below minimum order size {}",
                spec.amount, rules.min_order_size
            )));
        }
        Ok(spec)
    }

    /// Spawn the polling and user-stream tasks.
    pub fn start(&self) -> Result<ConnectorHandle<T>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Config("connector already started".into()));
        }
        let (tx, rx) = watch::channel(false);

        let engine = self.engine.clone();
        let poll_rx = rx.clone();
        let polling = tokio::spawn(async move { engine.run_polling(poll_rx).await });

        let engine = self.engine.clone();
        let stream = tokio::spawn(async move { engine.run_user_stream(rx).await });

        info!(venue = %self.name(), mode = ?self.config.mode, "connector started");
        Ok(ConnectorHandle {
            shutdown: tx,
            polling,
            stream,
            transport: self.engine.transport().clone(),
        })
    }
}

/// Owns the connector's background tasks. Dropping it stops them at their
/// next await point but leaves the transport open.
pub struct ConnectorHandle<T: Transport> {
    shutdown: watch::Sender<bool>,
    polling: JoinHandle<()>,
    stream: JoinHandle<()>,
    transport: Arc<T>,
}

impl<T: Transport> ConnectorHandle<T> {
    /// Signal both tasks, wait for them, then release the transport.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in [("polling", self.polling), ("user stream", self.stream)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "background task failed");
            }
        }
        self.transport.close().await;
        info!("connector stopped");
    }
}
