use std::pin::Pin;

use async_trait::async_trait;
use bxconnect_core::{
    CancelOutcome, ClientOrderId, CreateAck, Order, OrderSpec, OrderUpdate, Result, TradeUpdate,
    UserEvent,
};
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::profile::VenueProfile;

/// Decoded events from the authenticated user stream. Ends when the
/// subscription drops; the subscriber must resubscribe.
pub type UserEventStream = Pin<Box<dyn Stream<Item = Result<UserEvent>> + Send>>;

/// Typed request/response contract between the reconciliation engine and a
/// venue.
///
/// Implementations retry transient network failures themselves, with bounded
/// backoff. A `Transport` error returned from here means retries are spent
/// (or a non-idempotent request timed out) and the outcome is unknown.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn profile(&self) -> &dyn VenueProfile;

    /// Current venue view of `order`, or `None` if the venue has no such order.
    async fn request_order_status(&self, order: &Order) -> Result<Option<OrderUpdate>>;

    /// All fills the venue has recorded for `order`.
    async fn request_fills(&self, order: &Order) -> Result<Vec<TradeUpdate>>;

    async fn request_create_order(
        &self,
        client_order_id: &ClientOrderId,
        spec: &OrderSpec,
    ) -> Result<CreateAck>;

    async fn request_cancel_order(&self, order: &Order) -> Result<CancelOutcome>;

    /// Open a freshly authenticated user-event subscription.
    async fn subscribe_user_events(&self) -> Result<UserEventStream>;

    async fn request_server_time(&self) -> Result<DateTime<Utc>>;

    /// Release connections. Later requests fail with a transport error.
    async fn close(&self) {}
}
