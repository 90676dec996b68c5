use bxconnect_core::{
    CancelOutcome, ClientOrderId, CreateAck, Error, Order, OrderSpec, OrderUpdate, Result,
    TradeUpdate, UserEvent,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::auth::Authenticator;
use crate::profile::VenueProfile;
use crate::request::{RestRequest, SignedRequest};

/// Per-venue wire mapping, composed into [`crate::HttpTransport`].
///
/// Everything venue-specific lives here: how requests are authenticated and
/// shaped, and how responses and stream messages translate into the
/// connector's update types. The reconciliation logic never sees raw JSON.
pub trait VenueAdapter: VenueProfile + 'static {
    fn authenticate(&self, auth: &Authenticator, request: &RestRequest) -> Result<SignedRequest> {
        auth.sign_now(request)
    }

    fn format_order_request(
        &self,
        client_order_id: &ClientOrderId,
        spec: &OrderSpec,
    ) -> Result<RestRequest>;

    fn format_cancel_request(&self, order: &Order) -> RestRequest;

    fn format_status_request(&self, order: &Order) -> RestRequest;

    /// `None` when fills cannot be requested yet (no venue id assigned).
    fn format_fills_request(&self, order: &Order) -> Option<RestRequest>;

    fn server_time_request(&self) -> RestRequest;

    fn parse_create_response(&self, body: &Value) -> Result<CreateAck>;

    /// Interpret a cancel response of any status code.
    fn parse_cancel_response(&self, status: u16, body: &Value) -> Result<CancelOutcome>;

    fn parse_order_status(&self, order: &Order, body: &Value) -> Result<OrderUpdate>;

    fn parse_fill(&self, order: &Order, raw: &Value) -> Result<TradeUpdate>;

    fn parse_fills(&self, order: &Order, body: &Value) -> Result<Vec<TradeUpdate>> {
        let entries = body
            .as_array()
            .or_else(|| body.get("fills").and_then(Value::as_array))
            .ok_or_else(|| Error::Transport("fills response is not a list".into()))?;
        entries.iter().map(|raw| self.parse_fill(order, raw)).collect()
    }

    /// Messages sent right after the socket opens: login, then subscriptions.
    fn stream_subscription(&self, auth: &Authenticator) -> Result<Vec<Value>>;

    /// Zero or more events from one stream message. Heartbeats and acks
    /// decode to nothing.
    fn parse_user_event(&self, raw: &str) -> Result<Vec<UserEvent>>;

    fn parse_server_time(&self, body: &Value) -> Result<DateTime<Utc>>;

    fn is_order_not_found(&self, status: u16, _body: &Value) -> bool {
        status == 404
    }

    /// Map a non-success response to a typed error: 429 and 5xx are
    /// transient, any other 4xx is the venue refusing the request.
    fn classify_error(&self, status: u16, body: &Value) -> Error {
        if status == 429 || status >= 500 {
            Error::Transport(format!("HTTP {status}: {body}"))
        } else {
            Error::VenueRejection(format!("HTTP {status}: {body}"))
        }
    }

    /// Whether a rejection was caused by our timestamp drifting outside the
    /// venue's receive window.
    fn is_clock_skew_error(&self, _status: u16, _body: &Value) -> bool {
        false
    }
}
