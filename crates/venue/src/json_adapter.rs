//! Reference JSON mapping.
//!
//! Endpoints (relative to the REST base URL):
//!
//! | call          | request                                          |
//! |---------------|--------------------------------------------------|
//! | create        | `POST /api/v1/orders`                            |
//! | cancel        | `DELETE /api/v1/orders/{id}` or `/client/{cid}`  |
//! | status        | `GET /api/v1/orders/{id}` or `/client/{cid}`     |
//! | fills         | `GET /api/v1/orders/{id}/fills`                  |
//! | server time   | `GET /api/v1/time`                               |
//!
//! The user stream accepts a signed `login` op followed by subscriptions to
//! the `orders` and `fills` channels, and pushes
//! `{"channel": "...", "data": [...]}` frames using the same object shapes as
//! the REST responses.

use std::str::FromStr;

use bxconnect_core::{
    CancelOutcome, ClientOrderId, Config, CreateAck, Error, ExchangeOrderId, FeeConfig, Order,
    OrderSpec, OrderState, OrderType, OrderUpdate, Result, Side, TradeId, TradeUpdate, UserEvent,
};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::adapter::VenueAdapter;
use crate::auth::Authenticator;
use crate::profile::{ConfiguredProfile, VenueProfile};
use crate::request::RestRequest;

const ORDERS_PATH: &str = "/api/v1/orders";
const TIME_PATH: &str = "/api/v1/time";

#[derive(Debug, Clone)]
pub struct JsonRestAdapter {
    profile: ConfiguredProfile,
}

impl JsonRestAdapter {
    pub fn new(profile: ConfiguredProfile) -> Self {
        Self { profile }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ConfiguredProfile::from_config(config))
    }

    fn order_path(order: &Order) -> String {
        match &order.exchange_order_id {
            Some(id) => format!("{ORDERS_PATH}/{id}"),
            None => format!("{ORDERS_PATH}/client/{}", order.client_order_id),
        }
    }

    /// An order object from either REST or the `orders` channel.
    fn order_update_from(raw: &Value) -> Result<OrderUpdate> {
        let status = str_field(raw, "status")?;
        Ok(OrderUpdate {
            client_order_id: opt_str(raw, "client_order_id").map(ClientOrderId::from),
            exchange_order_id: opt_str(raw, "order_id").map(ExchangeOrderId::from),
            new_state: parse_state(status)?,
            timestamp: timestamp_field(raw, "updated_at"),
        })
    }

    /// A fill object from either REST or the `fills` channel. A missing fee is
    /// estimated from the fee schedule.
    fn trade_update_from(&self, raw: &Value, order_type: Option<OrderType>) -> Result<TradeUpdate> {
        let price = decimal_field(raw, "price")?;
        let amount = decimal_field(raw, "amount")?;
        let fee = match raw.get("fee") {
            Some(v) if !v.is_null() => to_decimal(v, "fee")?,
            _ => {
                let order_type = order_type
                    .or_else(|| opt_str(raw, "order_type").and_then(parse_order_type))
                    .unwrap_or(OrderType::Limit);
                self.profile.fee_config().estimate(order_type, amount, price)
            }
        };
        Ok(TradeUpdate {
            trade_id: TradeId::from(str_field(raw, "trade_id")?),
            client_order_id: opt_str(raw, "client_order_id").map(ClientOrderId::from),
            exchange_order_id: opt_str(raw, "order_id").map(ExchangeOrderId::from),
            price,
            amount,
            fee,
            timestamp: timestamp_field(raw, "timestamp"),
        })
    }
}

impl VenueProfile for JsonRestAdapter {
    fn name(&self) -> &str {
        self.profile.name()
    }

    fn supported_order_types(&self) -> &[OrderType] {
        self.profile.supported_order_types()
    }

    fn client_order_id_prefix(&self) -> &str {
        self.profile.client_order_id_prefix()
    }

    fn client_order_id_max_length(&self) -> usize {
        self.profile.client_order_id_max_length()
    }

    fn fee_config(&self) -> &FeeConfig {
        self.profile.fee_config()
    }
}

impl VenueAdapter for JsonRestAdapter {
    fn format_order_request(
        &self,
        client_order_id: &ClientOrderId,
        spec: &OrderSpec,
    ) -> Result<RestRequest> {
        let mut body = json!({
            "client_order_id": client_order_id.as_str(),
            "symbol": spec.trading_pair,
            "side": match spec.side {
                Side::Buy => "buy",
                Side::Sell => "sell",
            },
            "type": match spec.order_type {
                OrderType::Limit => "limit",
                OrderType::LimitMaker => "limit_maker",
                OrderType::Market => "market",
            },
            "amount": spec.amount.to_string(),
        });
        if spec.order_type != OrderType::Market {
            body["price"] = Value::String(spec.price.to_string());
        }
        Ok(RestRequest::post(ORDERS_PATH, body))
    }

    fn format_cancel_request(&self, order: &Order) -> RestRequest {
        RestRequest::delete(Self::order_path(order))
    }

    fn format_status_request(&self, order: &Order) -> RestRequest {
        RestRequest::get(Self::order_path(order))
    }

    fn format_fills_request(&self, order: &Order) -> Option<RestRequest> {
        order
            .exchange_order_id
            .as_ref()
            .map(|id| RestRequest::get(format!("{ORDERS_PATH}/{id}/fills")))
    }

    fn server_time_request(&self) -> RestRequest {
        RestRequest::get(TIME_PATH)
    }

    fn parse_create_response(&self, body: &Value) -> Result<CreateAck> {
        Ok(CreateAck {
            exchange_order_id: ExchangeOrderId::from(str_field(body, "order_id")?),
            timestamp: timestamp_field(body, "timestamp"),
        })
    }

    fn parse_cancel_response(&self, status: u16, body: &Value) -> Result<CancelOutcome> {
        if (200..300).contains(&status) {
            return Ok(CancelOutcome::Cancelled);
        }
        if status == 404 {
            return Ok(CancelOutcome::NotFound);
        }
        match opt_str(body, "code") {
            Some("ORDER_ALREADY_FILLED") | Some("ORDER_CLOSED") => Ok(CancelOutcome::AlreadyDone),
            _ => Err(self.classify_error(status, body)),
        }
    }

    fn parse_order_status(&self, order: &Order, body: &Value) -> Result<OrderUpdate> {
        let mut update = Self::order_update_from(body)?;
        // Responses looked up by exchange id may omit our id.
        if update.client_order_id.is_none() {
            update.client_order_id = Some(order.client_order_id.clone());
        }
        Ok(update)
    }

    fn parse_fill(&self, order: &Order, raw: &Value) -> Result<TradeUpdate> {
        let mut trade = self.trade_update_from(raw, Some(order.order_type))?;
        if trade.client_order_id.is_none() {
            trade.client_order_id = Some(order.client_order_id.clone());
        }
        Ok(trade)
    }

    fn stream_subscription(&self, auth: &Authenticator) -> Result<Vec<Value>> {
        Ok(vec![
            auth.stream_login(auth.clock().now_ms())?,
            json!({"op": "subscribe", "channel": "orders"}),
            json!({"op": "subscribe", "channel": "fills"}),
        ])
    }

    fn parse_user_event(&self, raw: &str) -> Result<Vec<UserEvent>> {
        let msg: Value = serde_json::from_str(raw)?;
        let data = msg.get("data").and_then(Value::as_array);
        match (opt_str(&msg, "channel"), data) {
            (Some("orders"), Some(items)) => items
                .iter()
                .map(|raw| Self::order_update_from(raw).map(UserEvent::Order))
                .collect(),
            (Some("fills"), Some(items)) => items
                .iter()
                .map(|raw| self.trade_update_from(raw, None).map(UserEvent::Trade))
                .collect(),
            _ => {
                if opt_str(&msg, "event") == Some("error") {
                    return Err(Error::Transport(format!("user stream error: {msg}")));
                }
                Ok(Vec::new())
            }
        }
    }

    fn parse_server_time(&self, body: &Value) -> Result<DateTime<Utc>> {
        let ms = body
            .get("server_time")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Transport("missing 'server_time' in response".into()))?;
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| Error::Transport(format!("invalid server time {ms}")))
    }

    fn is_order_not_found(&self, status: u16, body: &Value) -> bool {
        status == 404 || opt_str(body, "code") == Some("ORDER_NOT_FOUND")
    }

    fn is_clock_skew_error(&self, status: u16, body: &Value) -> bool {
        status == 401 && opt_str(body, "code") == Some("INVALID_TIMESTAMP")
    }
}

fn parse_state(status: &str) -> Result<OrderState> {
    match status {
        "pending" => Ok(OrderState::PendingCreate),
        "new" | "open" => Ok(OrderState::Open),
        "partially_filled" => Ok(OrderState::PartiallyFilled),
        "filled" => Ok(OrderState::Filled),
        "cancelled" | "canceled" | "expired" => Ok(OrderState::Cancelled),
        "rejected" | "failed" => Ok(OrderState::Failed),
        other => Err(Error::Transport(format!("unrecognized order status '{other}'"))),
    }
}

fn parse_order_type(s: &str) -> Option<OrderType> {
    match s {
        "limit" => Some(OrderType::Limit),
        "limit_maker" => Some(OrderType::LimitMaker),
        "market" => Some(OrderType::Market),
        _ => None,
    }
}

fn opt_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str> {
    opt_str(v, key).ok_or_else(|| Error::Transport(format!("missing '{key}' field in response")))
}

fn decimal_field(v: &Value, key: &str) -> Result<Decimal> {
    let raw = v
        .get(key)
        .ok_or_else(|| Error::Transport(format!("missing '{key}' field in response")))?;
    to_decimal(raw, key)
}

/// Venues send numbers both as JSON strings and JSON numbers.
fn to_decimal(v: &Value, key: &str) -> Result<Decimal> {
    let text = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(Error::Transport(format!(
                "field '{key}' is not numeric: {other}"
            )))
        }
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| Error::Transport(format!("invalid decimal in '{key}': {e}")))
}

/// Millisecond timestamps; absent or malformed values fall back to now.
fn timestamp_field(v: &Value, key: &str) -> DateTime<Utc> {
    v.get(key)
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> JsonRestAdapter {
        let config: Config = toml::from_str(
            r#"
            mode = "paper"
            [venue]
            name = "reference"
            [fees]
            maker_percent = 0.1
            taker_percent = 0.2
            [[trading_pairs]]
            symbol = "SOL-USDC"
            "#,
        )
        .unwrap();
        JsonRestAdapter::from_config(&config)
    }

    fn order(exchange_id: Option<&str>) -> Order {
        let spec = OrderSpec {
            trading_pair: "SOL-USDC".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: dec!(100),
            amount: dec!(1),
        };
        let mut o = Order::new("BXB1".into(), &spec, Utc::now());
        o.exchange_order_id = exchange_id.map(ExchangeOrderId::from);
        o
    }

    #[test]
    fn formats_create_request() {
        let a = adapter();
        let spec = OrderSpec {
            trading_pair: "SOL-USDC".into(),
            side: Side::Sell,
            order_type: OrderType::LimitMaker,
            price: dec!(101.5),
            amount: dec!(2),
        };
        let req = a.format_order_request(&"BXS9".into(), &spec).unwrap();
        assert_eq!(req.path, "/api/v1/orders");
        let body = req.body.unwrap();
        assert_eq!(body["client_order_id"], "BXS9");
        assert_eq!(body["side"], "sell");
        assert_eq!(body["type"], "limit_maker");
        assert_eq!(body["price"], "101.5");
    }

    #[test]
    fn status_path_prefers_exchange_id() {
        let a = adapter();
        assert_eq!(a.format_status_request(&order(Some("X1"))).path, "/api/v1/orders/X1");
        assert_eq!(
            a.format_status_request(&order(None)).path,
            "/api/v1/orders/client/BXB1"
        );
        assert!(a.format_fills_request(&order(None)).is_none());
    }

    #[test]
    fn parses_order_status_and_fills_client_id_in() {
        let a = adapter();
        let body = json!({"order_id": "X1", "status": "partially_filled", "updated_at": 1_700_000_000_000i64});
        let update = a.parse_order_status(&order(Some("X1")), &body).unwrap();
        assert_eq!(update.new_state, OrderState::PartiallyFilled);
        assert_eq!(update.client_order_id, Some(ClientOrderId::from("BXB1")));
        assert_eq!(update.exchange_order_id, Some(ExchangeOrderId::from("X1")));
    }

    #[test]
    fn parses_fills_and_estimates_missing_fee() {
        let a = adapter();
        let body = json!({"fills": [
            {"trade_id": "t1", "order_id": "X1", "price": "100", "amount": "0.4", "fee": "0.01"},
            {"trade_id": "t2", "order_id": "X1", "price": 100, "amount": 0.6}
        ]});
        let fills = a.parse_fills(&order(Some("X1")), &body).unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].fee, dec!(0.01));
        // taker 0.2% of 60
        assert_eq!(fills[1].fee, dec!(0.12));
        assert_eq!(fills[1].client_order_id, Some(ClientOrderId::from("BXB1")));
    }

    #[test]
    fn cancel_response_distinguishes_outcomes() {
        let a = adapter();
        assert_eq!(a.parse_cancel_response(200, &json!({})).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(a.parse_cancel_response(404, &json!({})).unwrap(), CancelOutcome::NotFound);
        assert_eq!(
            a.parse_cancel_response(400, &json!({"code": "ORDER_ALREADY_FILLED"})).unwrap(),
            CancelOutcome::AlreadyDone
        );
        assert!(matches!(
            a.parse_cancel_response(400, &json!({"code": "BAD_SIGNATURE"})),
            Err(Error::VenueRejection(_))
        ));
        assert!(matches!(
            a.parse_cancel_response(503, &json!({})),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn parses_stream_frames() {
        let a = adapter();
        let orders = a
            .parse_user_event(r#"{"channel":"orders","data":[{"order_id":"X1","client_order_id":"BXB1","status":"open"}]}"#)
            .unwrap();
        assert!(matches!(&orders[..], [UserEvent::Order(u)] if u.is_create_ack()));

        let fills = a
            .parse_user_event(r#"{"channel":"fills","data":[{"trade_id":"t1","order_id":"X1","price":"100","amount":"0.4","fee":"0"}]}"#)
            .unwrap();
        assert!(matches!(&fills[..], [UserEvent::Trade(t)] if t.amount == dec!(0.4)));

        assert!(a.parse_user_event(r#"{"event":"pong"}"#).unwrap().is_empty());
        assert!(a.parse_user_event(r#"{"event":"error","message":"auth"}"#).is_err());
        assert!(a.parse_user_event("not json").is_err());
    }

    #[test]
    fn detects_clock_skew_and_not_found() {
        let a = adapter();
        assert!(a.is_clock_skew_error(401, &json!({"code": "INVALID_TIMESTAMP"})));
        assert!(!a.is_clock_skew_error(401, &json!({"code": "BAD_KEY"})));
        assert!(a.is_order_not_found(400, &json!({"code": "ORDER_NOT_FOUND"})));
        assert!(a.is_order_not_found(404, &json!(null)));
    }

    #[test]
    fn parses_server_time() {
        let a = adapter();
        let t = a.parse_server_time(&json!({"server_time": 1_700_000_000_123i64})).unwrap();
        assert_eq!(t.timestamp_millis(), 1_700_000_000_123);
        assert!(a.parse_server_time(&json!({})).is_err());
    }
}
