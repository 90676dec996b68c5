use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bxconnect_core::{
    CancelOutcome, ClientOrderId, CreateAck, Error, Order, OrderSpec, OrderUpdate, Result,
    SynchronizedClock, TradeUpdate, TransportConfig,
};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::adapter::VenueAdapter;
use crate::auth::Authenticator;
use crate::profile::VenueProfile;
use crate::request::{HttpMethod, RestRequest, SignedRequest};
use crate::stream;
use crate::transport::{Transport, UserEventStream};

/// Whether a failed attempt may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Safe to repeat on any transient failure.
    Idempotent,
    /// Repeat only when the request provably never left this host.
    OnlyIfUnsent,
}

/// REST + WebSocket transport for any venue described by a [`VenueAdapter`].
pub struct HttpTransport<A: VenueAdapter> {
    client: Client,
    adapter: Arc<A>,
    auth: Authenticator,
    clock: Arc<SynchronizedClock>,
    rest_url: String,
    ws_url: String,
    config: TransportConfig,
    closed: AtomicBool,
}

impl<A: VenueAdapter> HttpTransport<A> {
    pub fn new(
        adapter: A,
        auth: Authenticator,
        rest_url: impl Into<String>,
        ws_url: impl Into<String>,
        config: TransportConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let clock = auth.clock().clone();
        Ok(Self {
            client,
            adapter: Arc::new(adapter),
            auth,
            clock,
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            ws_url: ws_url.into(),
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Send with retries; returns the final status and decoded body, success
    /// or not. Callers interpret non-success statuses.
    async fn send(&self, request: &RestRequest, retry: Retry, signed: bool) -> Result<(u16, Value)> {
        let mut attempt: u32 = 0;
        let mut resynced = false;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Transport("transport closed".into()));
            }

            // Re-signed per attempt so every retry carries a fresh timestamp.
            let prepared = self.prepare(request, signed)?;
            match self.send_once(&prepared).await {
                Ok((status, body)) => {
                    if (200..300).contains(&status) {
                        return Ok((status, body));
                    }
                    if signed && !resynced && self.adapter.is_clock_skew_error(status, &body) {
                        warn!(path = %request.path, "timestamp rejected, resynchronizing clock");
                        self.sync_clock().await?;
                        resynced = true;
                        continue;
                    }
                    let transient = status == 429 || status >= 500;
                    if transient && retry == Retry::Idempotent && attempt < self.config.max_retries {
                        attempt += 1;
                        let delay = self.config.retry_delay(attempt);
                        debug!(status, attempt, delay_ms = delay.as_millis() as u64, path = %request.path, "retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok((status, body));
                }
                Err(e) => {
                    let retryable = e.is_connect()
                        || (retry == Retry::Idempotent && (e.is_timeout() || e.is_request()));
                    if retryable && attempt < self.config.max_retries {
                        attempt += 1;
                        let delay = self.config.retry_delay(attempt);
                        debug!(error = %e, attempt, delay_ms = delay.as_millis() as u64, path = %request.path, "retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(Error::Transport(format!(
                        "{} {} failed after {} attempt(s): {e}",
                        request.method,
                        request.path,
                        attempt + 1
                    )));
                }
            }
        }
    }

    fn prepare(&self, request: &RestRequest, signed: bool) -> Result<SignedRequest> {
        if signed {
            self.adapter.authenticate(&self.auth, request)
        } else {
            Ok(SignedRequest::unsigned(request.clone()))
        }
    }

    async fn send_once(
        &self,
        prepared: &SignedRequest,
    ) -> std::result::Result<(u16, Value), reqwest::Error> {
        let request = &prepared.request;
        let url = format!("{}{}", self.rest_url, request.path_and_query());
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        for (name, value) in &prepared.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.body.is_some() {
            builder = builder
                .header("Content-Type", "application/json")
                .body(request.body_string());
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }

    /// One server-time round trip recorded into the shared clock.
    async fn sync_clock(&self) -> Result<DateTime<Utc>> {
        let request = SignedRequest::unsigned(self.adapter.server_time_request());
        let sent_at = Utc::now();
        let (status, body) = self
            .send_once(&request)
            .await
            .map_err(|e| Error::Transport(format!("server time request failed: {e}")))?;
        let received_at = Utc::now();
        if !(200..300).contains(&status) {
            return Err(self.adapter.classify_error(status, &body));
        }
        let server_time = self.adapter.parse_server_time(&body)?;
        self.clock.add_sample(sent_at, server_time, received_at);
        Ok(server_time)
    }
}

#[async_trait]
impl<A: VenueAdapter> Transport for HttpTransport<A> {
    fn profile(&self) -> &dyn VenueProfile {
        self.adapter.as_ref()
    }

    #[instrument(skip(self, order), fields(client_order_id = %order.client_order_id))]
    async fn request_order_status(&self, order: &Order) -> Result<Option<OrderUpdate>> {
        let request = self.adapter.format_status_request(order);
        let (status, body) = self.send(&request, Retry::Idempotent, true).await?;
        if (200..300).contains(&status) {
            return self.adapter.parse_order_status(order, &body).map(Some);
        }
        if self.adapter.is_order_not_found(status, &body) {
            return Ok(None);
        }
        Err(self.adapter.classify_error(status, &body))
    }

    #[instrument(skip(self, order), fields(client_order_id = %order.client_order_id))]
    async fn request_fills(&self, order: &Order) -> Result<Vec<TradeUpdate>> {
        let Some(request) = self.adapter.format_fills_request(order) else {
            return Ok(Vec::new());
        };
        let (status, body) = self.send(&request, Retry::Idempotent, true).await?;
        if (200..300).contains(&status) {
            return self.adapter.parse_fills(order, &body);
        }
        if self.adapter.is_order_not_found(status, &body) {
            return Ok(Vec::new());
        }
        Err(self.adapter.classify_error(status, &body))
    }

    #[instrument(skip(self, spec), fields(pair = %spec.trading_pair, side = %spec.side))]
    async fn request_create_order(
        &self,
        client_order_id: &ClientOrderId,
        spec: &OrderSpec,
    ) -> Result<CreateAck> {
        let request = self.adapter.format_order_request(client_order_id, spec)?;
        let (status, body) = self.send(&request, Retry::OnlyIfUnsent, true).await?;
        if (200..300).contains(&status) {
            return self.adapter.parse_create_response(&body);
        }
        Err(self.adapter.classify_error(status, &body))
    }

    #[instrument(skip(self, order), fields(client_order_id = %order.client_order_id))]
    async fn request_cancel_order(&self, order: &Order) -> Result<CancelOutcome> {
        let request = self.adapter.format_cancel_request(order);
        let (status, body) = self.send(&request, Retry::Idempotent, true).await?;
        self.adapter.parse_cancel_response(status, &body)
    }

    async fn subscribe_user_events(&self) -> Result<UserEventStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("transport closed".into()));
        }
        stream::connect_user_stream(&self.ws_url, self.adapter.clone(), &self.auth).await
    }

    async fn request_server_time(&self) -> Result<DateTime<Utc>> {
        let request = self.adapter.server_time_request();
        let (status, body) = self.send(&request, Retry::Idempotent, false).await?;
        if !(200..300).contains(&status) {
            return Err(self.adapter.classify_error(status, &body));
        }
        self.adapter.parse_server_time(&body)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(venue = self.adapter.name(), "transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::json_adapter::JsonRestAdapter;
    use bxconnect_core::{Config, OrderState, OrderType, Side};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves the canned `(status, body)` responses in order, one per
    /// connection, recording each request line.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let n = sock.read(&mut buf).await.unwrap();
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                log.lock()
                    .unwrap()
                    .push(head.lines().next().unwrap_or_default().to_string());
                let resp = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
                sock.shutdown().await.ok();
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn transport(rest_url: &str) -> HttpTransport<JsonRestAdapter> {
        let config: Config = toml::from_str(
            r#"
            mode = "paper"
            [venue]
            name = "reference"
            [[trading_pairs]]
            symbol = "SOL-USDC"
            "#,
        )
        .unwrap();
        let auth = Authenticator::new(
            Credentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
            },
            Arc::new(SynchronizedClock::new()),
        )
        .unwrap();
        let transport_config = TransportConfig {
            request_timeout_ms: 2_000,
            max_retries: 2,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
        };
        HttpTransport::new(
            JsonRestAdapter::from_config(&config),
            auth,
            rest_url,
            "ws://127.0.0.1:1",
            transport_config,
        )
        .unwrap()
    }

    fn order() -> Order {
        let spec = OrderSpec {
            trading_pair: "SOL-USDC".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: dec!(100),
            amount: dec!(1),
        };
        let mut o = Order::new("BXB1".into(), &spec, Utc::now());
        o.exchange_order_id = Some("X1".into());
        o
    }

    #[tokio::test]
    async fn status_retries_server_errors() {
        let (url, seen) = serve(vec![
            (503, r#"{"code":"BUSY"}"#),
            (200, r#"{"order_id":"X1","status":"open"}"#),
        ])
        .await;
        let t = transport(&url);
        let update = t.request_order_status(&order()).await.unwrap().unwrap();
        assert_eq!(update.new_state, OrderState::Open);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(seen.lock().unwrap()[0].starts_with("GET /api/v1/orders/X1"));
    }

    #[tokio::test]
    async fn status_not_found_is_none() {
        let (url, _) = serve(vec![(404, r#"{"code":"ORDER_NOT_FOUND"}"#)]).await;
        let t = transport(&url);
        assert!(t.request_order_status(&order()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_of_filled_order_is_already_done() {
        let (url, seen) = serve(vec![(400, r#"{"code":"ORDER_ALREADY_FILLED"}"#)]).await;
        let t = transport(&url);
        let outcome = t.request_cancel_order(&order()).await.unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyDone);
        assert!(seen.lock().unwrap()[0].starts_with("DELETE /api/v1/orders/X1"));
    }

    #[tokio::test]
    async fn clock_skew_triggers_resync_and_retry() {
        let (url, seen) = serve(vec![
            (401, r#"{"code":"INVALID_TIMESTAMP"}"#),
            (200, r#"{"server_time":4102444800000}"#),
            (200, r#"{"order_id":"X1","status":"filled"}"#),
        ])
        .await;
        let t = transport(&url);
        let update = t.request_order_status(&order()).await.unwrap().unwrap();
        assert_eq!(update.new_state, OrderState::Filled);
        assert!(seen.lock().unwrap()[1].starts_with("GET /api/v1/time"));
        // Server claims 2100-01-01, so the offset is far in the future.
        assert!(t.clock.offset_ms() > 0);
    }

    #[tokio::test]
    async fn closed_transport_refuses_requests() {
        let t = transport("http://127.0.0.1:1");
        t.close().await;
        assert!(matches!(
            t.request_order_status(&order()).await,
            Err(Error::Transport(_))
        ));
        assert!(t.subscribe_user_events().await.is_err());
    }
}
