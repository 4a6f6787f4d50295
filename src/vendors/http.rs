use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode, header::HeaderMap};
use serde_json::{Value, json};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    error::{VendorError, VendorErrorKind},
    models::{
        notification::{Channel, MessageContent, NotificationPayload},
        vendor::{DeliveryState, HealthReport, SendReceipt, Vendor, VendorStatus},
    },
    vendors::{AttemptContext, SendCounters, VendorAdapter, VendorSettings},
};

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A vendor-native request, relative to the vendor's base URL.
#[derive(Debug, Clone)]
pub struct VendorRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
}

impl VendorRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Json(body),
        }
    }

    pub fn post_form(path: impl Into<String>, fields: Vec<(&str, String)>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Form(
                fields
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VendorResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Translation between the uniform adapter contract and one vendor's wire
/// protocol. Implementations do no I/O.
pub trait VendorProtocol: Send + Sync + 'static {
    const VENDOR: Vendor;
    const DEFAULT_BASE_URL: &'static str;

    fn authorize(&self, request: RequestBuilder, settings: &VendorSettings) -> RequestBuilder {
        request.bearer_auth(&settings.api_key)
    }

    /// Builds the native send request, or explains why the payload cannot be
    /// expressed in this vendor's protocol.
    fn send_request(
        &self,
        settings: &VendorSettings,
        channel: Channel,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<VendorRequest, String>;

    fn message_id(&self, response: &VendorResponse) -> Option<String>;

    /// `None` when the vendor has no per-message status lookup.
    fn status_request(
        &self,
        settings: &VendorSettings,
        channel: Channel,
        message_id: &str,
    ) -> Option<VendorRequest>;

    fn native_status(&self, response: &VendorResponse) -> Option<String>;

    fn normalize(&self, native_status: &str) -> DeliveryState;

    fn status_timestamps(&self, _response: &VendorResponse) -> HashMap<String, DateTime<Utc>> {
        HashMap::new()
    }

    fn health_request(&self, settings: &VendorSettings) -> VendorRequest;
}

/// Maps a non-success HTTP status onto the four vendor error kinds.
pub fn classify_status(status: StatusCode) -> Option<VendorErrorKind> {
    if status.is_success() {
        None
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Some(VendorErrorKind::Auth)
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(VendorErrorKind::RateLimited)
    } else if status.is_client_error() {
        Some(VendorErrorKind::InvalidRequest)
    } else {
        Some(VendorErrorKind::Unavailable)
    }
}

pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn collect_timestamps(body: &Value, fields: &[&str]) -> HashMap<String, DateTime<Utc>> {
    fields
        .iter()
        .filter_map(|field| Some((field.to_string(), parse_timestamp(body.get(*field)?)?)))
        .collect()
}

/// Generic HTTP adapter driving one [`VendorProtocol`].
pub struct HttpVendorAdapter<P: VendorProtocol> {
    protocol: P,
    settings: VendorSettings,
    base_url: String,
    http_client: Client,
    timeout: Duration,
    counters: SendCounters,
}

impl<P: VendorProtocol> HttpVendorAdapter<P> {
    pub fn new(protocol: P, settings: VendorSettings, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(P::DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        info!(vendor = %P::VENDOR, base_url = %base_url, "Vendor adapter initialized");

        Ok(Self {
            protocol,
            settings,
            base_url,
            http_client,
            timeout,
            counters: SendCounters::default(),
        })
    }

    async fn execute(&self, request: VendorRequest) -> Result<VendorResponse, reqwest::Error> {
        let url = format!("{}{}", self.base_url, request.path);

        let builder = self.http_client.request(request.method, &url);
        let builder = self.protocol.authorize(builder, &self.settings);
        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Form(fields) => builder.form(&fields),
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        Ok(VendorResponse {
            status,
            headers,
            body,
        })
    }

    /// One bounded round trip with the outcome classified.
    async fn call(
        &self,
        request: VendorRequest,
        channel: Channel,
        failover_attempt: u32,
    ) -> Result<VendorResponse, VendorError> {
        let vendor = P::VENDOR;

        let response = match timeout(self.timeout, self.execute(request)).await {
            Err(_) => {
                return Err(VendorError::unavailable(
                    vendor,
                    channel,
                    failover_attempt,
                    format!("no response within {}ms", self.timeout.as_millis()),
                ));
            }
            Ok(Err(e)) => {
                return Err(VendorError::unavailable(
                    vendor,
                    channel,
                    failover_attempt,
                    format!("transport error: {}", e),
                ));
            }
            Ok(Ok(response)) => response,
        };

        match classify_status(response.status) {
            None => Ok(response),
            Some(kind) => Err(VendorError::new(
                kind,
                vendor,
                channel,
                failover_attempt,
                format!("{} returned {}: {}", vendor, response.status, response.body),
            )),
        }
    }

    fn build_send(
        &self,
        payload: &NotificationPayload,
        ctx: &AttemptContext<'_>,
    ) -> Result<VendorRequest, String> {
        if !P::VENDOR.supports(ctx.channel) {
            return Err(format!("{} does not deliver {}", P::VENDOR, ctx.channel));
        }

        let content = payload
            .content
            .as_ref()
            .ok_or_else(|| "payload has no rendered content".to_string())?;

        self.protocol
            .send_request(&self.settings, ctx.channel, &payload.recipient, content)
    }

    /// A request rejected before it went out says nothing about the vendor,
    /// so a half-open trial claimed for it is handed back as a success.
    async fn release_trial(&self, breaker: &CircuitBreaker) {
        if !breaker.holds_trial() {
            return;
        }

        if let Err(e) = breaker.record_success().await {
            warn!(
                vendor = %P::VENDOR,
                breaker = %breaker.key().component(),
                error = %e,
                "Failed to release half-open trial"
            );
        }
    }

    /// A vendor that rejected the request itself is still reachable, so only
    /// the other kinds count against its breaker.
    async fn record_outcome<T>(&self, breaker: &CircuitBreaker, outcome: &Result<T, VendorError>) {
        self.counters.record(outcome.is_ok());

        let recorded = match outcome {
            Err(e) if e.kind != VendorErrorKind::InvalidRequest => breaker.record_failure().await,
            _ => breaker.record_success().await,
        };

        if let Err(e) = recorded {
            warn!(
                vendor = %P::VENDOR,
                breaker = %breaker.key().component(),
                error = %e,
                "Failed to record vendor outcome on circuit breaker"
            );
        }
    }
}

#[async_trait]
impl<P: VendorProtocol> VendorAdapter for HttpVendorAdapter<P> {
    fn vendor(&self) -> Vendor {
        P::VENDOR
    }

    async fn send(
        &self,
        payload: &NotificationPayload,
        ctx: &AttemptContext<'_>,
    ) -> Result<SendReceipt, VendorError> {
        let vendor = P::VENDOR;
        let fail = |kind: VendorErrorKind, message: String| {
            VendorError::new(kind, vendor, ctx.channel, ctx.failover_attempt, message)
        };

        let request = match self.build_send(payload, ctx) {
            Ok(request) => request,
            Err(reason) => {
                self.release_trial(ctx.breaker).await;
                return Err(fail(VendorErrorKind::InvalidRequest, reason));
            }
        };

        let admitted = ctx.breaker.is_available().await.map_err(|e| {
            fail(
                VendorErrorKind::Unavailable,
                format!("circuit breaker state unreadable: {}", e),
            )
        })?;
        if !admitted {
            return Err(fail(
                VendorErrorKind::Unavailable,
                format!("circuit open for {}", ctx.breaker.key().component()),
            ));
        }

        debug!(
            vendor = %vendor,
            channel = %ctx.channel,
            tenant = ctx.tenant,
            failover_attempt = ctx.failover_attempt,
            "Sending through vendor"
        );

        let outcome = match self.call(request, ctx.channel, ctx.failover_attempt).await {
            Ok(response) => match self.protocol.message_id(&response) {
                Some(message_id) => Ok((message_id, response)),
                None => Err(fail(
                    VendorErrorKind::Unavailable,
                    format!("{} accepted the request without a message id", vendor),
                )),
            },
            Err(e) => Err(e),
        };

        self.record_outcome(ctx.breaker, &outcome).await;
        let (message_id, response) = outcome?;

        info!(vendor = %vendor, channel = %ctx.channel, message_id = %message_id, "Vendor accepted message");

        Ok(SendReceipt {
            status: self
                .protocol
                .native_status(&response)
                .unwrap_or_else(|| "accepted".to_string()),
            message_id,
            vendor_response: response.body,
            sent_at: Utc::now(),
        })
    }

    async fn get_status(
        &self,
        channel: Channel,
        message_id: &str,
    ) -> Result<VendorStatus, VendorError> {
        let Some(request) = self
            .protocol
            .status_request(&self.settings, channel, message_id)
        else {
            return Ok(VendorStatus {
                state: DeliveryState::Unknown,
                native_state: None,
                timestamps: HashMap::new(),
                vendor_metadata: json!({ "reason": "vendor reports delivery through events only" }),
            });
        };

        let response = self.call(request, channel, 0).await?;
        let native_state = self.protocol.native_status(&response);

        Ok(VendorStatus {
            state: native_state
                .as_deref()
                .map_or(DeliveryState::Unknown, |s| self.protocol.normalize(s)),
            native_state,
            timestamps: self.protocol.status_timestamps(&response),
            vendor_metadata: response.body,
        })
    }

    async fn check_health(&self) -> HealthReport {
        let started = Instant::now();
        let channel = Channel::ALL
            .into_iter()
            .find(|c| P::VENDOR.supports(*c))
            .unwrap_or(Channel::Email);

        let result = self
            .call(self.protocol.health_request(&self.settings), channel, 0)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => HealthReport {
                is_healthy: true,
                latency_ms,
                diagnostics: json!({
                    "http_status": response.status.as_u16(),
                    "success_rate": self.counters.success_rate(),
                }),
                last_error: None,
            },
            Err(e) => {
                debug!(vendor = %P::VENDOR, error = %e, "Vendor health probe failed");
                HealthReport::unhealthy(latency_ms, e.to_string())
            }
        }
    }

    fn success_rate(&self) -> f64 {
        self.counters.success_rate()
    }
}
