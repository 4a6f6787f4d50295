use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use dispatch_service::{
    clients::{
        circuit_breaker::BreakerRegistry,
        queue::InMemoryQueue,
        store::{MemoryStore, SharedStore},
        template::TemplateRenderer,
    },
    error::{DispatchError, DispatchResult, VendorError, VendorErrorKind},
    models::{
        circuit_breaker::BreakerConfig,
        notification::{Channel, MessageContent, NotificationPayload, SendOptions, SendRequest},
        template::RenderedContent,
        vendor::{DeliveryState, HealthReport, SendReceipt, Vendor, VendorStatus},
    },
    services::{
        gateway::{GatewayConfig, QueueGateway},
        monitor::{HealthMonitor, MonitorConfig},
        orchestrator::{NotificationService, OrchestratorConfig},
        selector::Selector,
    },
    vendors::{AttemptContext, VendorAdapter, registry::VendorRegistry},
};
use serde_json::json;

pub const QUEUE_NAME: &str = "notifications-test";

/// Scripted vendor. Consults and updates the breaker it is handed the same
/// way the HTTP adapters do.
pub struct StubAdapter {
    vendor: Vendor,
    script: Mutex<VecDeque<Result<(), VendorErrorKind>>>,
    fallback: Mutex<Result<(), VendorErrorKind>>,
    healthy: AtomicBool,
    sends: AtomicU32,
    latency: Mutex<Duration>,
}

impl StubAdapter {
    pub fn healthy(vendor: Vendor) -> Arc<Self> {
        Arc::new(Self {
            vendor,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(())),
            healthy: AtomicBool::new(true),
            sends: AtomicU32::new(0),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    pub fn failing(vendor: Vendor, kind: VendorErrorKind) -> Arc<Self> {
        let adapter = Self::healthy(vendor);
        *adapter.fallback.lock().unwrap() = Err(kind);
        adapter
    }

    /// Outcomes to use, in order, before falling back to the default.
    pub fn then(self: Arc<Self>, outcome: Result<(), VendorErrorKind>) -> Arc<Self> {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    /// Every send takes this long before the outcome is reported.
    pub fn slow(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        *self.latency.lock().unwrap() = latency;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<(), VendorErrorKind> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| *self.fallback.lock().unwrap())
    }
}

#[async_trait]
impl VendorAdapter for StubAdapter {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    async fn send(
        &self,
        _payload: &NotificationPayload,
        ctx: &AttemptContext<'_>,
    ) -> Result<SendReceipt, VendorError> {
        if !ctx.breaker.is_available().await.unwrap() {
            return Err(VendorError::unavailable(
                self.vendor,
                ctx.channel,
                ctx.failover_attempt,
                "circuit open",
            ));
        }

        let count = self.sends.fetch_add(1, Ordering::SeqCst) + 1;

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.next_outcome() {
            Ok(()) => {
                ctx.breaker.record_success().await.unwrap();
                Ok(SendReceipt {
                    message_id: format!("{}-msg-{}", self.vendor, count),
                    status: "accepted".to_string(),
                    vendor_response: json!({ "vendor": self.vendor.as_str() }),
                    sent_at: Utc::now(),
                })
            }
            Err(kind) => {
                if kind == VendorErrorKind::InvalidRequest {
                    ctx.breaker.record_success().await.unwrap();
                } else {
                    ctx.breaker.record_failure().await.unwrap();
                }
                Err(VendorError::new(
                    kind,
                    self.vendor,
                    ctx.channel,
                    ctx.failover_attempt,
                    "scripted failure",
                ))
            }
        }
    }

    async fn get_status(
        &self,
        _channel: Channel,
        _message_id: &str,
    ) -> Result<VendorStatus, VendorError> {
        Ok(VendorStatus {
            state: DeliveryState::Delivered,
            native_state: Some("delivered".to_string()),
            timestamps: HashMap::new(),
            vendor_metadata: json!({}),
        })
    }

    async fn check_health(&self) -> HealthReport {
        if self.healthy.load(Ordering::SeqCst) {
            HealthReport {
                is_healthy: true,
                latency_ms: 1,
                diagnostics: json!({}),
                last_error: None,
            }
        } else {
            HealthReport::unhealthy(1, "stub marked unhealthy")
        }
    }

    fn success_rate(&self) -> f64 {
        1.0
    }
}

/// Renders `Hello {{name}}` for template "welcome", rejects everything else.
pub struct StubRenderer;

#[async_trait]
impl TemplateRenderer for StubRenderer {
    async fn render(
        &self,
        template_id: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> DispatchResult<RenderedContent> {
        if template_id != "welcome" {
            return Err(DispatchError::TemplateNotFound {
                template_id: template_id.to_string(),
            });
        }

        let name = context
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("there");
        Ok(RenderedContent {
            subject: Some("Welcome".to_string()),
            body: format!("Hello {}", name),
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<InMemoryQueue>,
    pub breakers: BreakerRegistry,
    pub registry: Arc<VendorRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub gateway: Arc<QueueGateway>,
    pub selector: Arc<Selector>,
    pub service: Arc<NotificationService>,
}

pub struct HarnessBuilder {
    registry: VendorRegistry,
    breaker: BreakerConfig,
    gateway: GatewayConfig,
    orchestrator: OrchestratorConfig,
}

impl HarnessBuilder {
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn gateway(mut self, config: GatewayConfig) -> Self {
        self.gateway = config;
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn SharedStore> = store.clone();
        let queue = Arc::new(InMemoryQueue::new());

        let breakers = BreakerRegistry::new(Arc::clone(&shared), self.breaker);
        let registry = Arc::new(self.registry);
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&shared),
            Arc::clone(&registry),
            MonitorConfig::default(),
        ));
        let gateway = Arc::new(QueueGateway::new(
            queue.clone(),
            breakers.clone(),
            QUEUE_NAME,
            self.gateway,
        ));
        let selector = Arc::new(Selector::new(
            Arc::clone(&registry),
            breakers.clone(),
            Arc::clone(&monitor),
            Arc::clone(&shared),
            30,
        ));
        let service = Arc::new(NotificationService::new(
            shared,
            Arc::clone(&gateway),
            Arc::clone(&selector),
            Arc::new(StubRenderer),
            self.orchestrator,
        ));

        Harness {
            store,
            queue,
            breakers,
            registry,
            monitor,
            gateway,
            selector,
            service,
        }
    }
}

impl Harness {
    pub fn builder(registry: VendorRegistry) -> HarnessBuilder {
        HarnessBuilder {
            registry,
            breaker: BreakerConfig::default(),
            gateway: GatewayConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }

    pub fn new(registry: VendorRegistry) -> Self {
        Self::builder(registry).build()
    }

    /// Opens the default-tenant breaker for a vendor on a channel.
    pub async fn open_breaker(&self, vendor: Vendor, channel: Channel) {
        let breaker = self.breakers.for_vendor(vendor, channel, "default");
        for _ in 0..self.breakers.config().failure_threshold {
            breaker.record_failure().await.unwrap();
        }
    }
}

/// Registry holding the given stubs, keeping default priorities.
pub fn registry_with(adapters: &[Arc<StubAdapter>]) -> VendorRegistry {
    adapters
        .iter()
        .fold(VendorRegistry::new(), |registry, adapter| {
            registry.with_adapter(adapter.clone())
        })
}

pub fn email_request(immediate: bool) -> SendRequest {
    SendRequest {
        channel: "email".to_string(),
        payload: NotificationPayload {
            recipient: "user@example.com".to_string(),
            content: Some(MessageContent {
                subject: Some("Hi".to_string()),
                body: "Your order shipped".to_string(),
            }),
            template_id: None,
            context: HashMap::new(),
        },
        options: SendOptions {
            immediate,
            ..SendOptions::default()
        },
    }
}

pub fn short_cooldown(millis: u64) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 5,
        cooldown: Duration::from_millis(millis),
    }
}
