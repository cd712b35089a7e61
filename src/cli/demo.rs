//! Payment request/response demo wired through a real router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::brokers::create_adapter;
use crate::config::Settings;
use crate::core::{DispatchStats, Router};
use crate::protocol::{
    Agent, Message, MessageCatalog, MessageContext, MessageSet, MessageType, DIRECTION_REQUEST,
    DIRECTION_RESPONSE,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentRequestMessage {
    pub amount: f64,
    pub user_id: String,
    pub payment_method: String,
}

impl MessageType for PaymentRequestMessage {
    const NAME: &'static str = "PaymentRequestMessage";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentResponseMessage {
    pub transaction_id: String,
    pub status: String,
    pub amount: f64,
    pub user_id: String,
}

impl MessageType for PaymentResponseMessage {
    const NAME: &'static str = "PaymentResponseMessage";
}

const APPROVAL_LIMIT: f64 = 10_000.0;

/// Approves or declines payment requests and answers on the same session.
pub struct PaymentAgent {
    router: Arc<Router>,
}

impl PaymentAgent {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Agent for PaymentAgent {
    fn name(&self) -> &str {
        "payment_agent"
    }

    fn inbound(&self) -> MessageSet {
        MessageSet::new().with::<PaymentRequestMessage>()
    }

    fn outbound(&self) -> MessageSet {
        MessageSet::new().with::<PaymentResponseMessage>()
    }

    async fn handle_message(&self, message: &Message, context: &MessageContext) -> anyhow::Result<()> {
        let request = message
            .downcast_ref::<PaymentRequestMessage>()
            .with_context(|| format!("payment_agent cannot handle {}", message.type_name()))?;

        let status = if request.amount > 0.0 && request.amount <= APPROVAL_LIMIT {
            "approved"
        } else {
            "declined"
        };
        tracing::info!(user_id = %request.user_id, amount = request.amount, status, "Processed payment");

        let response = Message::new(PaymentResponseMessage {
            transaction_id: format!("txn_{}", Ulid::new().to_string().to_lowercase()),
            status: status.to_string(),
            amount: request.amount,
            user_id: request.user_id.clone(),
        })?;
        self.router
            .send(self, &response, DIRECTION_RESPONSE, &context.session_id)
            .await?;
        Ok(())
    }
}

/// Sends requests and collects responses.
pub struct ClientAgent {
    responses: mpsc::UnboundedSender<(PaymentResponseMessage, MessageContext)>,
}

#[async_trait]
impl Agent for ClientAgent {
    fn name(&self) -> &str {
        "client_agent"
    }

    fn inbound(&self) -> MessageSet {
        MessageSet::new().with::<PaymentResponseMessage>()
    }

    fn outbound(&self) -> MessageSet {
        MessageSet::new().with::<PaymentRequestMessage>()
    }

    async fn handle_message(&self, message: &Message, context: &MessageContext) -> anyhow::Result<()> {
        let response = message
            .downcast_ref::<PaymentResponseMessage>()
            .with_context(|| format!("client_agent cannot handle {}", message.type_name()))?;
        self.responses
            .send((response.clone(), context.clone()))
            .map_err(|_| anyhow::anyhow!("demo receiver is gone"))?;
        Ok(())
    }
}

/// Outcome of one demo run.
#[derive(Debug)]
pub struct DemoReport {
    pub adapter: String,
    pub request_channel: String,
    pub response: PaymentResponseMessage,
    pub response_context: MessageContext,
    pub stats: DispatchStats,
}

/// Build the demo catalog.
pub fn catalog() -> Result<Arc<MessageCatalog>> {
    let catalog = Arc::new(MessageCatalog::new());
    catalog.register::<PaymentRequestMessage>()?;
    catalog.register::<PaymentResponseMessage>()?;
    Ok(catalog)
}

/// Run one payment round trip over the configured broker.
pub async fn run(settings: &Settings, request: PaymentRequestMessage) -> Result<DemoReport> {
    let adapter = create_adapter(&settings.broker);
    let router = Arc::new(Router::with_severity(
        adapter,
        catalog()?,
        settings.dispatch.no_agent_severity,
    ));
    router.connect().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let payment: Arc<dyn Agent> = Arc::new(PaymentAgent::new(Arc::clone(&router)));
    let client = Arc::new(ClientAgent { responses: tx });
    let client_dyn: Arc<dyn Agent> = client.clone();
    router.register(&payment).await?;
    router.register(&client_dyn).await?;

    let session = format!("session_{}", Ulid::new().to_string().to_lowercase());
    let message = Message::new(request)?;
    let request_channel = message.channel_of(DIRECTION_REQUEST, &session)?.encode();
    router
        .send(client.as_ref(), &message, DIRECTION_REQUEST, &session)
        .await?;

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
    let stats = router.stats();
    let adapter = router.adapter_name().to_string();
    router.close().await?;

    let (response, response_context) = received
        .context("timed out waiting for the payment response")?
        .context("client agent stopped before a response arrived")?;

    Ok(DemoReport {
        adapter,
        request_channel,
        response,
        response_context,
        stats,
    })
}
