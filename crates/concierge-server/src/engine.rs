use std::sync::Arc;
use std::time::Duration;

use concierge_contracts::{ConversationRecord, IncomingEvent, TenantContext};
use concierge_kernel::{build_system_prompt, CooldownGate, DispatchTable, GateDecision, HandlerKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::conversation_log::ConversationLogger;
use crate::dispatch::ReplyDispatcher;
use crate::generation::{generate_with_deadline, GenerationProvider};
use crate::knowledge::{KnowledgeRetriever, TenantResolver};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cooldown_ms: u64,
    pub generation_timeout: Duration,
    pub apology_text: String,
    pub fallback_text: String,
}

impl From<&concierge_config::Engine> for EngineSettings {
    fn from(cfg: &concierge_config::Engine) -> Self {
        Self {
            cooldown_ms: cfg.cooldown_ms,
            generation_timeout: Duration::from_millis(cfg.generation_timeout_ms),
            apology_text: cfg.apology_text.clone(),
            fallback_text: cfg.fallback_text.clone(),
        }
    }
}

/// Collaborators the pipeline talks to.
pub struct EngineParts {
    pub resolver: Arc<dyn TenantResolver>,
    pub retriever: Arc<dyn KnowledgeRetriever>,
    pub provider: Arc<dyn GenerationProvider>,
    pub dispatcher: Arc<dyn ReplyDispatcher>,
    pub logger: Arc<ConversationLogger>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    TenantResolution,
    Retrieval,
}

impl FailureStage {
    pub fn name(&self) -> &'static str {
        match self {
            FailureStage::TenantResolution => "tenant_resolution",
            FailureStage::Retrieval => "retrieval",
        }
    }
}

/// How one event ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Throttled; nothing was sent.
    Dropped { retry_after_ms: i64 },
    /// A reply was delivered and its conversation record queued.
    Replied {
        tenant_id: String,
        text: String,
        generation_fallback: bool,
        logged: bool,
    },
    /// A fatal stage failed and the apology was delivered.
    Apologized { stage: FailureStage },
    /// The reply could not be delivered; nothing was logged.
    DispatchFailed { text: String },
}

/// Per-event pipeline: throttle, resolve, route, retrieve, prompt, generate under a
/// deadline, dispatch, log.
pub struct Engine {
    gate: CooldownGate,
    routes: DispatchTable,
    parts: EngineParts,
    settings: EngineSettings,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(settings: EngineSettings, parts: EngineParts) -> Self {
        Self {
            gate: CooldownGate::new(settings.cooldown_ms),
            routes: DispatchTable::default(),
            parts,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_routes(mut self, routes: DispatchTable) -> Self {
        self.routes = routes;
        self
    }

    /// Cancelling this token aborts every in-flight generation.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn retrieval_strategy(&self) -> &'static str {
        self.parts.retriever.strategy()
    }

    pub async fn handle_event(&self, event: IncomingEvent) -> PipelineOutcome {
        let span = info_span!("event", sender_id = %event.sender_id);
        self.process(event).instrument(span).await
    }

    async fn process(&self, event: IncomingEvent) -> PipelineOutcome {
        if let GateDecision::Reject { retry_after_ms } =
            self.gate.check(&event.sender_id, event.received_at)
        {
            debug!(retry_after_ms, sent_at = ?event.sent_at, "message throttled");
            return PipelineOutcome::Dropped { retry_after_ms };
        }

        let tenant = match self.parts.resolver.resolve_tenant(&event.sender_id).await {
            Ok(tenant) => tenant,
            Err(err) => {
                warn!(stage = "tenant_resolution", error = %err, "tenant resolution failed");
                return self
                    .apologize(&event.sender_id, FailureStage::TenantResolution)
                    .await;
            }
        };

        let route = self.routes.route(&tenant.module);
        if route.is_fallback() {
            debug!(
                module = %tenant.module,
                handler = route.handler.name(),
                reason = ?route.reason,
                "module has no dedicated handler"
            );
        }
        match route.handler {
            HandlerKind::Generic => self.answer_with_knowledge(&event, &tenant).await,
        }
    }

    async fn answer_with_knowledge(
        &self,
        event: &IncomingEvent,
        tenant: &TenantContext,
    ) -> PipelineOutcome {
        let tenant_id = tenant.tenant_id();
        let snapshot = match self.parts.retriever.retrieve(tenant, &event.text).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    stage = "retrieval",
                    tenant_id,
                    strategy = self.parts.retriever.strategy(),
                    error = %err,
                    "knowledge retrieval failed"
                );
                return self
                    .apologize(&event.sender_id, FailureStage::Retrieval)
                    .await;
            }
        };
        let system_prompt = build_system_prompt(&snapshot);

        let provider = self.parts.provider.as_ref();
        let (reply, generation_fallback) = match generate_with_deadline(
            provider,
            &self.shutdown,
            self.settings.generation_timeout,
            &system_prompt,
            &event.text,
        )
        .await
        {
            Ok(text) if !text.trim().is_empty() => (text, false),
            Ok(_) => {
                warn!(
                    stage = "generation",
                    tenant_id,
                    provider = provider.provider_name(),
                    "empty reply, using fallback"
                );
                (self.settings.fallback_text.clone(), true)
            }
            Err(err) => {
                warn!(
                    stage = "generation",
                    tenant_id,
                    provider = provider.provider_name(),
                    error = %err,
                    "generation failed, using fallback"
                );
                (self.settings.fallback_text.clone(), true)
            }
        };

        if let Err(err) = self.parts.dispatcher.send_reply(&event.sender_id, &reply).await {
            error!(stage = "dispatch", tenant_id, error = %err, "reply dispatch failed");
            return PipelineOutcome::DispatchFailed { text: reply };
        }

        let logged = self
            .parts
            .logger
            .submit(ConversationRecord::new(
                tenant_id,
                &event.sender_id,
                &event.text,
                &reply,
            ));
        info!(tenant_id, generation_fallback, "reply sent");
        PipelineOutcome::Replied {
            tenant_id: tenant_id.to_string(),
            text: reply,
            generation_fallback,
            logged,
        }
    }

    async fn apologize(&self, sender_id: &str, stage: FailureStage) -> PipelineOutcome {
        let text = self.settings.apology_text.clone();
        if let Err(err) = self.parts.dispatcher.send_reply(sender_id, &text).await {
            error!(stage = stage.name(), error = %err, "apology dispatch failed");
            return PipelineOutcome::DispatchFailed { text };
        }
        PipelineOutcome::Apologized { stage }
    }
}
