//! Observability middleware — lifecycle and timing events into the bus.

use std::sync::Arc;

use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::Result;

use crate::bus::EventBus;
use crate::pipeline::{IterationAction, IterationCtx, Middleware};

pub struct ObservabilityMiddleware {
    bus: Arc<EventBus>,
}

impl ObservabilityMiddleware {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    fn emit(&self, ctx: &IterationCtx, kind: EventKind) {
        let mut event = AgentEvent::new(kind)
            .with_session(&ctx.session_id)
            .with_agent(&ctx.agent_id);
        if let Some(parent) = &ctx.parent_agent_id {
            event = event.with_parent(parent.clone());
        }
        let _ = self.bus.emit(&ctx.run_id, event);
    }
}

#[async_trait::async_trait]
impl Middleware for ObservabilityMiddleware {
    fn name(&self) -> &str {
        "observability"
    }

    fn order(&self) -> i32 {
        0
    }

    async fn before_iteration(&self, ctx: &mut IterationCtx) -> Result<IterationAction> {
        self.emit(ctx, EventKind::IterationStart { iteration: ctx.iteration });
        Ok(IterationAction::Continue)
    }

    async fn after_iteration(&self, ctx: &mut IterationCtx) -> Result<()> {
        self.emit(ctx, EventKind::IterationEnd {
            iteration: ctx.iteration,
            total_tokens: ctx.total_tokens,
        });
        Ok(())
    }
}
