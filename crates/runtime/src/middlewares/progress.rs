//! Progress middleware — loop detection and stuck signaling.
//!
//! Surfaces its verdicts through `ctx.meta["progress"]`; the default is
//! emit-and-continue, with the iteration loop treating `loop_detected`
//! as a stop signal.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::message::ToolCall;
use fm_domain::Result;
use fm_tools::ToolOutcome;

use crate::bus::EventBus;
use crate::detect::ProgressTracker;
use crate::pipeline::{IterationCtx, Middleware};

pub struct ProgressMiddleware {
    tracker: Mutex<ProgressTracker>,
    bus: Arc<EventBus>,
}

impl ProgressMiddleware {
    pub fn new(bus: Arc<EventBus>, stuck_threshold: u32) -> Self {
        Self {
            tracker: Mutex::new(ProgressTracker::new(stuck_threshold)),
            bus,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for ProgressMiddleware {
    fn name(&self) -> &str {
        "progress"
    }

    fn order(&self) -> i32 {
        50
    }

    async fn after_tool_exec(
        &self,
        _ctx: &mut IterationCtx,
        call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        let mut tracker = self.tracker.lock();
        tracker.record_call(&call.tool_name, &call.arguments);
        let produced_output = outcome.success
            && outcome
                .output
                .as_ref()
                .map(|o| match o {
                    Value::String(s) => !s.is_empty(),
                    Value::Null => false,
                    _ => true,
                })
                .unwrap_or(false);
        if produced_output {
            tracker.record_progress();
        }
        Ok(())
    }

    async fn after_iteration(&self, ctx: &mut IterationCtx) -> Result<()> {
        let (stuck, loop_detected, since_progress) = {
            let mut tracker = self.tracker.lock();
            tracker.record_iteration();
            (
                tracker.is_stuck(),
                tracker.loop_detected(),
                tracker.iterations_since_progress(),
            )
        };

        ctx.meta_set(
            "progress",
            json!({
                "stuck": stuck,
                "loop_detected": loop_detected,
                "iterations_since_progress": since_progress,
            }),
        );

        let _ = self.bus.emit(
            &ctx.run_id,
            AgentEvent::new(EventKind::ProgressUpdate {
                iterations_since_progress: since_progress,
                stuck,
                loop_detected,
            })
            .with_session(&ctx.session_id)
            .with_agent(&ctx.agent_id),
        );
        Ok(())
    }
}
