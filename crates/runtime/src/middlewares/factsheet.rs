//! FactSheet middleware — working-memory extraction, periodic LLM
//! summarization, system-message injection, and persistence on stop.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::message::{Message, Role, ToolCall};
use fm_domain::Result;
use fm_providers::{ChatRequest, LlmClient};
use fm_tools::ToolOutcome;

use crate::bus::EventBus;
use crate::factsheet::{FactCategory, FactEntry, FactSheet};
use crate::iteration::StopCode;
use crate::pipeline::{IterationCtx, LlmCall, LlmPatch, Middleware};

pub struct FactSheetMiddleware {
    sheet: Arc<Mutex<FactSheet>>,
    session_dir: PathBuf,
    summarization_interval: u32,
    secondary_llm: Option<Arc<dyn LlmClient>>,
    bus: Arc<EventBus>,
}

impl FactSheetMiddleware {
    pub fn new(
        session_dir: PathBuf,
        max_entries: usize,
        max_tokens: usize,
        summarization_interval: u32,
        secondary_llm: Option<Arc<dyn LlmClient>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            sheet: Arc::new(Mutex::new(FactSheet::new(max_entries, max_tokens))),
            session_dir,
            summarization_interval,
            secondary_llm,
            bus,
        }
    }

    pub fn sheet(&self) -> Arc<Mutex<FactSheet>> {
        self.sheet.clone()
    }

    /// Heuristic extraction from one tool execution.
    fn extract(&self, ctx: &IterationCtx, call: &ToolCall, outcome: &ToolOutcome) {
        let iteration = ctx.iteration;
        let source = call.tool_name.clone();
        let mut sheet = self.sheet.lock();

        if !outcome.success {
            if let Some(err) = &outcome.error {
                sheet.add(FactEntry::new(
                    FactCategory::Blocker,
                    format!("{} failed: {}", call.tool_name, err.message),
                    0.9,
                    source,
                    iteration,
                ));
            }
            return;
        }

        match call.tool_name.as_str() {
            "fs:read" => {
                if let Some(path) = call.arguments.get("path").and_then(Value::as_str) {
                    let bytes = outcome
                        .output
                        .as_ref()
                        .and_then(Value::as_str)
                        .map(str::len)
                        .unwrap_or(0);
                    sheet.add(FactEntry::new(
                        FactCategory::FileContent,
                        format!("read {path} ({bytes} bytes)"),
                        0.95,
                        source,
                        iteration,
                    ));
                }
            }
            "fs:write" | "fs:edit" => {
                if let Some(path) = call.arguments.get("path").and_then(Value::as_str) {
                    sheet.add(FactEntry::new(
                        FactCategory::ToolResult,
                        format!("{} {path}", if call.tool_name == "fs:write" { "wrote" } else { "edited" }),
                        0.95,
                        source,
                        iteration,
                    ));
                }
            }
            "shell:exec" => {
                if let Some(command) = call.arguments.get("command").and_then(Value::as_str) {
                    let exit = outcome
                        .output
                        .as_ref()
                        .and_then(|o| o.get("exit_code"))
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    sheet.add(FactEntry::new(
                        FactCategory::Environment,
                        format!("`{command}` exited {exit}"),
                        0.9,
                        source,
                        iteration,
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Parse the summarizer's response: one fact per line, optionally
/// prefixed `category:`.
fn parse_summary_facts(text: &str, iteration: u32) -> Vec<FactEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches('-').trim();
            if line.is_empty() {
                return None;
            }
            let (category, fact) = match line.split_once(':') {
                Some((prefix, rest)) => {
                    let category = match prefix.trim().to_ascii_lowercase().as_str() {
                        "finding" => Some(FactCategory::Finding),
                        "decision" => Some(FactCategory::Decision),
                        "blocker" => Some(FactCategory::Blocker),
                        "architecture" => Some(FactCategory::Architecture),
                        _ => None,
                    };
                    match category {
                        Some(c) => (c, rest.trim().to_owned()),
                        None => (FactCategory::Finding, line.to_owned()),
                    }
                }
                None => (FactCategory::Finding, line.to_owned()),
            };
            Some(FactEntry::new(category, fact, 0.7, "summarizer", iteration))
        })
        .collect()
}

#[async_trait::async_trait]
impl Middleware for FactSheetMiddleware {
    fn name(&self) -> &str {
        "factsheet"
    }

    fn order(&self) -> i32 {
        20
    }

    async fn before_llm_call(
        &self,
        _ctx: &mut IterationCtx,
        call: &LlmCall,
    ) -> Result<Option<LlmPatch>> {
        let rendered = self.sheet.lock().render();
        if rendered.is_empty() {
            return Ok(None);
        }
        let mut messages = call.messages.clone();
        match messages.iter_mut().find(|m| m.role == Role::System) {
            Some(system) => {
                let text = system.content.extract_all_text();
                *system = Message::system(format!("{text}\n\n{rendered}"));
            }
            None => messages.insert(0, Message::system(rendered)),
        }
        Ok(Some(LlmPatch { messages: Some(messages), ..Default::default() }))
    }

    async fn after_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        self.extract(ctx, call, outcome);
        Ok(())
    }

    async fn after_iteration(&self, ctx: &mut IterationCtx) -> Result<()> {
        if self.summarization_interval == 0
            || ctx.iteration == 0
            || ctx.iteration % self.summarization_interval != 0
        {
            return Ok(());
        }
        let Some(llm) = self.secondary_llm.clone() else {
            return Ok(());
        };

        // Background summarization: extract typed facts from the recent
        // exchanges without blocking the next iteration.
        let recent: Vec<String> = ctx
            .messages
            .iter()
            .rev()
            .take(12)
            .map(|m| m.content.extract_all_text())
            .filter(|t| !t.is_empty())
            .collect();
        let sheet = self.sheet.clone();
        let iteration = ctx.iteration;
        tokio::spawn(async move {
            let prompt = format!(
                "Extract durable facts from this agent transcript excerpt. One per line, prefixed with finding:, decision:, blocker:, or architecture:.\n\n{}",
                recent.join("\n---\n")
            );
            let request = ChatRequest {
                messages: vec![Message::system("You distill working notes."), Message::user(prompt)],
                ..Default::default()
            };
            match llm.chat(request).await {
                Ok(response) => {
                    let mut sheet = sheet.lock();
                    for entry in parse_summary_facts(&response.content, iteration) {
                        sheet.add(entry);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "factsheet summarization failed"),
            }
        });
        Ok(())
    }

    async fn on_stop(&self, ctx: &mut IterationCtx, _code: StopCode) -> Result<()> {
        let sheet = self.sheet.lock();
        if sheet.is_empty() {
            return Ok(());
        }
        sheet.persist(&self.session_dir.join(&ctx.session_id))?;
        let _ = self.bus.emit(
            &ctx.run_id,
            AgentEvent::new(EventKind::MemoryWrite { entries: sheet.entries.len() })
                .with_session(&ctx.session_id)
                .with_agent(&ctx.agent_id),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use serde_json::json;

    fn middleware(dir: &std::path::Path) -> Arc<FactSheetMiddleware> {
        Arc::new(FactSheetMiddleware::new(
            dir.to_path_buf(),
            16,
            2000,
            0,
            None,
            Arc::new(EventBus::new()),
        ))
    }

    #[tokio::test]
    async fn extracts_and_injects_facts() {
        let dir = tempfile::tempdir().unwrap();
        let mw = middleware(dir.path());
        let pipeline = Pipeline::new(vec![mw.clone()]);
        let mut ctx = IterationCtx::new("r", "s", "a", "t");
        ctx.iteration = 1;

        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "fs:read".into(),
            arguments: json!({"path": "src/main.rs"}),
        };
        pipeline
            .after_tool_exec(&mut ctx, &call, &ToolOutcome::ok(json!("fn main() {}")))
            .await
            .unwrap();

        let mut llm_call = LlmCall {
            messages: vec![Message::system("base"), Message::user("go")],
            ..Default::default()
        };
        pipeline.before_llm_call(&mut ctx, &mut llm_call).await.unwrap();
        let system_text = llm_call.messages[0].content.extract_all_text();
        assert!(system_text.contains("base"));
        assert!(system_text.contains("Working Memory"));
        assert!(system_text.contains("src/main.rs"));
    }

    #[tokio::test]
    async fn failures_become_blockers() {
        let dir = tempfile::tempdir().unwrap();
        let mw = middleware(dir.path());
        let pipeline = Pipeline::new(vec![mw.clone()]);
        let mut ctx = IterationCtx::new("r", "s", "a", "t");

        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "shell:exec".into(),
            arguments: json!({"command": "make"}),
        };
        pipeline
            .after_tool_exec(&mut ctx, &call, &ToolOutcome::fail("nonzero_exit", "exit 2"))
            .await
            .unwrap();

        let rendered = mw.sheet().lock().render();
        assert!(rendered.contains("[blocker]"));
    }

    #[tokio::test]
    async fn persists_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mw = middleware(dir.path());
        let pipeline = Pipeline::new(vec![mw.clone()]);
        let mut ctx = IterationCtx::new("r", "sess-9", "a", "t");
        ctx.iteration = 1;

        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "fs:write".into(),
            arguments: json!({"path": "out.txt", "content": "x"}),
        };
        pipeline
            .after_tool_exec(&mut ctx, &call, &ToolOutcome::ok(json!({"path": "out.txt"})))
            .await
            .unwrap();
        pipeline.on_stop(&mut ctx, StopCode::ReportComplete).await;

        let loaded = FactSheet::load(&dir.path().join("sess-9")).unwrap();
        assert_eq!(loaded.entries.len(), 1);
    }

    #[test]
    fn summary_parsing_reads_typed_lines() {
        let parsed = parse_summary_facts(
            "- finding: tests cover the parser\ndecision: keep sqlite\nnot typed at all\n",
            3,
        );
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].category, FactCategory::Finding);
        assert_eq!(parsed[1].category, FactCategory::Decision);
        assert_eq!(parsed[2].category, FactCategory::Finding);
    }
}
