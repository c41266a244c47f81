//! Built-in middlewares.
//!
//! All built-ins are fail-open: a failing middleware never breaks an
//! execution. Order determines hook sequencing (see the pipeline).

pub mod budget;
pub mod context_filter;
pub mod factsheet;
pub mod observability;
pub mod progress;
pub mod reflection;
pub mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use fm_domain::config::{IterationConfig, MiddlewareToggles};
use fm_providers::LlmClient;

use crate::bus::EventBus;
use crate::pipeline::Middleware;

pub use budget::BudgetMiddleware;
pub use context_filter::ContextFilterMiddleware;
pub use factsheet::FactSheetMiddleware;
pub use observability::ObservabilityMiddleware;
pub use progress::ProgressMiddleware;
pub use reflection::ReflectionMiddleware;
pub use signals::{
    AnalyticsMiddleware, SearchSignalMiddleware, TaskClassifierMiddleware, TodoSyncMiddleware,
};

/// The standard middleware stack a worker runs under.
///
/// `secondary_llm` powers FactSheet summarization and Reflection; when
/// absent those features degrade to their heuristic paths.
pub fn standard_stack(
    toggles: &MiddlewareToggles,
    iteration: &IterationConfig,
    bus: Arc<EventBus>,
    session_dir: PathBuf,
    secondary_llm: Option<Arc<dyn LlmClient>>,
) -> Vec<Arc<dyn Middleware>> {
    let mut stack: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(ObservabilityMiddleware::new(bus.clone())),
        Arc::new(BudgetMiddleware::new(
            iteration.soft_limit_ratio,
            iteration.hard_limit_ratio,
        )),
        Arc::new(ContextFilterMiddleware::new(toggles.max_output_length)),
        Arc::new(FactSheetMiddleware::new(
            session_dir,
            toggles.factsheet_max_entries,
            toggles.factsheet_max_tokens,
            toggles.summarization_interval,
            secondary_llm.clone(),
            bus.clone(),
        )),
        Arc::new(ProgressMiddleware::new(bus.clone(), iteration.stuck_threshold)),
    ];

    if toggles.reflection {
        stack.push(Arc::new(ReflectionMiddleware::new(
            secondary_llm,
            toggles.reflection_interval,
        )));
    }
    if toggles.task_classifier {
        stack.push(Arc::new(TaskClassifierMiddleware));
    }
    if toggles.search_signal {
        stack.push(Arc::new(SearchSignalMiddleware::default()));
    }
    if toggles.todo_sync {
        stack.push(Arc::new(TodoSyncMiddleware));
    }
    if toggles.analytics {
        stack.push(Arc::new(AnalyticsMiddleware));
    }

    stack
}
