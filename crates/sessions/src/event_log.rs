//! Append-only NDJSON event logs, one file per session.
//!
//! Every agent event of a session's runs is appended as a single JSON
//! line tagged with its run id, giving REST clients a durable replay
//! source and the turn assembler its run grouping.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fm_domain::event::AgentEvent;
use fm_domain::{Error, Result};

/// One logged line: the event plus the run it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub run_id: String,
    pub event: AgentEvent,
}

pub struct EventLog {
    base_dir: PathBuf,
}

impl EventLog {
    pub fn new(state_path: &Path) -> Result<Self> {
        let base_dir = state_path.join("events");
        std::fs::create_dir_all(&base_dir).map_err(Error::Io)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.ndjsonl"))
    }

    /// Append one event to a session's log.
    pub fn append(&self, session_id: &str, run_id: &str, event: &AgentEvent) -> Result<()> {
        let line = LoggedEvent {
            run_id: run_id.to_owned(),
            event: event.clone(),
        };
        let json = serde_json::to_string(&line)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_id))
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)?;
        Ok(())
    }

    /// Read back a session's events in append order. Malformed lines
    /// are skipped.
    pub fn read(&self, session_id: &str) -> Result<Vec<LoggedEvent>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LoggedEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping malformed event line");
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_domain::event::EventKind;

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();

        let mut event = AgentEvent::new(EventKind::AgentStart { task: "t".into() }).with_session("s1");
        event.seq = 1;
        log.append("s1", "r1", &event).unwrap();

        let mut second = AgentEvent::new(EventKind::AgentEnd {
            outcome: "success".into(),
            duration_ms: 10,
        });
        second.seq = 2;
        log.append("s1", "r2", &second).unwrap();

        let events = log.read("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].run_id, "r1");
        assert_eq!(events[0].event.seq, 1);
        assert_eq!(events[1].run_id, "r2");
        assert_eq!(events[1].event.kind.type_name(), "agent:end");
    }

    #[test]
    fn missing_session_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();
        assert!(log.read("ghost").unwrap().is_empty());
    }
}
