use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the generation event log.
///
/// - default fields are `type`, `generation_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    generation_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, generation_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                generation_id: generation_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Writer on the same log file, stamped with another generation id.
    pub fn for_generation(&self, generation_id: impl Into<String>) -> Self {
        Self::new(self.inner.path.clone(), generation_id)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = EventPayload::with_capacity(payload.len() + 3);
        event.insert("type".to_string(), event_type.into());
        event.insert(
            "generation_id".to_string(),
            self.inner.generation_id.as_str().into(),
        );
        event.insert("ts".to_string(), now_utc_iso().into());
        event.extend(payload);
        let line = serde_json::to_string(&event)?;

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if let Some(parent) = self.inner.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        writeln!(file, "{line}")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "gen-123");

        let mut payload = EventPayload::new();
        payload.insert("character_id".to_string(), Value::String("c1".to_string()));
        let emitted = writer.emit("generation_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("generation_started".to_string()));
        assert_eq!(parsed["generation_id"], Value::String("gen-123".to_string()));
        assert_eq!(parsed["character_id"], Value::String("c1".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "gen-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::String("override".to_string()));
        payload.insert(
            "generation_id".to_string(),
            Value::String("override-gen".to_string()),
        );
        let emitted = writer.emit("generation_started", payload)?;

        assert_eq!(emitted["type"], Value::String("override".to_string()));
        assert_eq!(
            emitted["generation_id"],
            Value::String("override-gen".to_string())
        );
        Ok(())
    }

    #[test]
    fn writers_for_other_generations_share_the_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let first = EventWriter::new(&path, "gen-1");
        let second = first.for_generation("gen-2");

        first.emit("one", EventPayload::new())?;
        second.emit("two", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let rows: Vec<Value> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["generation_id"], Value::String("gen-1".to_string()));
        assert_eq!(rows[1]["generation_id"], Value::String("gen-2".to_string()));
        assert_eq!(second.path(), path.as_path());
        Ok(())
    }
}
