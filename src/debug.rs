use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Line-delimited JSON log of batch events (`batch.start`, `row.rendered`,
/// `row.skipped`, ...). Cloning shares the same sink.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<EventState>>,
}

struct EventState {
    writer: Box<dyn Write + Send>,
    counters: BTreeMap<String, u64>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl EventLog {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::to_writer(BufWriter::new(file)))
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventState {
                writer: Box::new(writer),
                counters: BTreeMap::new(),
            })),
        }
    }

    /// Writes `{"type": kind, ..fields}`. Non-object `fields` go under `data`.
    pub(crate) fn event(&self, kind: &str, fields: Value) {
        let mut line = Map::new();
        line.insert("type".to_string(), Value::String(kind.to_string()));
        match fields {
            Value::Object(map) => line.extend(map),
            Value::Null => {}
            other => {
                line.insert("data".to_string(), other);
            }
        }
        if let Ok(mut state) = self.inner.lock() {
            let _ = writeln!(state.writer, "{}", Value::Object(line));
        }
    }

    pub(crate) fn increment(&self, key: &str, amount: u64) {
        if let Ok(mut state) = self.inner.lock() {
            let entry = state.counters.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }

    /// Writes accumulated counters as one `batch.summary` line and resets them.
    pub(crate) fn emit_summary(&self, context: &str) {
        if let Ok(mut state) = self.inner.lock() {
            let counters = std::mem::take(&mut state.counters);
            let line = json!({
                "type": "batch.summary",
                "context": context,
                "counts": counters,
            });
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}
