use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// JSONL timing log. When the last clone drops, a `<stem>_hot.log` ranking
/// the slowest spans is written next to it.
#[derive(Clone)]
pub struct PerfLog {
    inner: Arc<Mutex<PerfState>>,
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    span_totals: HashMap<String, f64>,
    span_counts: HashMap<String, u64>,
}

impl std::fmt::Debug for PerfLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfLog").finish_non_exhaustive()
    }
}

impl PerfLog {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                span_totals: HashMap::new(),
                span_counts: HashMap::new(),
            })),
        })
    }

    pub(crate) fn log_span_ms(&self, name: &str, row: Option<usize>, ms: f64) {
        let line = json!({
            "type": "perf.span",
            "name": name,
            "row": row,
            "unit": "ms",
            "ms": (ms * 1000.0).round() / 1000.0,
        });
        if let Ok(mut state) = self.inner.lock() {
            *state.span_totals.entry(name.to_string()).or_insert(0.0) += ms;
            let entry = state.span_counts.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

/// Runs `f`, logging its wall time as span `name` when a log is attached.
pub(crate) fn timed<T>(
    perf: Option<&PerfLog>,
    name: &str,
    row: Option<usize>,
    f: impl FnOnce() -> T,
) -> T {
    let Some(perf) = perf else {
        return f();
    };
    let started = Instant::now();
    let out = f();
    perf.log_span_ms(name, row, started.elapsed().as_secs_f64() * 1000.0);
    out
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let hot_path = hot_path_for(&self.path);
        let Ok(file) = File::create(&hot_path) else {
            return;
        };
        let mut writer = BufWriter::new(file);

        let mut spans: Vec<(&String, &f64)> = self.span_totals.iter().collect();
        spans.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (rank, (name, ms)) in spans.into_iter().take(100).enumerate() {
            let count = *self.span_counts.get(name).unwrap_or(&1);
            let avg = if count == 0 { 0.0 } else { ms / count as f64 };
            let line = json!({
                "type": "perf.hot.span",
                "rank": rank + 1,
                "name": name,
                "unit": "ms",
                "agg": "sum",
                "ms": ms,
                "count": count,
                "avg_ms": avg,
            });
            let _ = writeln!(writer, "{line}");
        }
    }
}

fn hot_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("certstamp_perf.log");
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_hot.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_log_sits_next_to_perf_log() {
        assert_eq!(
            hot_path_for(Path::new("/tmp/run/perf.jsonl")),
            PathBuf::from("/tmp/run/perf_hot.log")
        );
        assert_eq!(
            hot_path_for(Path::new("timings")),
            PathBuf::from("timings_hot.log")
        );
    }

    #[test]
    fn spans_and_hot_ranking_are_written() {
        let dir = std::env::temp_dir().join(format!("certstamp-perf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("perf.log");
        {
            let perf = PerfLog::new(&path).unwrap();
            let value = timed(Some(&perf), "row.render", Some(0), || 41 + 1);
            assert_eq!(value, 42);
            perf.log_span_ms("batch.package", None, 5.0);
        }
        let spans = std::fs::read_to_string(&path).unwrap();
        assert_eq!(spans.lines().count(), 2);
        assert!(spans.contains("\"name\":\"row.render\""));

        let hot = std::fs::read_to_string(dir.join("perf_hot.log")).unwrap();
        let first: serde_json::Value = serde_json::from_str(hot.lines().next().unwrap()).unwrap();
        assert_eq!(first["name"], "batch.package");
        assert_eq!(first["rank"], 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
