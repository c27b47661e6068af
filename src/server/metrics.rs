//! Per-tool request metrics.
//!
//! One mutex-guarded table of counters: request and error totals plus
//! min/avg/max execution time per tool. Every `tools/call` dispatch is
//! recorded; `get_server_metrics` reads a snapshot back out. Counters
//! reset only with the process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default)]
struct ToolStats {
    requests: u64,
    errors: u64,
    total_time: Duration,
    min_time: Option<Duration>,
    max_time: Duration,
}

#[derive(Default)]
pub struct MetricsRecorder {
    table: Mutex<HashMap<String, ToolStats>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tool execution.
    pub fn record(&self, tool: &str, duration: Duration, success: bool) {
        let mut table = self.table.lock().expect("metrics table poisoned");
        let stats = table.entry(tool.to_string()).or_default();
        stats.requests += 1;
        if !success {
            stats.errors += 1;
        }
        stats.total_time += duration;
        stats.max_time = stats.max_time.max(duration);
        stats.min_time = Some(stats.min_time.map_or(duration, |m| m.min(duration)));
    }

    /// Overall totals plus a per-tool breakdown, times in seconds.
    pub fn snapshot(&self) -> Value {
        let table = self.table.lock().expect("metrics table poisoned");
        let mut total_requests = 0u64;
        let mut total_errors = 0u64;
        let mut tools = Map::new();
        for (name, stats) in table.iter() {
            total_requests += stats.requests;
            total_errors += stats.errors;
            let avg = stats.total_time.as_secs_f64() / stats.requests as f64;
            tools.insert(
                name.clone(),
                json!({
                    "request_count": stats.requests,
                    "error_count": stats.errors,
                    "error_rate": round2(stats.errors as f64 / stats.requests as f64 * 100.0),
                    "avg_time": round3(avg),
                    "min_time": round3(stats.min_time.unwrap_or_default().as_secs_f64()),
                    "max_time": round3(stats.max_time.as_secs_f64()),
                }),
            );
        }
        let error_rate = if total_requests == 0 {
            0.0
        } else {
            round2(total_errors as f64 / total_requests as f64 * 100.0)
        };
        json!({
            "total_requests": total_requests,
            "total_errors": total_errors,
            "error_rate": error_rate,
            "tools": Value::Object(tools),
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
