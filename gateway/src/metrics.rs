//! Process metrics in Prometheus text exposition format.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::errors::ErrorKind;

/// Bounded window of recent TTFA samples.
const TTFA_WINDOW: usize = 5000;

#[derive(Default)]
pub struct Metrics {
    sessions_total: AtomicU64,
    backpressure_total: AtomicU64,
    errors_total: Mutex<HashMap<&'static str, u64>>,
    ttfa_ms: Mutex<VecDeque<f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sessions(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_error(&self, kind: ErrorKind) {
        *self.errors_total.lock().entry(kind.as_str()).or_insert(0) += 1;
        if kind == ErrorKind::Backpressure {
            self.backpressure_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn observe_ttfa_ms(&self, ttfa_ms: f64) {
        let mut window = self.ttfa_ms.lock();
        if window.len() == TTFA_WINDOW {
            window.pop_front();
        }
        window.push_back(ttfa_ms);
    }

    /// Renders the exposition payload. `sessions_active` comes from the
    /// registry so the gauge can never drift from the source of truth.
    pub fn render_prometheus(&self, sessions_active: usize) -> String {
        let sessions_total = self.sessions_total.load(Ordering::Relaxed);
        let backpressure_total = self.backpressure_total.load(Ordering::Relaxed);
        let errors: Vec<(&'static str, u64)> = {
            let map = self.errors_total.lock();
            let mut entries: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
            entries.sort_unstable();
            entries
        };
        let ttfa: Vec<f64> = self.ttfa_ms.lock().iter().copied().collect();
        let (p50, p95, p99) = percentiles(&ttfa);
        let ttfa_sum: f64 = ttfa.iter().sum();

        let mut lines = Vec::with_capacity(24);
        lines.push("# HELP ws_tts_sessions_active Active sessions.".to_string());
        lines.push("# TYPE ws_tts_sessions_active gauge".to_string());
        lines.push(format!("ws_tts_sessions_active {sessions_active}"));

        lines.push("# HELP ws_tts_sessions_total Total sessions started.".to_string());
        lines.push("# TYPE ws_tts_sessions_total counter".to_string());
        lines.push(format!("ws_tts_sessions_total {sessions_total}"));

        lines.push("# HELP ws_tts_errors_total Total errors by kind.".to_string());
        lines.push("# TYPE ws_tts_errors_total counter".to_string());
        for (kind, count) in errors {
            lines.push(format!("ws_tts_errors_total{{kind=\"{kind}\"}} {count}"));
        }

        lines.push("# HELP ws_tts_backpressure_total Sessions terminated for slow reading.".to_string());
        lines.push("# TYPE ws_tts_backpressure_total counter".to_string());
        lines.push(format!("ws_tts_backpressure_total {backpressure_total}"));

        lines.push(
            "# HELP ws_tts_ttfa_ms Time-to-first-audio in milliseconds (recent window)."
                .to_string(),
        );
        lines.push("# TYPE ws_tts_ttfa_ms summary".to_string());
        lines.push(format!("ws_tts_ttfa_ms{{quantile=\"0.5\"}} {p50}"));
        lines.push(format!("ws_tts_ttfa_ms{{quantile=\"0.95\"}} {p95}"));
        lines.push(format!("ws_tts_ttfa_ms{{quantile=\"0.99\"}} {p99}"));
        lines.push(format!("ws_tts_ttfa_ms_sum {ttfa_sum}"));
        lines.push(format!("ws_tts_ttfa_ms_count {}", ttfa.len()));

        lines.join("\n") + "\n"
    }
}

/// Linear-interpolated p50/p95/p99 over the sample window.
fn percentiles(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pick = |p: f64| -> f64 {
        let idx = (sorted.len() - 1) as f64 * p;
        let lo = idx.floor() as usize;
        let hi = (lo + 1).min(sorted.len() - 1);
        let frac = idx - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    };
    (pick(0.50), pick(0.95), pick(0.99))
}
