//! The query seam between the collector and a metrics backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use nodefleet_core::BoxFuture;

use crate::error::{MetricsError, MetricsResult};

/// Query-by-expression access to a time-series service.
///
/// `Ok(None)` means the expression evaluated to an empty result.
pub trait MetricsSource: Send + Sync {
    fn query<'a>(&'a self, expr: &'a str) -> BoxFuture<'a, MetricsResult<Option<f64>>>;
}

/// In-memory source returning configured values per expression.
///
/// Unknown expressions evaluate to empty. A source marked `offline`
/// fails every query as unavailable.
#[derive(Debug, Default)]
pub struct StaticSource {
    values: Mutex<HashMap<String, f64>>,
    failing: Mutex<HashMap<String, u32>>,
    offline: std::sync::atomic::AtomicBool,
    calls: AtomicU32,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value returned for `expr`.
    pub fn set(&self, expr: &str, value: f64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(expr.to_string(), value);
        }
    }

    /// Fail the next `times` queries of `expr` before answering normally.
    pub fn fail_next(&self, expr: &str, times: u32) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(expr.to_string(), times);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total queries received.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, expr: &str) -> MetricsResult<Option<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(MetricsError::unavailable(expr, "source offline"));
        }
        if let Ok(mut failing) = self.failing.lock() {
            if let Some(remaining) = failing.get_mut(expr).filter(|r| **r > 0) {
                *remaining -= 1;
                return Err(MetricsError::unavailable(expr, "scripted failure"));
            }
        }
        Ok(self
            .values
            .lock()
            .ok()
            .and_then(|values| values.get(expr).copied()))
    }
}

impl MetricsSource for StaticSource {
    fn query<'a>(&'a self, expr: &'a str) -> BoxFuture<'a, MetricsResult<Option<f64>>> {
        Box::pin(async move { self.answer(expr) })
    }
}
