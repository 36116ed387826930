// Counter/gauge registry exposed on the worker admin endpoint.
// Text exposition follows the Prometheus format.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Monotonically increasing value.
#[derive(Debug, Clone)]
pub struct Counter {
    name: String,
    help: String,
    value: Arc<RwLock<f64>>,
}

impl Counter {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn inc_by(&self, value: f64) {
        if value >= 0.0 {
            *self.value.write() += value;
        }
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

/// Value that can move both ways.
#[derive(Debug, Clone)]
pub struct Gauge {
    name: String,
    help: String,
    value: Arc<RwLock<f64>>,
}

impl Gauge {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.write() = value;
    }

    pub fn add(&self, delta: f64) {
        *self.value.write() += delta;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

#[derive(Clone)]
enum Metric {
    Counter(Counter),
    Gauge(Gauge),
}

/// Process-wide metric registry.
#[derive(Default)]
pub struct MetricsRegistry {
    metrics: RwLock<HashMap<String, Metric>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, help: &str) -> Counter {
        let mut metrics = self.metrics.write();
        match metrics.get(name) {
            Some(Metric::Counter(c)) => c.clone(),
            _ => {
                let counter = Counter::new(name, help);
                metrics.insert(name.to_string(), Metric::Counter(counter.clone()));
                counter
            }
        }
    }

    pub fn gauge(&self, name: &str, help: &str) -> Gauge {
        let mut metrics = self.metrics.write();
        match metrics.get(name) {
            Some(Metric::Gauge(g)) => g.clone(),
            _ => {
                let gauge = Gauge::new(name, help);
                metrics.insert(name.to_string(), Metric::Gauge(gauge.clone()));
                gauge
            }
        }
    }

    /// Prometheus text exposition, names sorted for stable output.
    pub fn render(&self) -> String {
        let metrics = self.metrics.read();
        let mut names: Vec<&String> = metrics.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            match &metrics[name] {
                Metric::Counter(c) => {
                    out.push_str(&format!("# HELP {} {}\n", c.name, c.help));
                    out.push_str(&format!("# TYPE {} counter\n", c.name));
                    out.push_str(&format!("{} {}\n", c.name, c.get()));
                }
                Metric::Gauge(g) => {
                    out.push_str(&format!("# HELP {} {}\n", g.name, g.help));
                    out.push_str(&format!("# TYPE {} gauge\n", g.name));
                    out.push_str(&format!("{} {}\n", g.name, g.get()));
                }
            }
        }
        out
    }
}
