use crate::events::{MetricEvent, MetricKind};
use std::{
    collections::BTreeMap,
    fmt::Write,
    time::{SystemTime, UNIX_EPOCH},
};

/// One registered metric and its per-label-set values.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub description: Option<String>,
    pub kind: MetricKind,
    /// Keyed by canonical label string; the empty string is the unlabelled series.
    pub values: BTreeMap<String, f64>,
}

impl Entry {
    fn new(kind: MetricKind, name: &str, description: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            description: description.map(ToString::to_string),
            kind,
            values: BTreeMap::new(),
        }
    }

    fn write_to(&self, out: &mut String, timestamp_ms: u128) {
        let _ = writeln!(out, "# TYPE {} {}", self.name, self.kind);
        if let Some(description) = &self.description {
            let _ = writeln!(out, "# HELP {} {description}", self.name);
        }
        for (labels, value) in &self.values {
            out.push_str(&self.name);
            if !labels.is_empty() {
                out.push('{');
                out.push_str(labels);
                out.push('}');
            }
            let _ = writeln!(out, " {} {timestamp_ms}", format_value(*value));
        }
    }
}

/// The authoritative metric store, owned by the leader process.
///
/// Every operation is lenient: bad input from a peer is logged and dropped, since
/// writes on the wire carry no response to report an error through.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: BTreeMap<String, Entry>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches a decoded event to [`Registry::register`] or [`Registry::increment`].
    pub fn apply(&mut self, event: &MetricEvent) {
        match event {
            MetricEvent::Register {
                kind,
                name,
                description,
            } => self.register(kind, name, description.as_deref()),
            MetricEvent::Increment {
                name,
                amount,
                labels,
            } => self.increment(name, amount, labels),
        }
    }

    pub fn register(&mut self, kind: &str, name: &str, description: Option<&str>) {
        let description = description.filter(|d| !d.is_empty());
        let kind = match kind.parse::<MetricKind>() {
            Ok(kind) => kind,
            Err(e) => {
                log::warn!("Tried to register {name:?}: {e}");
                return;
            }
        };

        match self.metrics.get_mut(name) {
            None => {
                log::trace!("Registered {kind} {name:?}");
                self.metrics
                    .insert(name.to_string(), Entry::new(kind, name, description));
            }
            Some(entry) if entry.kind != kind => {
                log::warn!(
                    "Ignoring registration of {name:?} as {kind}, already registered as {}",
                    entry.kind
                );
            }
            Some(entry) => {
                if entry.description.is_none() {
                    entry.description = description.map(ToString::to_string);
                }
            }
        }
    }

    pub fn increment(&mut self, name: &str, amount: &str, labels: &str) {
        let Some(entry) = self.metrics.get_mut(name) else {
            log::warn!("Tried to increment unregistered metric {name:?}");
            return;
        };
        if entry.kind != MetricKind::Counter {
            log::warn!("Tried to increment {name:?} of kind {}", entry.kind);
            return;
        }

        match amount.parse::<f64>() {
            Ok(amount) => *entry.values.entry(labels.to_string()).or_insert(0.0) += amount,
            Err(e) => log::warn!("Failed to increment metric {name:?} by {amount:?}: {e}"),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.metrics.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Renders the registry in the Prometheus text exposition format, stamped with the
    /// current wall-clock time.
    #[must_use]
    pub fn serialize(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        self.serialize_at(now)
    }

    /// Renders the registry with every sample stamped `timestamp_ms`.
    #[must_use]
    pub fn serialize_at(&self, timestamp_ms: u128) -> String {
        let mut out = String::new();
        for entry in self.metrics.values() {
            entry.write_to(&mut out, timestamp_ms);
        }
        out
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".into()
    } else if value.is_infinite() {
        String::from(if value > 0.0 { "+Inf" } else { "-Inf" })
    } else {
        value.to_string()
    }
}
