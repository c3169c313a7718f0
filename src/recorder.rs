use crate::{collector::Collector, counter::Counter, error::CollectorError, labels::LabelSet};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
struct Handle {
    counter: Counter,
    labels: LabelSet,
}

impl metrics::CounterFn for Handle {
    fn increment(&self, value: u64) {
        #[allow(clippy::cast_precision_loss)]
        let amount = value as f64;
        if let Err(e) = self.counter.inc_by(amount, &self.labels) {
            log::warn!("Failed to increment {:?}: {e}", self.counter.name());
        }
    }

    fn absolute(&self, _value: u64) {
        log::warn!(
            "Ignoring absolute value for {:?}: shared counters only support increments",
            self.counter.name()
        );
    }
}

/// A [`metrics::Recorder`] that feeds counters into a shared [`Collector`].
///
/// Only counters are shared across processes. Gauges and histograms are accepted but
/// discarded, with a warning when they are first described or registered.
///
/// Counter handles are cached per key, so the leader sees one registration per series rather
/// than one per `counter!` call.
#[derive(Debug, Clone)]
pub struct CollectorRecorder {
    collector: Collector,
    counters: Arc<Mutex<HashMap<metrics::Key, Arc<Handle>>>>,
}

impl CollectorRecorder {
    #[must_use]
    pub fn new(collector: Collector) -> Self {
        Self {
            collector,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets a recorder for `collector` as the global recorder.
    ///
    /// # Example
    /// ```no_run
    /// use multiproc_metrics::{Collector, CollectorConfig, CollectorRecorder};
    ///
    /// let collector = Collector::new(CollectorConfig::from_env());
    /// collector.start().unwrap();
    /// if let Err(e) = CollectorRecorder::install(collector.clone()) {
    ///     eprintln!("Failed to set up recorder: {}", e);
    /// }
    /// metrics::counter!("requests_total", "method" => "GET").increment(1);
    /// ```
    ///
    /// # Errors
    /// Returns an error if a global recorder is already installed.
    pub fn install(collector: Collector) -> Result<(), CollectorError> {
        metrics::set_global_recorder(Self::new(collector)).map_err(Into::into)
    }

    fn counter(&self, name: &str, description: Option<&str>) -> Option<Counter> {
        match self.collector.counter(name, description) {
            Ok(counter) => Some(counter),
            Err(e) => {
                log::warn!("Failed to register counter {name:?}: {e}");
                None
            }
        }
    }
}

impl metrics::Recorder for CollectorRecorder {
    fn describe_counter(
        &self,
        key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        description: metrics::SharedString,
    ) {
        let description = description.to_string();
        let _ = self.counter(key_name.as_str(), Some(description.as_str()));
    }

    fn describe_gauge(
        &self,
        key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
        log::warn!("Gauges are not shared; ignoring {:?}", key_name.as_str());
    }

    fn describe_histogram(
        &self,
        key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
        log::warn!("Histograms are not shared; ignoring {:?}", key_name.as_str());
    }

    fn register_counter(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Counter {
        let mut counters = self.counters.lock();
        if let Some(handle) = counters.get(key) {
            return metrics::Counter::from_arc(Arc::clone(handle));
        }

        let Some(counter) = self.counter(key.name(), None) else {
            return metrics::Counter::noop();
        };
        let labels: LabelSet = key
            .labels()
            .map(|label| (label.key(), label.value()))
            .collect();
        let handle = Arc::new(Handle { counter, labels });
        counters.insert(key.clone(), Arc::clone(&handle));
        metrics::Counter::from_arc(handle)
    }

    fn register_gauge(&self, key: &metrics::Key, _meta: &metrics::Metadata<'_>) -> metrics::Gauge {
        log::warn!("Gauges are not shared; ignoring {:?}", key.name());
        metrics::Gauge::noop()
    }

    fn register_histogram(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Histogram {
        log::warn!("Histograms are not shared; ignoring {:?}", key.name());
        metrics::Histogram::noop()
    }
}
