use crate::{
    collector::Collector,
    error::CollectorError,
    events::{MetricEvent, MetricKind},
    labels::{LabelSet, escape_description, valid_metric_name},
};

/// A monotonic counter bound to a [`Collector`].
///
/// Cloning is cheap; every clone feeds the same series on the leader.
#[derive(Debug, Clone)]
pub struct Counter {
    collector: Collector,
    name: String,
}

impl Counter {
    pub(crate) fn register(
        collector: Collector,
        name: String,
        description: Option<&str>,
    ) -> Result<Self, CollectorError> {
        if !valid_metric_name(&name) {
            return Err(CollectorError::InvalidName(name));
        }
        collector.send(&MetricEvent::Register {
            kind: MetricKind::Counter.as_str().to_string(),
            name: name.clone(),
            description: description
                .map(escape_description)
                .filter(|d| !d.is_empty()),
        })?;
        Ok(Self { collector, name })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds one to the unlabelled series.
    ///
    /// # Errors
    /// See [`Counter::inc_by`].
    pub fn inc(&self) -> Result<(), CollectorError> {
        self.inc_by(1.0, &LabelSet::new())
    }

    /// Adds `amount` to the series identified by `labels`.
    ///
    /// # Errors
    /// Returns [`CollectorError::InvalidAmount`] for negative or NaN amounts and
    /// [`CollectorError::InvalidLabel`] for malformed label names; nothing is sent in
    /// either case. Otherwise fails only if the collector is unavailable or, on a follower,
    /// with [`CollectorError::Disconnected`] once the leader connection is lost.
    pub fn inc_by(&self, amount: f64, labels: &LabelSet) -> Result<(), CollectorError> {
        if amount.is_nan() || amount < 0.0 {
            return Err(CollectorError::InvalidAmount(amount));
        }
        labels.validate()?;
        self.collector.send(&MetricEvent::Increment {
            name: self.name.clone(),
            amount: amount.to_string(),
            labels: labels.to_string(),
        })
    }
}
