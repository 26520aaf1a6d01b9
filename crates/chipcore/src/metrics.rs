use crate::{units, MetricError, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// One recorded metric value with the files it was extracted from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: String,
    pub index: String,
    pub metric: String,
    /// Value in the canonical unit of the metric
    pub value: f64,
    /// Canonical unit, or the source unit for metrics without one
    pub unit: Option<String>,
    /// Unit the tool reported the value in
    pub source_unit: Option<String>,
    pub provenance: Vec<PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn node(&self) -> NodeId {
        NodeId::new(self.step.clone(), self.index.clone())
    }
}

/// Append-only store of metric records shared by every node of a run.
#[derive(Debug, Default)]
pub struct MetricRecorder {
    records: Mutex<Vec<MetricRecord>>,
}

impl MetricRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert `value` to canonical units and append a record.
    pub fn record(
        &self,
        step: &str,
        index: &str,
        metric: &str,
        value: f64,
        provenance: Vec<PathBuf>,
        unit: Option<&str>,
    ) -> Result<MetricRecord, MetricError> {
        let (canonical_value, canonical) = units::convert(metric, value, unit)?;
        let record = MetricRecord {
            step: step.to_string(),
            index: index.to_string(),
            metric: metric.to_string(),
            value: canonical_value,
            unit: canonical,
            source_unit: unit.map(String::from),
            provenance,
            recorded_at: Utc::now(),
        };
        tracing::debug!(
            "Recorded {} = {} {} for {}/{}",
            metric,
            record.value,
            record.unit.as_deref().unwrap_or(""),
            step,
            index
        );
        self.push(record.clone());
        Ok(record)
    }

    /// Re-insert records loaded from a previous run.
    pub fn restore(&self, records: Vec<MetricRecord>) {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        guard.extend(records);
    }

    fn push(&self, record: MetricRecord) {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        guard.push(record);
    }

    /// Latest value recorded for the key.
    pub fn get(&self, step: &str, index: &str, metric: &str) -> Result<f64, MetricError> {
        self.get_record(step, index, metric).map(|r| r.value)
    }

    pub fn get_record(
        &self,
        step: &str,
        index: &str,
        metric: &str,
    ) -> Result<MetricRecord, MetricError> {
        let guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .iter()
            .rev()
            .find(|r| r.step == step && r.index == index && r.metric == metric)
            .cloned()
            .ok_or_else(|| MetricError::NotFound {
                step: step.to_string(),
                index: index.to_string(),
                metric: metric.to_string(),
            })
    }

    /// Latest record of every metric for one node, in first-recorded order.
    pub fn node_records(&self, step: &str, index: &str) -> Vec<MetricRecord> {
        let guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut latest: Vec<MetricRecord> = Vec::new();
        for record in guard.iter().filter(|r| r.step == step && r.index == index) {
            match latest.iter_mut().find(|r| r.metric == record.metric) {
                Some(slot) => *slot = record.clone(),
                None => latest.push(record.clone()),
            }
        }
        latest
    }

    pub fn snapshot(&self) -> Vec<MetricRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_stored_in_canonical_units() {
        let recorder = MetricRecorder::new();
        recorder
            .record("sta", "0", "fmax", 100.0, vec!["sta.log".into()], Some("MHz"))
            .unwrap();

        let record = recorder.get_record("sta", "0", "fmax").unwrap();
        assert_eq!(record.value, 100e6);
        assert_eq!(record.unit.as_deref(), Some("Hz"));
        assert_eq!(record.source_unit.as_deref(), Some("MHz"));
        assert_eq!(record.provenance, vec![PathBuf::from("sta.log")]);
    }

    #[test]
    fn missing_metric_is_an_error() {
        let recorder = MetricRecorder::new();
        let err = recorder.get("syn", "0", "cells").unwrap_err();
        assert_eq!(
            err,
            MetricError::NotFound {
                step: "syn".into(),
                index: "0".into(),
                metric: "cells".into()
            }
        );
    }

    #[test]
    fn latest_record_wins_and_history_is_kept() {
        let recorder = MetricRecorder::new();
        recorder.record("syn", "0", "cells", 10.0, vec![], None).unwrap();
        recorder.record("syn", "0", "cells", 12.0, vec![], None).unwrap();
        recorder.record("syn", "1", "cells", 99.0, vec![], None).unwrap();

        assert_eq!(recorder.get("syn", "0", "cells").unwrap(), 12.0);
        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.node_records("syn", "0").len(), 1);
    }
}
