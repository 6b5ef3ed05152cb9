//! Tenant-tagged counters.
//!
//! The engine records a handful of counters through [`MetricsRegistry`].
//! [`RecorderMetrics`] forwards them to whatever recorder is installed for
//! the `metrics` facade, tagging each with a `tenant` label. With no
//! recorder installed the increments are dropped.

/// Couples successfully handed to the work dispatcher.
pub const NUMBER_OF_MESSAGES_EXECUTED: &str = "bpmn.message.executed";

/// Raw candidate couples fetched per cycle, before dedup.
pub const NUMBER_OF_MESSAGES_POTENTIAL_MATCHED: &str = "bpmn.message.potential_matched";

/// Cycles that hit the page limit.
pub const NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS: &str =
    "bpmn.message.matching_retriggered";

/// Label carrying the tenant id on every counter.
pub const TENANT_LABEL: &str = "tenant";

/// Counter registry keyed by metric name and tenant.
pub trait MetricsRegistry: Send + Sync + 'static {
    /// Add `by` to the counter `name` for `tenant_id`.
    fn increment(&self, name: &str, tenant_id: i64, by: u64);
}

/// Registry backed by the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsRegistry for RecorderMetrics {
    fn increment(&self, name: &str, tenant_id: i64, by: u64) {
        if by == 0 {
            return;
        }
        metrics::counter!(name.to_string(), TENANT_LABEL => tenant_id.to_string()).increment(by);
    }
}

/// Registry that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRegistry for NoopMetrics {
    fn increment(&self, _name: &str, _tenant_id: i64, _by: u64) {}
}

#[cfg(test)]
pub(crate) use test_support::InMemoryMetrics;


#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    fn counters(recorder: &DebuggingRecorder) -> Vec<(String, Vec<(String, String)>, u64)> {
        let mut out: Vec<_> = recorder
            .snapshotter()
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(v) => {
                    let key = key.key();
                    let labels = key
                        .labels()
                        .map(|l| (l.key().to_string(), l.value().to_string()))
                        .collect();
                    Some((key.name().to_string(), labels, v))
                }
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_recorder_counters_are_tenant_labelled() {
        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            let registry = RecorderMetrics;
            registry.increment(NUMBER_OF_MESSAGES_EXECUTED, 1, 3);
            registry.increment(NUMBER_OF_MESSAGES_EXECUTED, 2, 1);
            registry.increment(NUMBER_OF_MESSAGES_EXECUTED, 1, 2);
            registry.increment(NUMBER_OF_MESSAGES_POTENTIAL_MATCHED, 1, 0);
        });

        let tenant = |id: &str| vec![(TENANT_LABEL.to_string(), id.to_string())];
        assert_eq!(
            counters(&recorder),
            vec![
                (NUMBER_OF_MESSAGES_EXECUTED.to_string(), tenant("1"), 5),
                (NUMBER_OF_MESSAGES_EXECUTED.to_string(), tenant("2"), 1),
            ]
        );
    }

    #[test]
    fn test_service_counters_reach_recorder() {
        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            let registry: &dyn MetricsRegistry = &RecorderMetrics;
            registry.increment(NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS, 9, 1);
        });

        let snap = counters(&recorder);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS);
        assert_eq!(snap[0].2, 1);
    }

    #[test]
    fn test_noop_records_nothing() {
        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            NoopMetrics.increment(NUMBER_OF_MESSAGES_EXECUTED, 1, 10);
        });
        assert!(counters(&recorder).is_empty());
    }
}
