//! Store inspection: run listings with summary counts.

use crate::core::error::PortunusError;
use crate::core::event::Run;
use crate::core::store::{EventStore, RunCounts, RunFilter};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    #[serde(flatten)]
    pub run: Run,
    pub event_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReport {
    pub runs: Vec<RunRow>,
    pub counts: RunCounts,
}

/// Summarize runs matching the filter, newest first.
pub fn inspect(store: &EventStore, filter: &RunFilter) -> Result<InspectReport, PortunusError> {
    let (runs, counts) = store.list_runs(filter)?;
    let mut rows = Vec::with_capacity(runs.len());
    for run in runs {
        let event_count = store.event_count(&run.run_id)?;
        rows.push(RunRow { run, event_count });
    }
    Ok(InspectReport { runs: rows, counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventType, RunMode};

    #[test]
    fn inspect_reports_event_counts() {
        let mut store = EventStore::open(":memory:").unwrap();
        store.create_run("r1", "g", RunMode::DryRun, "1Z").unwrap();
        store
            .append("r1", EventType::RunStarted, serde_json::json!({}))
            .unwrap();
        store
            .append("r1", EventType::RunCompleted, serde_json::json!({}))
            .unwrap();
        store.create_run("r2", "g", RunMode::DryRun, "2Z").unwrap();

        let report = inspect(&store, &RunFilter::default()).unwrap();
        assert_eq!(report.counts.total, 2);
        assert_eq!(report.runs[0].run.run_id, "r2");
        assert_eq!(report.runs[1].event_count, 2);
    }
}
