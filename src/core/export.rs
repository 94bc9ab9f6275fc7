//! Portable run bundles: export, digest verification, and safe import.
//!
//! A bundle is self-contained: `{schema_version, run, events, provenance?}`.
//! Exports carry no timestamps, so exporting the same run twice yields
//! byte-identical bundles. Import is a single transaction; any failure
//! (structure, digest, conflict, replay) leaves the store unchanged.

use crate::core::canonical::{self, Provenance};
use crate::core::error::{ErrorCode, PortunusError};
use crate::core::event::{Event, Run};
use crate::core::replay;
use crate::core::store::{self, EventStore};
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const BUNDLE_SCHEMA_VERSION: &str = "0.3";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub schema_version: String,
    pub run: Run,
    pub events: Vec<Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// Conflict resolution when the bundle's run id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ImportMode {
    #[default]
    RejectOnConflict,
    NewRunId,
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub mode: ImportMode,
    pub verify_digest: bool,
    pub verify_replay: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            mode: ImportMode::RejectOnConflict,
            verify_digest: true,
            verify_replay: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub run_id: String,
    pub events_inserted: usize,
    pub replay_ok: Option<bool>,
}

/// Export a run as a deterministic, portable bundle.
pub fn export_run(
    store: &EventStore,
    run_id: &str,
    include_provenance: bool,
) -> Result<Bundle, PortunusError> {
    let run = store.get_run(run_id)?.ok_or_else(|| {
        PortunusError::operational_with(
            ErrorCode::RunNotFound,
            format!("Run '{run_id}' not found"),
            serde_json::json!({ "run_id": run_id }),
        )
    })?;
    let events = store.events(run_id)?;
    let provenance = if include_provenance {
        Some(canonical::provenance_for(&run, &events)?)
    } else {
        None
    };
    Ok(Bundle {
        schema_version: BUNDLE_SCHEMA_VERSION.to_string(),
        run,
        events,
        provenance,
    })
}

/// Serialize a bundle canonically (the on-disk and on-wire form).
pub fn bundle_to_canonical_json(bundle: &Bundle) -> Result<String, PortunusError> {
    let value = serde_json::to_value(bundle)
        .map_err(|e| PortunusError::Config(format!("Unable to serialize bundle: {e}")))?;
    Ok(canonical::canonical_string(&value))
}

fn validate_structure(bundle: &Bundle) -> Result<(), PortunusError> {
    if bundle.schema_version != BUNDLE_SCHEMA_VERSION {
        return Err(PortunusError::operational_with(
            ErrorCode::InvalidBundle,
            format!(
                "Unsupported bundle schema_version '{}', expected '{}'",
                bundle.schema_version, BUNDLE_SCHEMA_VERSION
            ),
            serde_json::json!({ "schema_version": bundle.schema_version }),
        ));
    }
    if bundle.run.run_id.is_empty() {
        return Err(PortunusError::operational(
            ErrorCode::InvalidBundle,
            "Bundle run has an empty run_id",
        ));
    }
    for (i, event) in bundle.events.iter().enumerate() {
        if event.run_id != bundle.run.run_id {
            return Err(PortunusError::operational_with(
                ErrorCode::InvalidBundle,
                format!("events[{i}] belongs to a different run"),
                serde_json::json!({ "event_run_id": event.run_id, "run_id": bundle.run.run_id }),
            ));
        }
    }
    Ok(())
}

fn verify_digest(bundle: &Bundle) -> Result<(), PortunusError> {
    let Some(provenance) = &bundle.provenance else {
        return Err(PortunusError::operational(
            ErrorCode::InvalidBundle,
            "Bundle has no provenance digest to verify",
        ));
    };
    let actual = canonical::run_digest(&bundle.run, &bundle.events)?;
    if actual != provenance.digest {
        return Err(PortunusError::operational_with(
            ErrorCode::DigestMismatch,
            "Bundle digest mismatch",
            serde_json::json!({ "expected": provenance.digest, "actual": actual }),
        ));
    }
    Ok(())
}

/// Recursively remap `run_id` references inside an event payload.
fn remap_run_id(value: &mut JsonValue, old_run_id: &str, new_run_id: &str) {
    match value {
        JsonValue::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "run_id" && val.as_str() == Some(old_run_id) {
                    *val = JsonValue::String(new_run_id.to_string());
                } else {
                    remap_run_id(val, old_run_id, new_run_id);
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                remap_run_id(item, old_run_id, new_run_id);
            }
        }
        _ => {}
    }
}

/// Import a bundle into the store. Single transaction; the store is
/// unchanged on any failure.
pub fn import_bundle(
    store: &mut EventStore,
    bundle: &Bundle,
    options: &ImportOptions,
) -> Result<ImportOutcome, PortunusError> {
    validate_structure(bundle)?;
    if options.verify_digest {
        verify_digest(bundle)?;
    }

    let original_run_id = bundle.run.run_id.clone();
    let mut run = bundle.run.clone();
    let mut events = bundle.events.clone();

    let conn = store.conn_mut();
    let tx = conn.transaction()?;

    let exists: bool = tx
        .query_row(
            "SELECT COUNT(*) FROM runs WHERE run_id = ?1",
            rusqlite::params![original_run_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)?;

    match options.mode {
        ImportMode::RejectOnConflict => {
            if exists {
                return Err(PortunusError::operational_with(
                    ErrorCode::RunExists,
                    format!("Run '{original_run_id}' already exists"),
                    serde_json::json!({ "run_id": original_run_id }),
                ));
            }
        }
        ImportMode::Overwrite => {
            if exists {
                tx.execute(
                    "DELETE FROM events WHERE run_id = ?1",
                    rusqlite::params![original_run_id],
                )?;
                tx.execute(
                    "DELETE FROM runs WHERE run_id = ?1",
                    rusqlite::params![original_run_id],
                )?;
            }
        }
        ImportMode::NewRunId => {
            // Fresh run id and fresh event ids; seq and ts are preserved.
            let new_run_id = time::new_run_id();
            run.run_id = new_run_id.clone();
            for event in &mut events {
                event.event_id = time::new_event_id();
                event.run_id = new_run_id.clone();
                remap_run_id(&mut event.payload, &original_run_id, &new_run_id);
            }
        }
    }

    tx.execute(
        "INSERT INTO runs(run_id, goal, mode, status, created_at) VALUES(?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            run.run_id,
            run.goal,
            run.mode.as_str(),
            run.status.as_str(),
            run.created_at
        ],
    )?;
    for event in &events {
        store::insert_event_row(&tx, event)?;
    }

    let replay_ok = if options.verify_replay {
        let (_, violations) = replay::check_events(&events);
        if !violations.is_empty() {
            return Err(PortunusError::operational_with(
                ErrorCode::InvalidBundle,
                "Imported run fails invariant checks",
                serde_json::json!({ "violations": violations }),
            ));
        }
        Some(true)
    } else {
        None
    };

    tx.commit()?;
    Ok(ImportOutcome {
        run_id: run.run_id,
        events_inserted: events.len(),
        replay_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventType, RunMode};

    fn seeded_store() -> (EventStore, String) {
        let mut store = EventStore::open(":memory:").unwrap();
        let run = store.create_run("r1", "demo", RunMode::DryRun, "0Z").unwrap();
        store
            .append(&run.run_id, EventType::RunStarted, serde_json::json!({"goal": "demo"}))
            .unwrap();
        store
            .append(
                &run.run_id,
                EventType::PlanCreated,
                serde_json::json!({"steps": []}),
            )
            .unwrap();
        store
            .append(
                &run.run_id,
                EventType::RunCompleted,
                serde_json::json!({"summary": {"run_id": "r1"}}),
            )
            .unwrap();
        store
            .set_status(&run.run_id, crate::core::event::RunStatus::Completed)
            .unwrap();
        (store, run.run_id)
    }

    #[test]
    fn export_is_idempotent() {
        let (store, run_id) = seeded_store();
        let a = export_run(&store, &run_id, true).unwrap();
        let b = export_run(&store, &run_id, true).unwrap();
        assert_eq!(
            bundle_to_canonical_json(&a).unwrap(),
            bundle_to_canonical_json(&b).unwrap()
        );
    }

    #[test]
    fn export_missing_run_fails() {
        let store = EventStore::open(":memory:").unwrap();
        let err = export_run(&store, "nope", true).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RunNotFound));
    }

    #[test]
    fn tampered_bundle_fails_digest_verification() {
        let (store, run_id) = seeded_store();
        let mut bundle = export_run(&store, &run_id, true).unwrap();
        bundle.run.goal = "tampered".to_string();

        let mut target = EventStore::open(":memory:").unwrap();
        let err = import_bundle(&mut target, &bundle, &ImportOptions::default()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DigestMismatch));
        assert!(target.get_run(&run_id).unwrap().is_none());
    }

    #[test]
    fn remap_rewrites_nested_run_id_references() {
        let mut payload = serde_json::json!({
            "summary": {"run_id": "old", "steps_total": 1},
            "other": "old",
            "list": [{"run_id": "old"}]
        });
        remap_run_id(&mut payload, "old", "new");
        assert_eq!(payload["summary"]["run_id"], "new");
        assert_eq!(payload["list"][0]["run_id"], "new");
        // Only run_id keys are remapped, not arbitrary matching strings.
        assert_eq!(payload["other"], "old");
    }

    #[test]
    fn import_without_provenance_requires_digest_opt_out() {
        let (store, run_id) = seeded_store();
        let bundle = export_run(&store, &run_id, false).unwrap();

        let mut target = EventStore::open(":memory:").unwrap();
        let err = import_bundle(&mut target, &bundle, &ImportOptions::default()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidBundle));

        let outcome = import_bundle(
            &mut target,
            &bundle,
            &ImportOptions {
                verify_digest: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(outcome.run_id, run_id);
    }

    #[test]
    fn wrong_schema_version_is_invalid() {
        let (store, run_id) = seeded_store();
        let mut bundle = export_run(&store, &run_id, true).unwrap();
        bundle.schema_version = "0.2".to_string();
        let mut target = EventStore::open(":memory:").unwrap();
        let err = import_bundle(&mut target, &bundle, &ImportOptions::default()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidBundle));
    }
}
