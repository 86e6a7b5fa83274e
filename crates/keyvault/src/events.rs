//! Recovery lifecycle events for the notification collaborator.
//!
//! Events are written to the outbox table inside the state-change
//! transaction and handed to an [`EventSink`] afterwards. A sink failure
//! leaves the event undelivered for the next dispatch.

use chrono::{DateTime, Utc};
use common::protocol::{RecoveryEvent, RecoveryEventKind};
use rusqlite::Connection;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, Database, StoreError};
use crate::recovery::RecoveryRequest;

/// Events fetched per dispatch pass.
const DISPATCH_BATCH: usize = 100;

#[derive(Debug, Error)]
#[error("event sink rejected {event_id}: {message}")]
pub struct SinkError {
    pub event_id: Uuid,
    pub message: String,
}

/// Receiver of lifecycle events (the transactional email collaborator).
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &RecoveryEvent) -> Result<(), SinkError>;
}

/// Emits each event as a structured log line on target `events`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn deliver(&self, event: &RecoveryEvent) -> Result<(), SinkError> {
        info!(
            target: "events",
            event_id = %event.event_id,
            kind = event.kind.as_str(),
            request_id = %event.request_id,
            survey_id = %event.survey_id,
            requested_by = %event.requested_by,
            reviewed_by = event.reviewed_by.as_deref().unwrap_or(""),
            "recovery lifecycle event"
        );
        Ok(())
    }
}

/// Build the lifecycle event for `request` after a transition.
pub fn event_for(request: &RecoveryRequest, kind: RecoveryEventKind, now: DateTime<Utc>) -> RecoveryEvent {
    let cols = request.state.to_columns();
    RecoveryEvent {
        event_id: Uuid::new_v4(),
        kind,
        request_id: request.id,
        survey_id: request.survey_id.clone(),
        requested_by: request.requested_by.clone(),
        reviewed_by: cols.reviewed_by,
        reason: cols.rejection_reason,
        occurred_at: now,
    }
}

/// Queue `event` inside the caller's transaction.
pub fn enqueue(conn: &Connection, event: &RecoveryEvent) -> Result<(), StoreError> {
    db::outbox::insert(conn, event)
}

/// Deliver undelivered events in order. Returns the number delivered.
///
/// Stops at the first sink failure so ordering is preserved.
pub fn dispatch_pending(db: &Database, sink: &dyn EventSink) -> Result<usize, StoreError> {
    let pending = db.read(|c| db::outbox::undelivered(c, DISPATCH_BATCH))?;
    let mut delivered = 0;
    for event in &pending {
        if let Err(err) = sink.deliver(event) {
            warn!(event_id = %event.event_id, error = %err, "event delivery failed; will retry");
            break;
        }
        db.write(|tx| db::outbox::mark_delivered(tx, event.event_id, Utc::now()))?;
        delivered += 1;
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KdfParams, KekDerivation};

    fn queued(db: &Database, n: usize) -> Vec<RecoveryEvent> {
        (0..n)
            .map(|i| {
                let req = RecoveryRequest::new(
                    &format!("s{i}"),
                    "owner",
                    Utc::now(),
                    KekDerivation::fresh(KdfParams::default()),
                );
                let ev = event_for(&req, RecoveryEventKind::Completed, Utc::now());
                db.write(|tx| enqueue(tx, &ev)).unwrap();
                ev
            })
            .collect()
    }

    #[test]
    fn delivers_each_event_once() {
        let db = Database::open_in_memory().unwrap();
        queued(&db, 2);
        let mut sink = MockEventSink::new();
        sink.expect_deliver().times(2).returning(|_| Ok(()));
        assert_eq!(dispatch_pending(&db, &sink).unwrap(), 2);
        assert_eq!(dispatch_pending(&db, &sink).unwrap(), 0);
    }

    #[test]
    fn failed_delivery_is_retried() {
        let db = Database::open_in_memory().unwrap();
        let events = queued(&db, 1);

        let mut failing = MockEventSink::new();
        failing.expect_deliver().times(1).returning(|ev| {
            Err(SinkError {
                event_id: ev.event_id,
                message: "smtp down".into(),
            })
        });
        assert_eq!(dispatch_pending(&db, &failing).unwrap(), 0);

        let expected = events[0].event_id;
        let mut ok = MockEventSink::new();
        ok.expect_deliver()
            .withf(move |ev| ev.event_id == expected)
            .times(1)
            .returning(|_| Ok(()));
        assert_eq!(dispatch_pending(&db, &ok).unwrap(), 1);
    }

    #[test]
    fn payload_carries_no_key_material() {
        let db = Database::open_in_memory().unwrap();
        let ev = &queued(&db, 1)[0];
        let json = serde_json::to_string(ev).unwrap();
        assert!(!json.contains("salt"));
        assert!(!json.contains("kek"));
    }
}
