use std::sync::Arc;

use tokio::sync::mpsc;

use super::{AuditEventEnvelope, AuditHandle, AuditRecord, AuditStore};

/// Background task draining audit events into the store.
pub struct AuditWriter {
    rx: mpsc::Receiver<AuditEventEnvelope>,
    store: Arc<dyn AuditStore>,
}

impl AuditWriter {
    pub fn new(rx: mpsc::Receiver<AuditEventEnvelope>, store: Arc<dyn AuditStore>) -> Self {
        Self { rx, store }
    }

    /// Consume events until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!("Audit writer started");

        while let Some(envelope) = self.rx.recv().await {
            let record = AuditRecord {
                id: 0,
                timestamp: envelope.timestamp,
                event_type: envelope.event.event_type().to_string(),
                item_id: envelope.event.item_id().map(String::from),
                actor: envelope.event.actor().map(String::from),
                data: envelope.event,
            };

            if let Err(e) = self.store.insert(&record) {
                tracing::error!("Failed to write audit event: {}", e);
            }
        }

        tracing::info!("Audit writer shutting down");
    }
}

/// Create a handle/writer pair sharing a channel of `buffer_size` events.
///
/// Spawn the writer with `tokio::spawn(writer.run())`; it exits once the
/// last handle clone is dropped.
pub fn create_audit_system(
    store: Arc<dyn AuditStore>,
    buffer_size: usize,
) -> (AuditHandle, AuditWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = AuditHandle::new(tx);
    let writer = AuditWriter::new(rx, store);
    (handle, writer)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::audit::{AuditError, AuditEvent, AuditFilter};

    /// Store that records insert calls
    struct RecordingStore {
        records: Mutex<Vec<AuditRecord>>,
        should_fail: bool,
    }

    impl RecordingStore {
        fn new(should_fail: bool) -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(Vec::new()),
                should_fail,
            })
        }

        fn get_records(&self) -> Vec<AuditRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    impl AuditStore for RecordingStore {
        fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError> {
            if self.should_fail {
                return Err(AuditError::Database("Mock failure".to_string()));
            }
            let mut records = self.records.lock().unwrap();
            let id = records.len() as i64 + 1;
            let mut stored = record.clone();
            stored.id = id;
            records.push(stored);
            Ok(id)
        }

        fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(self.records.lock().unwrap().clone())
        }

        fn count(&self, _filter: &AuditFilter) -> Result<i64, AuditError> {
            Ok(self.records.lock().unwrap().len() as i64)
        }
    }

    fn stage_changed(item_id: &str) -> AuditEvent {
        AuditEvent::StageChanged {
            item_id: item_id.to_string(),
            from_stage: "new".to_string(),
            to_stage: "indexed".to_string(),
            transition: "advance".to_string(),
            retry_count: 0,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_writer_stores_events_with_item_and_actor() {
        let store = RecordingStore::new(false);
        let (handle, writer) = create_audit_system(store.clone(), 10);
        let writer_handle = tokio::spawn(writer.run());

        handle.emit(stage_changed("i-1")).await;
        handle
            .emit(AuditEvent::ItemReset {
                item_id: "i-2".to_string(),
                reset_by: "api".to_string(),
                previous_stage: "failed_index".to_string(),
            })
            .await;
        drop(handle);
        writer_handle.await.unwrap();

        let records = store.get_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].item_id.as_deref(), Some("i-1"));
        assert_eq!(records[0].actor, None);
        assert_eq!(records[1].actor.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn test_writer_continues_on_insert_failure() {
        let store = RecordingStore::new(true);
        let (handle, writer) = create_audit_system(store.clone(), 10);
        let writer_handle = tokio::spawn(writer.run());

        handle.emit(stage_changed("i-1")).await;
        drop(handle);

        writer_handle.await.unwrap();
        assert!(store.get_records().is_empty());
    }

    #[tokio::test]
    async fn test_writer_waits_for_all_handles_to_drop() {
        let store = RecordingStore::new(false);
        let (main_handle, writer) = create_audit_system(store.clone(), 10);
        let orchestrator_handle = main_handle.clone();
        let writer_handle = tokio::spawn(writer.run());

        orchestrator_handle.emit(stage_changed("i-1")).await;
        main_handle
            .emit(AuditEvent::ServiceStopped {
                reason: "graceful_shutdown".to_string(),
            })
            .await;
        drop(main_handle);

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!writer_handle.is_finished());

        drop(orchestrator_handle);
        let result =
            tokio::time::timeout(tokio::time::Duration::from_secs(1), writer_handle).await;
        assert!(result.is_ok());

        let records = store.get_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event_type, "service_stopped");
    }
}
