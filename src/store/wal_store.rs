use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::{ResourceStore, StoreError};

/// A resource row plus every reservation recorded against it.
#[derive(Debug, Clone)]
struct ResourceRow {
    resource: Resource,
    reservations: HashMap<Ulid, Reservation>,
}

type SharedRow = Arc<RwLock<ResourceRow>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Blocks for the first append, drains whatever else is
/// already queued, then pays a single fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Option<WalCommand> = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Flush what we have first; handle `other` next iteration.
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                for (_, tx) in batch {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }
            }
            WalCommand::Compact { snapshot, response } => {
                let _ = response.send(wal.compact(&snapshot));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

/// Apply an event to a row. Caller holds the row's write lock.
fn apply_to_row(row: &mut ResourceRow, event: &Event) {
    match event {
        Event::ResourceCreated { resource } => row.resource = resource.clone(),
        Event::AllocationChanged { delta, version, .. } => {
            row.resource.allocated = (row.resource.allocated as i64 + delta) as u32;
            row.resource.version = *version;
        }
        Event::ReservationWritten { reservation } => {
            row.reservations.insert(reservation.id, reservation.clone());
        }
        Event::ReservationStatusChanged { id, status, at } => {
            if let Some(r) = row.reservations.get_mut(id) {
                r.status = *status;
                r.resolved_at = Some(*at);
            }
        }
    }
}

/// Durable single-node [`ResourceStore`] over a group-committed WAL.
///
/// Rows live in memory behind per-resource async locks; every mutation is
/// appended to the WAL before it is applied.
pub struct WalStore {
    rows: DashMap<ResourceId, SharedRow>,
    /// Reverse lookup: reservation id → owning resource.
    reservation_to_resource: DashMap<Ulid, ResourceId>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so no
    /// append can land between taking the snapshot and swapping the file.
    compaction_gate: RwLock<()>,
    create_lock: Mutex<()>,
}

impl WalStore {
    /// Replay `path` and start the background writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(path)?;

        let mut rows: HashMap<ResourceId, ResourceRow> = HashMap::new();
        let reservation_to_resource = DashMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated { resource } => {
                    let row = rows.entry(resource.id.clone()).or_insert_with(|| ResourceRow {
                        resource: resource.clone(),
                        reservations: HashMap::new(),
                    });
                    apply_to_row(row, event);
                }
                Event::AllocationChanged { resource_id, .. } => {
                    if let Some(row) = rows.get_mut(resource_id) {
                        apply_to_row(row, event);
                    }
                }
                Event::ReservationWritten { reservation } => {
                    if let Some(row) = rows.get_mut(&reservation.resource_id) {
                        reservation_to_resource.insert(reservation.id, reservation.resource_id.clone());
                        apply_to_row(row, event);
                    }
                }
                Event::ReservationStatusChanged { id, .. } => {
                    if let Some(rid) = reservation_to_resource.get(id)
                        && let Some(row) = rows.get_mut(rid.value())
                    {
                        apply_to_row(row, event);
                    }
                }
            }
        }
        tracing::info!(
            path = %path.display(),
            resources = rows.len(),
            reservations = reservation_to_resource.len(),
            records = events.len(),
            "replayed WAL"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            rows: rows
                .into_iter()
                .map(|(id, row)| (id, Arc::new(RwLock::new(row))))
                .collect(),
            reservation_to_resource,
            wal_tx,
            compaction_gate: RwLock::new(()),
            create_lock: Mutex::new(()),
        })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL append failed: {e}")))
    }

    /// WAL-append then apply, under the caller's row guard.
    async fn persist_and_apply(&self, row: &mut ResourceRow, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_row(row, event);
        Ok(())
    }

    fn row(&self, id: &ResourceId) -> Result<SharedRow, StoreError> {
        self.rows
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn row_for_reservation(&self, id: &Ulid) -> Result<SharedRow, StoreError> {
        let resource_id = self
            .reservation_to_resource
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::ReservationNotFound(*id))?;
        self.row(&resource_id)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL with one snapshot record per resource and reservation.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;

        let shared: Vec<SharedRow> = self.rows.iter().map(|e| e.value().clone()).collect();
        let mut snapshot = Vec::new();
        for row in shared {
            let guard = row.read().await;
            snapshot.push(Event::ResourceCreated {
                resource: guard.resource.clone(),
            });
            for reservation in guard.reservations.values() {
                snapshot.push(Event::ReservationWritten {
                    reservation: reservation.clone(),
                });
            }
        }
        let records = snapshot.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))?;
        tracing::info!(records, "compacted WAL");
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for WalStore {
    async fn create_resource(&self, resource: Resource) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let _create = self.create_lock.lock().await;
        if self.rows.contains_key(&resource.id) {
            return Err(StoreError::AlreadyExists(resource.id.to_string()));
        }
        let event = Event::ResourceCreated {
            resource: resource.clone(),
        };
        self.wal_append(&event).await?;
        let row = ResourceRow {
            resource,
            reservations: HashMap::new(),
        };
        self.rows
            .insert(row.resource.id.clone(), Arc::new(RwLock::new(row)));
        Ok(())
    }

    async fn read_resource(&self, id: &ResourceId) -> Result<Resource, StoreError> {
        let row = self.row(id)?;
        let guard = row.read().await;
        Ok(guard.resource.clone())
    }

    async fn compare_and_update_allocation(
        &self,
        id: &ResourceId,
        expected_version: u64,
        delta: i64,
    ) -> Result<Resource, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let row = self.row(id)?;
        let mut guard = row.write().await;
        let current = &guard.resource;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                resource_id: id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        if current.allocation_after(delta).is_none() {
            return Err(StoreError::CapacityViolation {
                resource_id: id.clone(),
                allocated: current.allocated,
                total: current.total,
                delta,
            });
        }

        let event = Event::AllocationChanged {
            resource_id: id.clone(),
            delta,
            version: expected_version + 1,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.resource.clone())
    }

    async fn write_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let row = self.row(&reservation.resource_id)?;
        let mut guard = row.write().await;
        if guard.reservations.contains_key(&reservation.id) {
            return Err(StoreError::AlreadyExists(reservation.id.to_string()));
        }
        let event = Event::ReservationWritten {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.reservation_to_resource
            .insert(reservation.id, reservation.resource_id.clone());
        Ok(())
    }

    async fn read_reservation(&self, id: Ulid) -> Result<Reservation, StoreError> {
        let row = self.row_for_reservation(&id)?;
        let guard = row.read().await;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ReservationNotFound(id))
    }

    async fn update_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
        at: Ms,
    ) -> Result<Reservation, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let row = self.row_for_reservation(&id)?;
        let mut guard = row.write().await;
        let current = guard
            .reservations
            .get(&id)
            .ok_or(StoreError::ReservationNotFound(id))?;
        if current.status == status {
            return Ok(current.clone());
        }
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        let event = Event::ReservationStatusChanged { id, status, at };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ReservationNotFound(id))
    }

    async fn list_resources(&self) -> Result<Vec<ResourceId>, StoreError> {
        let mut ids: Vec<ResourceId> = self.rows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn confirmed_quantity(&self, id: &ResourceId) -> Result<u64, StoreError> {
        let row = self.row(id)?;
        let guard = row.read().await;
        Ok(guard
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Confirmed)
            .map(|r| r.quantity as u64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatlock_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    async fn seeded(name: &str, total: u32) -> (WalStore, PathBuf) {
        let path = test_wal_path(name);
        let store = WalStore::open(&path).unwrap();
        store
            .create_resource(Resource::new(rid("R1"), "route", total))
            .await
            .unwrap();
        (store, path)
    }

    #[tokio::test]
    async fn create_and_read() {
        let (store, _) = seeded("create_and_read.wal", 10).await;
        let r = store.read_resource(&rid("R1")).await.unwrap();
        assert_eq!((r.total, r.allocated, r.version), (10, 0, 0));
        assert_eq!(store.list_resources().await.unwrap(), vec![rid("R1")]);
    }

    #[tokio::test]
    async fn duplicate_resource_rejected() {
        let (store, _) = seeded("dup_resource.wal", 10).await;
        let err = store
            .create_resource(Resource::new(rid("R1"), "route", 3))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("R1".into()));
    }

    #[tokio::test]
    async fn missing_resource() {
        let path = test_wal_path("missing.wal");
        let store = WalStore::open(&path).unwrap();
        assert_eq!(
            store.read_resource(&rid("nope")).await,
            Err(StoreError::NotFound(rid("nope")))
        );
        assert!(matches!(
            store.compare_and_update_allocation(&rid("nope"), 0, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cas_bumps_version_once() {
        let (store, _) = seeded("cas_bump.wal", 10).await;
        let r = store.compare_and_update_allocation(&rid("R1"), 0, 6).await.unwrap();
        assert_eq!((r.allocated, r.version), (6, 1));
        let r = store.compare_and_update_allocation(&rid("R1"), 1, -2).await.unwrap();
        assert_eq!((r.allocated, r.version), (4, 2));
    }

    #[tokio::test]
    async fn cas_detects_stale_version() {
        let (store, _) = seeded("cas_stale.wal", 10).await;
        store.compare_and_update_allocation(&rid("R1"), 0, 1).await.unwrap();
        let err = store
            .compare_and_update_allocation(&rid("R1"), 0, 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                resource_id: rid("R1"),
                expected: 0,
                actual: 1
            }
        );
        // Nothing changed.
        let r = store.read_resource(&rid("R1")).await.unwrap();
        assert_eq!((r.allocated, r.version), (1, 1));
    }

    #[tokio::test]
    async fn cas_refuses_overallocation() {
        let (store, _) = seeded("cas_over.wal", 10).await;
        let err = store
            .compare_and_update_allocation(&rid("R1"), 0, 11)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityViolation { total: 10, .. }));
        let err = store
            .compare_and_update_allocation(&rid("R1"), 0, -1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityViolation { allocated: 0, .. }));
        assert_eq!(store.read_resource(&rid("R1")).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn reservation_lifecycle_and_confirmed_sum() {
        let (store, _) = seeded("res_lifecycle.wal", 10).await;
        let mut a = Reservation::pending(rid("R1"), "alice".into(), 3);
        a.transition(ReservationStatus::Confirmed, 1);
        let mut b = Reservation::pending(rid("R1"), "bob".into(), 4);
        b.transition(ReservationStatus::Failed, 1);
        store.write_reservation(&a).await.unwrap();
        store.write_reservation(&b).await.unwrap();
        assert_eq!(store.confirmed_quantity(&rid("R1")).await.unwrap(), 3);

        let cancelled = store
            .update_reservation_status(a.id, ReservationStatus::Cancelled, 9)
            .await
            .unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(cancelled.resolved_at, Some(9));
        assert_eq!(store.confirmed_quantity(&rid("R1")).await.unwrap(), 0);

        // Same status again: no-op.
        let again = store
            .update_reservation_status(a.id, ReservationStatus::Cancelled, 10)
            .await
            .unwrap();
        assert_eq!(again.resolved_at, Some(9));

        let err = store
            .update_reservation_status(b.id, ReservationStatus::Cancelled, 11)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn duplicate_reservation_rejected() {
        let (store, _) = seeded("dup_res.wal", 10).await;
        let r = Reservation::pending(rid("R1"), "alice".into(), 1);
        store.write_reservation(&r).await.unwrap();
        assert!(matches!(
            store.write_reservation(&r).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn reservation_for_unknown_resource() {
        let (store, _) = seeded("res_unknown.wal", 10).await;
        let r = Reservation::pending(rid("R2"), "alice".into(), 1);
        assert_eq!(
            store.write_reservation(&r).await,
            Err(StoreError::NotFound(rid("R2")))
        );
        assert_eq!(
            store.read_reservation(r.id).await,
            Err(StoreError::ReservationNotFound(r.id))
        );
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let (store, path) = seeded("reopen.wal", 10).await;
        store.compare_and_update_allocation(&rid("R1"), 0, 6).await.unwrap();
        let mut res = Reservation::pending(rid("R1"), "alice".into(), 6);
        res.transition(ReservationStatus::Confirmed, 2);
        store.write_reservation(&res).await.unwrap();
        store
            .update_reservation_status(res.id, ReservationStatus::Cancelled, 3)
            .await
            .unwrap();
        store.compare_and_update_allocation(&rid("R1"), 1, -6).await.unwrap();
        drop(store);

        let reopened = WalStore::open(&path).unwrap();
        let r = reopened.read_resource(&rid("R1")).await.unwrap();
        assert_eq!((r.allocated, r.version), (0, 2));
        let stored = reopened.read_reservation(res.id).await.unwrap();
        assert_eq!(stored.status, ReservationStatus::Cancelled);
        assert_eq!(stored.resolved_at, Some(3));
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let (store, path) = seeded("compaction.wal", 10).await;
        for v in 0..5 {
            store.compare_and_update_allocation(&rid("R1"), v, 1).await.unwrap();
        }
        let mut res = Reservation::pending(rid("R1"), "alice".into(), 5);
        res.transition(ReservationStatus::Confirmed, 1);
        store.write_reservation(&res).await.unwrap();
        assert_eq!(store.appends_since_compact().await, 7);

        store.compact().await.unwrap();
        assert_eq!(store.appends_since_compact().await, 0);
        store.compare_and_update_allocation(&rid("R1"), 5, -1).await.unwrap();
        drop(store);

        let reopened = WalStore::open(&path).unwrap();
        let r = reopened.read_resource(&rid("R1")).await.unwrap();
        assert_eq!((r.allocated, r.version), (4, 6));
        assert_eq!(reopened.confirmed_quantity(&rid("R1")).await.unwrap(), 5);
        assert_eq!(reopened.appends_since_compact().await, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_only_one_wins_per_version() {
        let (store, _) = seeded("cas_race.wal", 100).await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                s.compare_and_update_allocation(&rid("R1"), 0, 1).await
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        let r = store.read_resource(&rid("R1")).await.unwrap();
        assert_eq!((r.allocated, r.version), (1, 1));
    }
}
