use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use progeny_db::entities::workers;
use progeny_migration::Migrator;
use progeny_process::{AgePolicy, Selector, SelectorMode, WorkerRecord};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, SqlErr,
};
use sea_orm_migration::MigratorTrait;
use serde::Deserialize;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};

use crate::error::{Error, Result};
use crate::port_alloc::{ListenerCheck, PortManager, PortRange, scan_listeners};
use crate::process_manager_support::{now_unix, pid_is_alive, terminate_pid};

/// What happens to the persisted table when the registry is torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownPolicy {
    #[default]
    Drop,
    Retain,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    pub selector_mode: SelectorMode,
    pub age_policy: AgePolicy,
    pub terminate_grace: Duration,
    pub teardown: TeardownPolicy,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            selector_mode: SelectorMode::Any,
            age_policy: AgePolicy::Created,
            terminate_grace: Duration::from_secs(1),
            teardown: TeardownPolicy::Drop,
        }
    }
}

/// A port held for an identifier whose worker is still starting.
///
/// Must end in [`ProcessRegistry::commit`] or [`ProcessRegistry::release`].
#[derive(Debug)]
#[must_use]
pub struct Reservation {
    identifier: String,
    port: u16,
}

impl Reservation {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[derive(Debug)]
struct RegistryInner {
    ports: PortManager,
    reserved: BTreeMap<String, u16>,
}

struct ScheduledCleaning {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn selector_condition(
    sel: &Selector,
    mode: SelectorMode,
    policy: AgePolicy,
    now: i64,
) -> Option<Condition> {
    if sel.is_empty() {
        return None;
    }

    let mut cond = match mode {
        SelectorMode::Any => Condition::any(),
        SelectorMode::All => Condition::all(),
    };
    if let Some(v) = &sel.identifier {
        cond = cond.add(workers::Column::Identifier.eq(v.clone()));
    }
    if let Some(v) = &sel.session_name {
        cond = cond.add(workers::Column::SessionName.eq(v.clone()));
    }
    if let Some(v) = sel.port {
        cond = cond.add(workers::Column::Port.eq(i32::from(v)));
    }
    if let Some(v) = sel.pid {
        cond = cond.add(workers::Column::Pid.eq(v as i32));
    }
    if let Some(secs) = sel.older_than_secs {
        let cutoff = now.saturating_sub(i64::try_from(secs).unwrap_or(i64::MAX));
        cond = cond.add(match policy {
            AgePolicy::Created => workers::Column::CreatedAt.lt(cutoff),
            AgePolicy::Expiry => workers::Column::ExpiryTimestamp.lt(cutoff),
        });
    }
    Some(cond)
}

// Matches exactly the given rows, even if a newer row reuses the identifier.
fn exact_rows_condition(records: &[WorkerRecord]) -> Condition {
    records.iter().fold(Condition::any(), |cond, r| {
        cond.add(
            Condition::all()
                .add(workers::Column::Identifier.eq(r.identifier.clone()))
                .add(workers::Column::Pid.eq(r.pid as i32)),
        )
    })
}

/// Durable record of running workers.
///
/// All mutations run under one coarse lock that also owns the port pool, so
/// allocation, registration and sweeps never interleave. Process signalling,
/// grace-period waits and listener scans happen outside it.
#[derive(Clone)]
pub struct ProcessRegistry {
    db: Arc<DatabaseConnection>,
    inner: Arc<Mutex<RegistryInner>>,
    range: PortRange,
    listeners: ListenerCheck,
    opts: RegistryOptions,
    cleaning: Arc<Mutex<Option<ScheduledCleaning>>>,
}

impl ProcessRegistry {
    /// Attach to the database (creating the table if absent) and take over
    /// the port pool.
    ///
    /// Rows left behind by a previous run whose process is gone are dropped
    /// first, so their identifiers and ports are usable again.
    pub async fn open(
        db: DatabaseConnection,
        ports: PortManager,
        opts: RegistryOptions,
    ) -> Result<Self> {
        Migrator::up(&db, None).await?;

        let registry = Self {
            db: Arc::new(db),
            range: ports.range(),
            listeners: ports.listener_check(),
            inner: Arc::new(Mutex::new(RegistryInner {
                ports,
                reserved: BTreeMap::new(),
            })),
            opts,
            cleaning: Arc::new(Mutex::new(None)),
        };
        let stale = registry.reconcile().await?;
        if stale > 0 {
            tracing::info!(count = stale, "dropped records left by a previous run");
        }

        let occupied = scan_listeners(registry.range, &registry.listeners).await;
        {
            let mut inner = registry.inner.lock().await;
            inner.ports.set_occupied(occupied);
            registry.refresh_ports_locked(&mut inner).await?;
        }
        Ok(registry)
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.opts
    }

    /// Recompute the pool from the claimed ports and the last listener scan.
    async fn refresh_ports_locked(&self, inner: &mut RegistryInner) -> Result<()> {
        let mut claimed: BTreeSet<u16> = workers::Entity::find()
            .all(&*self.db)
            .await?
            .into_iter()
            .filter_map(|m| u16::try_from(m.port).ok())
            .collect();
        claimed.extend(inner.reserved.values().copied());
        inner.ports.refresh_available(&claimed);
        Ok(())
    }

    /// Ports currently free for allocation.
    pub async fn available_ports(&self) -> BTreeSet<u16> {
        self.inner.lock().await.ports.available().clone()
    }

    /// Every row, oldest first.
    pub async fn records(&self) -> Result<Vec<WorkerRecord>> {
        Ok(workers::Entity::find()
            .order_by_asc(workers::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(WorkerRecord::from)
            .collect())
    }

    async fn register_locked(
        &self,
        inner: &mut RegistryInner,
        record: &WorkerRecord,
    ) -> Result<()> {
        if inner.reserved.contains_key(&record.identifier) {
            return Err(Error::Duplicate {
                field: "identifier",
                value: record.identifier.clone(),
            });
        }
        if inner.reserved.values().any(|p| *p == record.port) {
            return Err(Error::Duplicate {
                field: "port",
                value: record.port.to_string(),
            });
        }

        let clashes = workers::Entity::find()
            .filter(
                Condition::any()
                    .add(workers::Column::Identifier.eq(record.identifier.clone()))
                    .add(workers::Column::Port.eq(i32::from(record.port)))
                    .add(workers::Column::Pid.eq(record.pid as i32)),
            )
            .all(&*self.db)
            .await?;
        if let Some(c) = clashes.first() {
            let (field, value) = if c.identifier == record.identifier {
                ("identifier", record.identifier.clone())
            } else if c.port == i32::from(record.port) {
                ("port", record.port.to_string())
            } else {
                ("pid", record.pid.to_string())
            };
            return Err(Error::Duplicate { field, value });
        }

        let model: workers::ActiveModel = record.into();
        workers::Entity::insert(model)
            .exec_without_returning(&*self.db)
            .await
            .map_err(|err| match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(detail)) => Error::Duplicate {
                    field: "record",
                    value: detail,
                },
                _ => Error::Db(err),
            })?;

        tracing::info!(
            identifier = %record.identifier,
            session = %record.session_name,
            port = record.port,
            pid = record.pid,
            "registered worker"
        );
        self.refresh_ports_locked(inner).await
    }

    /// Persist a worker. Fails if its identifier, port or pid is already held.
    pub async fn register(&self, record: WorkerRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.register_locked(&mut inner, &record).await
    }

    async fn already_has_instance_locked(
        &self,
        inner: &RegistryInner,
        identifier: &str,
    ) -> Result<bool> {
        if inner.reserved.contains_key(identifier) {
            return Ok(true);
        }
        Ok(workers::Entity::find_by_id(identifier.to_string())
            .one(&*self.db)
            .await?
            .is_some())
    }

    pub async fn already_has_instance(&self, identifier: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        let found = self.already_has_instance_locked(&inner, identifier).await?;
        if found {
            tracing::error!(identifier, "already started a worker");
        }
        Ok(found)
    }

    /// Claim the identifier and a port for a worker that is about to start.
    ///
    /// Listeners are scanned once, without holding the lock. The identifier
    /// is checked before the scan and again after it.
    pub async fn reserve(&self, identifier: &str) -> Result<Reservation> {
        self.ensure_not_running(&*self.inner.lock().await, identifier)
            .await?;
        let occupied = scan_listeners(self.range, &self.listeners).await;

        let mut inner = self.inner.lock().await;
        self.ensure_not_running(&inner, identifier).await?;
        inner.ports.set_occupied(occupied);
        self.refresh_ports_locked(&mut inner).await?;
        let port = inner.ports.allocate()?;
        inner.reserved.insert(identifier.to_string(), port);
        tracing::debug!(identifier, port, "port reserved");
        Ok(Reservation {
            identifier: identifier.to_string(),
            port,
        })
    }

    async fn ensure_not_running(&self, inner: &RegistryInner, identifier: &str) -> Result<()> {
        if self.already_has_instance_locked(inner, identifier).await? {
            tracing::error!(identifier, "already started a worker");
            return Err(Error::DuplicateSession(identifier.to_string()));
        }
        Ok(())
    }

    /// Give back a reservation whose worker never made it to registration.
    pub async fn release(&self, reservation: Reservation) {
        let mut inner = self.inner.lock().await;
        inner.reserved.remove(&reservation.identifier);
        inner.ports.release(reservation.port);
        tracing::debug!(
            identifier = %reservation.identifier,
            port = reservation.port,
            "reservation released"
        );
    }

    /// Turn a reservation into a registered record. On failure the port goes
    /// back to the pool.
    pub async fn commit(&self, reservation: Reservation, record: &WorkerRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.reserved.remove(&reservation.identifier);
        let res = self.register_locked(&mut inner, record).await;
        if res.is_err() {
            inner.ports.release(reservation.port);
        }
        res
    }

    fn is_safe(&self, sel: &Selector, allow_unsafe: bool) -> bool {
        if !sel.is_empty() || allow_unsafe {
            return true;
        }
        tracing::warn!(
            "all records selected (no conditions were set), but allow_unsafe is false: \
             not selecting or deleting anything"
        );
        false
    }

    fn condition(&self, sel: &Selector) -> Option<Condition> {
        selector_condition(sel, self.opts.selector_mode, self.opts.age_policy, now_unix())
    }

    pub async fn find_matching(
        &self,
        sel: &Selector,
        allow_unsafe: bool,
    ) -> Result<Vec<WorkerRecord>> {
        if !self.is_safe(sel, allow_unsafe) {
            return Ok(Vec::new());
        }
        let mut query = workers::Entity::find();
        if let Some(cond) = self.condition(sel) {
            query = query.filter(cond);
        }
        Ok(query
            .order_by_asc(workers::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(WorkerRecord::from)
            .collect())
    }

    /// Delete matching rows without touching their processes.
    pub async fn delete(&self, sel: &Selector, allow_unsafe: bool) -> Result<u64> {
        if !self.is_safe(sel, allow_unsafe) {
            return Ok(0);
        }
        let mut inner = self.inner.lock().await;
        let mut query = workers::Entity::delete_many();
        if let Some(cond) = self.condition(sel) {
            query = query.filter(cond);
        }
        let res = query.exec(&*self.db).await?;
        self.refresh_ports_locked(&mut inner).await?;
        Ok(res.rows_affected)
    }

    pub async fn terminate(&self, pid: u32) {
        terminate_pid(pid, self.opts.terminate_grace).await;
    }

    /// Terminate the processes of matching rows, then delete those rows.
    ///
    /// A crash between the two phases leaves stale rows, never live
    /// processes nothing points at.
    pub async fn sweep(&self, sel: &Selector, allow_unsafe: bool) -> Result<usize> {
        let records = self.find_matching(sel, allow_unsafe).await?;
        if records.is_empty() {
            return Ok(0);
        }

        join_all(records.iter().map(|r| {
            tracing::info!(
                identifier = %r.identifier,
                port = r.port,
                pid = r.pid,
                "cleaning up worker"
            );
            self.terminate(r.pid)
        }))
        .await;

        let mut inner = self.inner.lock().await;
        workers::Entity::delete_many()
            .filter(exact_rows_condition(&records))
            .exec(&*self.db)
            .await?;
        self.refresh_ports_locked(&mut inner).await?;
        Ok(records.len())
    }

    /// Drop rows whose process no longer exists. Rows survive restarts, so
    /// liveness is checked against the OS rather than trusted.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let dead: Vec<WorkerRecord> = workers::Entity::find()
            .all(&*self.db)
            .await?
            .into_iter()
            .map(WorkerRecord::from)
            .filter(|r| !pid_is_alive(r.pid))
            .collect();
        if dead.is_empty() {
            return Ok(0);
        }
        for r in &dead {
            tracing::info!(
                identifier = %r.identifier,
                port = r.port,
                pid = r.pid,
                "removing record of dead worker"
            );
        }
        workers::Entity::delete_many()
            .filter(exact_rows_condition(&dead))
            .exec(&*self.db)
            .await?;
        self.refresh_ports_locked(&mut inner).await?;
        Ok(dead.len())
    }

    async fn scheduled_tick(&self, timeout: Duration) {
        tracing::debug!("cleaning processes");
        if let Err(err) = self.reconcile().await {
            tracing::warn!(%err, "reconcile failed");
        }
        match self.sweep(&Selector::older_than(timeout.as_secs()), false).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "expired workers cleaned up"),
            Err(err) => tracing::warn!(%err, "scheduled cleaning failed"),
        }
    }

    /// Every `interval`, remove dead rows and sweep workers older than
    /// `timeout`. The first pass runs immediately.
    pub async fn start_scheduled_cleaning(&self, interval: Duration, timeout: Duration) {
        let mut slot = self.cleaning.lock().await;
        if slot.is_some() {
            tracing::warn!("scheduled cleaning already running");
            return;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                registry.scheduled_tick(timeout).await;
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!("scheduled cleaning stopped");
        });
        tracing::info!(
            interval_sec = interval.as_secs(),
            timeout_sec = timeout.as_secs(),
            "scheduled cleaning started"
        );
        *slot = Some(ScheduledCleaning { stop, handle });
    }

    /// Cancel the timer and wait for an in-flight pass to finish.
    pub async fn stop_scheduled_cleaning(&self) {
        let Some(cleaning) = self.cleaning.lock().await.take() else {
            return;
        };
        tracing::info!("stopping timer");
        let _ = cleaning.stop.send(true);
        if let Err(err) = cleaning.handle.await {
            tracing::warn!(%err, "scheduled cleaning task failed");
        }
    }

    /// Stop the timer, terminate every worker, then drop or keep the table.
    pub async fn teardown(&self) -> Result<usize> {
        self.stop_scheduled_cleaning().await;
        let swept = self.sweep(&Selector::everything(), true).await?;
        if self.opts.teardown == TeardownPolicy::Drop {
            let _inner = self.inner.lock().await;
            Migrator::down(&*self.db, None).await?;
            tracing::info!("registry table dropped");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::FutureExt;
    use progeny_process::NO_EXPIRY;

    use super::*;
    use crate::port_alloc::{ListenerCheck, PortRange};

    fn no_listeners() -> ListenerCheck {
        Arc::new(|_: u16| async { false }.boxed())
    }

    fn test_ports() -> PortManager {
        PortManager::with_listener_check(PortRange::new(8080, 8090).unwrap(), no_listeners())
    }

    async fn registry_with(opts: RegistryOptions) -> ProcessRegistry {
        let db = progeny_db::connect("sqlite::memory:").await.unwrap();
        ProcessRegistry::open(db, test_ports(), opts).await.unwrap()
    }

    async fn registry() -> ProcessRegistry {
        registry_with(RegistryOptions {
            terminate_grace: Duration::from_millis(50),
            ..RegistryOptions::default()
        })
        .await
    }

    fn record(identifier: &str, port: u16, pid: u32, age_secs: i64) -> WorkerRecord {
        WorkerRecord {
            identifier: identifier.to_string(),
            session_name: format!("{identifier}-token"),
            port,
            pid,
            expiry_timestamp: NO_EXPIRY,
            created_at: now_unix() - age_secs,
        }
    }

    fn sleeper() -> tokio::process::Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_identifier_is_rejected_until_deleted() {
        let reg = registry().await;
        reg.register(record("alice", 8080, 4_200_001, 0)).await.unwrap();

        let err = reg
            .register(record("alice", 8081, 4_200_002, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { field: "identifier", .. }));

        assert_eq!(reg.delete(&Selector::identifier("alice"), false).await.unwrap(), 1);
        reg.register(record("alice", 8081, 4_200_002, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_port_and_pid_are_rejected() {
        let reg = registry().await;
        reg.register(record("alice", 8080, 4_200_001, 0)).await.unwrap();

        let err = reg.register(record("bob", 8080, 4_200_002, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate { field: "port", .. }));

        let err = reg.register(record("bob", 8081, 4_200_001, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate { field: "pid", .. }));
    }

    #[tokio::test]
    async fn registered_ports_leave_the_pool() {
        let reg = registry().await;
        assert!(reg.available_ports().await.contains(&8080));
        reg.register(record("alice", 8080, 4_200_001, 0)).await.unwrap();
        assert!(!reg.available_ports().await.contains(&8080));

        let r = reg.reserve("bob").await.unwrap();
        assert_eq!(r.port(), 8081);
        reg.release(r).await;
        assert!(reg.available_ports().await.contains(&8081));
    }

    #[tokio::test]
    async fn reservation_blocks_second_identifier() {
        let reg = registry().await;
        let r = reg.reserve("alice").await.unwrap();
        assert!(reg.already_has_instance("alice").await.unwrap());
        assert!(matches!(
            reg.reserve("alice").await,
            Err(Error::DuplicateSession(_))
        ));

        let port = r.port();
        reg.commit(r, &record("alice", port, 4_200_001, 0)).await.unwrap();
        assert!(reg.already_has_instance("alice").await.unwrap());
        assert!(!reg.already_has_instance("bob").await.unwrap());
    }

    #[tokio::test]
    async fn empty_selector_needs_opt_in() {
        let reg = registry().await;
        reg.register(record("alice", 8080, 4_200_001, 0)).await.unwrap();
        reg.register(record("bob", 8081, 4_200_002, 0)).await.unwrap();

        assert!(reg.find_matching(&Selector::everything(), false).await.unwrap().is_empty());
        assert_eq!(reg.delete(&Selector::everything(), false).await.unwrap(), 0);
        assert_eq!(reg.records().await.unwrap().len(), 2);

        assert_eq!(reg.find_matching(&Selector::everything(), true).await.unwrap().len(), 2);
        assert_eq!(reg.delete(&Selector::everything(), true).await.unwrap(), 2);
        assert!(reg.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn selector_mode_controls_combination() {
        let sel = Selector {
            identifier: Some("alice".to_string()),
            port: Some(8081),
            ..Selector::default()
        };

        let any = registry().await;
        any.register(record("alice", 8080, 4_200_001, 0)).await.unwrap();
        any.register(record("bob", 8081, 4_200_002, 0)).await.unwrap();
        assert_eq!(any.find_matching(&sel, false).await.unwrap().len(), 2);

        let all = registry_with(RegistryOptions {
            selector_mode: SelectorMode::All,
            ..RegistryOptions::default()
        })
        .await;
        all.register(record("alice", 8080, 4_200_001, 0)).await.unwrap();
        all.register(record("bob", 8081, 4_200_002, 0)).await.unwrap();
        assert!(all.find_matching(&sel, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_records() {
        let reg = registry().await;
        let mut children = vec![sleeper(), sleeper(), sleeper()];
        let pids: Vec<u32> = children.iter().map(|c| c.id().unwrap()).collect();

        reg.register(record("fresh", 8080, pids[0], 0)).await.unwrap();
        reg.register(record("middle", 8081, pids[1], 50)).await.unwrap();
        reg.register(record("old", 8082, pids[2], 120)).await.unwrap();

        let n = reg.sweep(&Selector::older_than(60), false).await.unwrap();
        assert_eq!(n, 1);

        let left: Vec<String> = reg
            .records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.identifier)
            .collect();
        assert_eq!(left, vec!["middle".to_string(), "fresh".to_string()]);

        let status = children[2].wait().await.unwrap();
        assert!(!status.success());
        assert!(pid_is_alive(pids[0]));
        assert!(reg.available_ports().await.contains(&8082));
    }

    #[tokio::test]
    async fn expiry_policy_sweeps_expired_records() {
        let reg = registry_with(RegistryOptions {
            age_policy: AgePolicy::Expiry,
            terminate_grace: Duration::from_millis(50),
            ..RegistryOptions::default()
        })
        .await;
        let mut expired = record("expired", 8080, 4_200_001, 10);
        expired.expiry_timestamp = now_unix() - 5;
        reg.register(expired).await.unwrap();
        reg.register(record("current", 8081, 4_200_002, 10_000)).await.unwrap();

        let n = reg.sweep(&Selector::older_than(0), false).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(reg.records().await.unwrap()[0].identifier, "current");
    }

    #[tokio::test]
    async fn reconcile_drops_dead_pids() {
        let reg = registry().await;
        let alive = sleeper();
        let alive_pid = alive.id().unwrap();
        reg.register(record("alive", 8080, alive_pid, 0)).await.unwrap();
        reg.register(record("dead", 8081, 4_200_002, 0)).await.unwrap();

        assert_eq!(reg.reconcile().await.unwrap(), 1);
        let left = reg.records().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].pid, alive_pid);
        assert!(reg.available_ports().await.contains(&8081));
    }

    #[tokio::test]
    async fn scheduled_cleaning_runs_and_stops() {
        let reg = registry().await;
        reg.register(record("dead", 8080, 4_200_001, 0)).await.unwrap();

        reg.start_scheduled_cleaning(Duration::from_secs(3600), Duration::from_secs(3600))
            .await;
        // The first pass runs immediately and reconciles the dead row.
        for _ in 0..50 {
            if reg.records().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reg.records().await.unwrap().is_empty());

        reg.stop_scheduled_cleaning().await;
        reg.stop_scheduled_cleaning().await;
    }

    #[tokio::test]
    async fn teardown_sweeps_everything_and_keeps_table_when_retained() {
        let reg = registry_with(RegistryOptions {
            terminate_grace: Duration::from_millis(50),
            teardown: TeardownPolicy::Retain,
            ..RegistryOptions::default()
        })
        .await;
        let mut child = sleeper();
        reg.register(record("alice", 8080, child.id().unwrap(), 0)).await.unwrap();

        assert_eq!(reg.teardown().await.unwrap(), 1);
        assert!(!child.wait().await.unwrap().success());
        assert!(reg.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopening_drops_rows_of_dead_workers() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("workers.db").display());
        let opts = RegistryOptions {
            teardown: TeardownPolicy::Retain,
            ..RegistryOptions::default()
        };

        let alive = sleeper();
        let alive_pid = alive.id().unwrap();
        {
            let db = progeny_db::connect(&url).await.unwrap();
            let reg = ProcessRegistry::open(db, test_ports(), opts).await.unwrap();
            reg.register(record("alice", 8085, 4_200_001, 0)).await.unwrap();
            reg.register(record("bob", 8086, alive_pid, 0)).await.unwrap();
        }

        let db = progeny_db::connect(&url).await.unwrap();
        let reg = ProcessRegistry::open(db, test_ports(), opts).await.unwrap();
        let left = reg.records().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].identifier, "bob");

        assert!(!reg.already_has_instance("alice").await.unwrap());
        let ports = reg.available_ports().await;
        assert!(ports.contains(&8085));
        assert!(!ports.contains(&8086));

        let r = reg.reserve("alice").await.unwrap();
        assert_eq!(r.port(), 8080);
        reg.release(r).await;
        assert!(matches!(reg.reserve("bob").await, Err(Error::DuplicateSession(_))));
    }

    #[tokio::test]
    async fn reserve_excludes_ports_with_listeners() {
        let busy: ListenerCheck = Arc::new(|p: u16| async move { p == 8080 || p == 8081 }.boxed());
        let db = progeny_db::connect("sqlite::memory:").await.unwrap();
        let ports = PortManager::with_listener_check(PortRange::new(8080, 8090).unwrap(), busy);
        let reg = ProcessRegistry::open(db, ports, RegistryOptions::default())
            .await
            .unwrap();

        assert!(!reg.available_ports().await.contains(&8081));
        let r = reg.reserve("alice").await.unwrap();
        assert_eq!(r.port(), 8082);
        reg.release(r).await;
    }
}
