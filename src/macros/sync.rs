//! Two-way reconciliation of local and controller macros by corrected
//! modification time.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::backup::create_backup;
use super::{is_valid_name, LocalStore, MacroRef};
use crate::channel::{Controller, DRIFT_LIMIT};
use crate::error::SyncError;
use crate::events::{EventSink, SessionEvent};
use crate::time::{ClockOffset, Timestamp};

/// Corrected timestamps closer than this are the same edit.
pub const EPSILON_MS: i64 = 1_000;

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOptions {
    /// Proceed even though the offset exceeds the drift limit.
    pub confirm_drift: bool,
    /// Use this instead of the measured offset.
    pub offset_override: Option<ClockOffset>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    UploadFailed,
    DownloadFailed,
    DeleteFailed,
    Unreachable,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub name: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl SyncFailure {
    fn new(name: &str, err: SyncError) -> Self {
        let (kind, reason) = match err {
            SyncError::UploadFailed(r) => (FailureKind::UploadFailed, r),
            SyncError::DownloadFailed(r) => (FailureKind::DownloadFailed, r),
            SyncError::DeleteFailed(r) => (FailureKind::DeleteFailed, r),
            SyncError::Unreachable(e) => (FailureKind::Unreachable, e.to_string()),
            other => (FailureKind::DownloadFailed, other.to_string()),
        };
        Self {
            name: name.to_string(),
            kind,
            reason,
        }
    }
}

/// Partial success is normal: whatever could not be moved is listed in
/// `failures`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub in_sync: Vec<String>,
    pub failures: Vec<SyncFailure>,
    pub offset: ClockOffset,
}

impl SyncReport {
    pub fn transfers(&self) -> usize {
        self.uploaded.len() + self.downloaded.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut s = format!(
            "{} uploaded, {} downloaded, {} in sync, {} failed (offset {})",
            self.uploaded.len(),
            self.downloaded.len(),
            self.in_sync.len(),
            self.failures.len(),
            self.offset
        );
        for f in &self.failures {
            s.push_str(&format!("; {}: {:?} {}", f.name, f.kind, f.reason));
        }
        s
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Upload,
    Download,
    InSync,
}

/// Decide one name. `local` is on the local clock, `remote` on the
/// controller's.
fn plan(local: Option<Timestamp>, remote: Option<Timestamp>, offset: ClockOffset) -> Option<Action> {
    match (local, remote) {
        (Some(_), None) => Some(Action::Upload),
        (None, Some(_)) => Some(Action::Download),
        (Some(local), Some(remote)) => {
            let diff = local.millis_since(remote.corrected(offset));
            Some(if diff.abs() <= EPSILON_MS {
                Action::InSync
            } else if diff > 0 {
                Action::Upload
            } else {
                Action::Download
            })
        }
        (None, None) => None,
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MacroSync<C: Controller + ?Sized> {
    controller: Arc<C>,
    store: LocalStore,
    backup_limit: usize,
    events: EventSink,
    running: AtomicBool,
}

impl<C: Controller + ?Sized> MacroSync<C> {
    pub fn new(controller: Arc<C>, store: LocalStore, backup_limit: usize, events: EventSink) -> Self {
        Self {
            controller,
            store,
            backup_limit,
            events,
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    fn begin(&self) -> Result<RunGuard<'_>, SyncError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::InProgress)?;
        Ok(RunGuard(&self.running))
    }

    async fn resolve_offset(&self, options: SyncOptions) -> Result<ClockOffset, SyncError> {
        let offset = match options.offset_override.or_else(|| self.controller.current_offset()) {
            Some(offset) => offset,
            None => self.controller.measure_offset().await.map_err(|e| {
                tracing::warn!("clock offset measurement failed: {e}");
                SyncError::OffsetUnknown
            })?,
        };
        if offset.exceeds(DRIFT_LIMIT) && !options.confirm_drift {
            return Err(SyncError::ClockDriftWarning { offset });
        }
        Ok(offset)
    }

    /// Archive local macros once per run, before the first overwrite. A
    /// failure is remembered so later downloads in the run are refused too.
    async fn ensure_backup(&self, done: &mut Option<Result<(), String>>) -> Result<(), SyncError> {
        if let Some(result) = done {
            return result.clone().map_err(SyncError::Backup);
        }
        let store = self.store.clone();
        let limit = self.backup_limit;
        let result = tokio::task::spawn_blocking(move || create_backup(&store, "sync", limit))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map(|_| ()).map_err(|e| e.to_string()));
        if let Err(e) = &result {
            tracing::error!("macro backup failed, not overwriting local files: {e}");
        }
        *done = Some(result.clone());
        result.map_err(SyncError::Backup)
    }

    pub async fn sync(&self, options: SyncOptions) -> Result<SyncReport, SyncError> {
        let _guard = self.begin()?;
        let offset = self.resolve_offset(options).await?;

        let local: BTreeMap<String, Timestamp> = self
            .store
            .list()?
            .into_iter()
            .map(|m| (m.name, m.modified_at))
            .collect();
        let remote: BTreeMap<String, Timestamp> = self
            .controller
            .list_macros()
            .await
            .map_err(SyncError::Unreachable)?
            .into_iter()
            .filter(|m| is_valid_name(&m.name))
            .map(|m| (m.name, m.modified_at))
            .collect();

        self.events.emit(SessionEvent::SyncStarted);
        tracing::info!(
            "syncing macros: {} local, {} on controller, offset {offset}",
            local.len(),
            remote.len()
        );

        let names: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
        let mut report = SyncReport {
            offset,
            ..SyncReport::default()
        };
        let mut backup = None;

        for name in names {
            let local_at = local.get(name).copied();
            let remote_at = remote.get(name).copied();
            match plan(local_at, remote_at, offset) {
                Some(Action::InSync) => report.in_sync.push(name.clone()),
                Some(Action::Upload) => match self.upload(name).await {
                    Ok(()) => report.uploaded.push(name.clone()),
                    Err(e) => report.failures.push(SyncFailure::new(name, e)),
                },
                Some(Action::Download) => {
                    if local_at.is_some() {
                        if let Err(e) = self.ensure_backup(&mut backup).await {
                            report.failures.push(SyncFailure::new(name, e));
                            continue;
                        }
                    }
                    let listed_at = remote_at.unwrap_or_default();
                    match self.download(name, listed_at.corrected(offset)).await {
                        Ok(()) => report.downloaded.push(name.clone()),
                        Err(e) => report.failures.push(SyncFailure::new(name, e)),
                    }
                }
                None => {}
            }
        }

        if !report.uploaded.is_empty() {
            self.align_uploaded(&report.uploaded, offset).await;
        }

        for failure in &report.failures {
            tracing::warn!("macro {} not synced: {}", failure.name, failure.reason);
        }
        tracing::info!("macro sync finished: {}", report.summary());
        self.events.emit(SessionEvent::SyncCompleted {
            report: report.clone(),
        });
        Ok(report)
    }

    async fn upload(&self, name: &str) -> Result<(), SyncError> {
        let local = self
            .store
            .read(name)
            .map_err(|e| SyncError::UploadFailed(e.to_string()))?;
        self.controller
            .upload_macro(name, &local.content)
            .await
            .map_err(SyncError::upload)?;
        tracing::debug!("uploaded macro {name}");
        Ok(())
    }

    /// `stamp` is the listing time, corrected; the next run compares
    /// against that same listing entry.
    async fn download(&self, name: &str, stamp: Timestamp) -> Result<(), SyncError> {
        let remote = self
            .controller
            .download_macro(name)
            .await
            .map_err(SyncError::download)?;
        self.store
            .write(name, &remote.content)
            .and_then(|_| self.store.set_modified(name, stamp))
            .map_err(|e| SyncError::DownloadFailed(e.to_string()))?;
        tracing::debug!("downloaded macro {name}");
        Ok(())
    }

    /// Give freshly uploaded files the controller's (corrected) time so the
    /// next run sees them as equal.
    async fn align_uploaded(&self, uploaded: &[String], offset: ClockOffset) {
        let listing: Vec<MacroRef> = match self.controller.list_macros().await {
            Ok(listing) => listing,
            Err(e) => {
                tracing::warn!("could not re-read controller macros after upload: {e}");
                return;
            }
        };
        for entry in listing.iter().filter(|m| uploaded.contains(&m.name)) {
            if let Err(e) = self.store.set_modified(&entry.name, entry.modified_at.corrected(offset)) {
                tracing::warn!("could not align mtime of {}: {e}", entry.name);
            }
        }
    }

    /// Remove a macro on the controller and locally. Sync never does this on
    /// its own. Returns whether a local file existed.
    pub async fn delete(&self, name: &str) -> Result<bool, SyncError> {
        if !is_valid_name(name) {
            return Err(SyncError::Local(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid macro name {name:?}"),
            )));
        }
        let _guard = self.begin()?;
        self.controller
            .delete_macro(name)
            .await
            .map_err(SyncError::delete)?;
        let removed = self.store.delete(name)?;
        tracing::info!("deleted macro {name}");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeController;
    use std::path::Path;

    const T: i64 = 1_650_000_000_000;

    fn setup(dir: &Path, offset: Option<i64>) -> (Arc<FakeController>, MacroSync<FakeController>) {
        let fake = Arc::new(FakeController::new());
        fake.set_offset(offset.map(ClockOffset::from_millis));
        let store = LocalStore::new(dir, &["gcode".to_string()]);
        let sync = MacroSync::new(fake.clone(), store, 5, EventSink::disabled());
        (fake, sync)
    }

    fn local(sync: &MacroSync<FakeController>, name: &str, content: &str, at: i64) {
        sync.store().write(name, content).unwrap();
        sync.store().set_modified(name, Timestamp::from_unix_millis(at)).unwrap();
    }

    #[test]
    fn test_plan() {
        let o = ClockOffset::from_millis(1_500);
        let ts = Timestamp::from_unix_millis;
        assert_eq!(plan(Some(ts(T)), None, o), Some(Action::Upload));
        assert_eq!(plan(None, Some(ts(T)), o), Some(Action::Download));
        assert_eq!(plan(Some(ts(T)), Some(ts(T - 1_500 + 3_000)), o), Some(Action::Download));
        assert_eq!(plan(Some(ts(T)), Some(ts(T - 1_500 - 3_000)), o), Some(Action::Upload));
        assert_eq!(plan(Some(ts(T)), Some(ts(T - 1_500 + 800)), o), Some(Action::InSync));
    }

    #[tokio::test]
    async fn test_extreme_controller_time_does_not_abort_sync() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(5));
        local(&sync, "far", "G0 X1", T);
        local(&sync, "early", "G0 X2", T);
        fake.put_macro("far", "G0 X9", Timestamp::from_unix_millis(i64::MAX));
        fake.put_macro("early", "G0 X8", Timestamp::from_unix_millis(i64::MIN));

        let report = sync.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(report.uploaded, vec!["early"]);
        let far_handled = report.downloaded.iter().any(|n| n == "far")
            || report.failures.iter().any(|f| f.name == "far");
        assert!(far_handled, "{}", report.summary());
    }

    #[tokio::test]
    async fn test_second_sync_transfers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(120));
        local(&sync, "probe", "G38.2 Z-10", T);
        fake.put_macro("park", "G0 Z20", Timestamp::from_unix_millis(T - 50_000));

        let first = sync.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(first.uploaded, vec!["probe"]);
        assert_eq!(first.downloaded, vec!["park"]);

        let second = sync.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(second.transfers(), 0);
        assert_eq!(second.in_sync, vec!["park", "probe"]);
        assert_eq!(fake.upload_count(), 1);
        assert_eq!(fake.download_count(), 1);
    }

    #[tokio::test]
    async fn test_newer_controller_copy_overwrites_local() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(1_500));
        local(&sync, "probe", "old", T);
        fake.put_macro("probe", "new", Timestamp::from_unix_millis(T - 1_500 + 3_000));

        let report = sync.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(report.downloaded, vec!["probe"]);

        let probe = sync.store().read("probe").unwrap();
        assert_eq!(probe.content, "new");
        assert_eq!(probe.modified_at, Timestamp::from_unix_millis(T + 3_000));

        // The overwritten copy was archived first
        let backups = crate::macros::backup::list_backups(&dir.path().join(".backups")).unwrap();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_backup_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(0));
        local(&sync, "probe", "old", T);
        local(&sync, "park", "G0 Z5", T);
        fake.put_macro("probe", "new", Timestamp::from_unix_millis(T + 5_000));
        fake.put_macro("park", "G0 Z9", Timestamp::from_unix_millis(T + 5_000));
        // A plain file where the archive directory should go
        std::fs::write(dir.path().join(".backups"), "in the way").unwrap();

        let report = sync.sync(SyncOptions::default()).await.unwrap();
        assert!(report.downloaded.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].reason.starts_with("backup failed"));
        assert_eq!(sync.store().read("probe").unwrap().content, "old");
        assert_eq!(fake.download_count(), 0);
    }

    #[tokio::test]
    async fn test_newer_local_copy_is_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(-400));
        local(&sync, "probe", "mine", T);
        fake.put_macro("probe", "theirs", Timestamp::from_unix_millis(T + 400 - 3_000));

        let report = sync.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(report.uploaded, vec!["probe"]);
        assert_eq!(fake.remote_macro("probe").unwrap().0, "mine");
    }

    #[tokio::test]
    async fn test_drift_beyond_limit_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(2_500));
        local(&sync, "probe", "old", T);
        fake.put_macro("probe", "new", Timestamp::from_unix_millis(T + 60_000));

        let err = sync.sync(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::ClockDriftWarning { offset } if offset.as_millis() == 2_500));
        assert_eq!(fake.download_count(), 0);
        assert_eq!(sync.store().read("probe").unwrap().content, "old");

        let confirmed = SyncOptions {
            confirm_drift: true,
            ..SyncOptions::default()
        };
        let report = sync.sync(confirmed).await.unwrap();
        assert_eq!(report.downloaded, vec!["probe"]);
    }

    #[tokio::test]
    async fn test_unknown_offset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), None);
        fake.set_measured_offset(None);
        local(&sync, "probe", "G0", T);

        let err = sync.sync(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::OffsetUnknown));
        assert_eq!(fake.upload_count(), 0);

        let manual = SyncOptions {
            offset_override: Some(ClockOffset::from_millis(0)),
            ..SyncOptions::default()
        };
        assert_eq!(sync.sync(manual).await.unwrap().uploaded, vec!["probe"]);
    }

    #[tokio::test]
    async fn test_offset_measured_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), None);
        fake.set_measured_offset(Some(ClockOffset::from_millis(300)));
        let report = sync.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(report.offset.as_millis(), 300);
    }

    #[tokio::test]
    async fn test_single_failure_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(0));
        local(&sync, "bad", "G0", T);
        local(&sync, "good", "G1", T);
        fake.fail_transfers_of("bad");

        let report = sync.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(report.uploaded, vec!["good"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "bad");
        assert_eq!(report.failures[0].kind, FailureKind::UploadFailed);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_unreachable_controller_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(0));
        fake.set_unreachable(true);
        let err = sync.sync(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_sync_never_deletes_but_delete_removes_both() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, sync) = setup(dir.path(), Some(0));
        local(&sync, "probe", "G0", T);
        sync.sync(SyncOptions::default()).await.unwrap();

        assert!(sync.delete("probe").await.unwrap());
        assert!(fake.remote_macro("probe").is_none());
        assert_eq!(fake.deleted(), vec!["probe"]);
        assert!(sync.store().list().unwrap().is_empty());
        assert!(sync.delete("../x").await.is_err());
    }
}
