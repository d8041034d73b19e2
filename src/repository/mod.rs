pub mod model;
pub mod store;
pub mod watch;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Settings, StorageBackend};
use crate::error::Error;
use crate::types::Result;

pub use model::{
    AcmeAccount, AcmeAccountBody, AcmeResource, IssuanceMode, SelfSigner, SignerNode, Zone,
    ZoneCertificate,
};
pub use store::{DataStore, FileStore, MemoryStore};
pub use watch::{WatchHandle, ZoneEvent, ZoneEventKind, ZoneWatch};

pub(crate) const SIGNERS: &str = "signers";
pub(crate) const ACCOUNTS: &str = "accounts";
pub(crate) const ZONES: &str = "zones";

/// Events buffered per subscriber before it is considered lagging
const WATCH_BUFFER: usize = 256;

fn key(namespace: &str, id: &str) -> String {
    format!("{}/{}", namespace, id)
}

pub(crate) async fn load_all<T: DeserializeOwned>(
    store: &dyn DataStore,
    namespace: &str,
    prefix: &str,
) -> Result<Vec<T>> {
    store
        .scan(&key(namespace, prefix))
        .await?
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(Error::from))
        .collect()
}

/// Durable owner of self-signers, ACME accounts and zones.
///
/// Writes are serialized by a commit lock; zone commits are broadcast to
/// watchers in commit order.
pub struct CertificateRepository {
    store: Arc<dyn DataStore>,
    commit_lock: Mutex<()>,
    events: broadcast::Sender<ZoneEvent>,
}

impl CertificateRepository {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            store,
            commit_lock: Mutex::new(()),
            events,
        }
    }

    /// Repository backed by the configured store
    pub fn from_settings(settings: &Settings) -> Self {
        let store: Arc<dyn DataStore> = match settings.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::File => Arc::new(FileStore::new(settings.storage_dir())),
        };
        Self::new(store)
    }

    async fn get_json<T: DeserializeOwned>(&self, namespace: &str, id: &str) -> Result<Option<T>> {
        match self.store.get(&key(namespace, id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, namespace: &str, id: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.store.put(&key(namespace, id), bytes).await
    }

    // Self-signers

    pub async fn save_self_signer(&self, signer: &SelfSigner) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        self.put_json(SIGNERS, &signer.name, signer).await?;
        debug!(signer = %signer.name, "Saved self-signer");
        Ok(())
    }

    /// Store a new self-signer; an existing name is rejected
    pub async fn insert_self_signer(&self, signer: &SelfSigner) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        if self.store.get(&key(SIGNERS, &signer.name)).await?.is_some() {
            return Err(Error::InvalidRequest(format!(
                "Self-signer '{}' already exists",
                signer.name
            )));
        }
        self.put_json(SIGNERS, &signer.name, signer).await?;
        debug!(signer = %signer.name, "Inserted self-signer");
        Ok(())
    }

    pub async fn find_self_signer(&self, name: &str) -> Result<Option<SelfSigner>> {
        self.get_json(SIGNERS, name).await
    }

    pub async fn list_self_signers(&self, prefix: &str) -> Result<Vec<SelfSigner>> {
        load_all(self.store.as_ref(), SIGNERS, prefix).await
    }

    pub async fn delete_self_signer(&self, name: &str) -> Result<bool> {
        let _guard = self.commit_lock.lock().await;
        self.store.delete(&key(SIGNERS, name)).await
    }

    // ACME accounts

    /// Store an account. Re-saving an email with different credentials is rejected.
    pub async fn save_acme_account(&self, account: &AcmeAccount) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        if let Some(existing) = self.get_json::<AcmeAccount>(ACCOUNTS, &account.email).await? {
            if existing.credentials != account.credentials {
                return Err(Error::InvalidRequest(format!(
                    "ACME account for '{}' already exists",
                    account.email
                )));
            }
        }
        self.put_json(ACCOUNTS, &account.email, account).await?;
        debug!(email = %account.email, "Saved ACME account");
        Ok(())
    }

    pub async fn find_acme_account(&self, email: &str) -> Result<Option<AcmeAccount>> {
        self.get_json(ACCOUNTS, email).await
    }

    pub async fn list_acme_accounts(&self, prefix: &str) -> Result<Vec<AcmeAccount>> {
        load_all(self.store.as_ref(), ACCOUNTS, prefix).await
    }

    pub async fn delete_acme_account(&self, email: &str) -> Result<bool> {
        let _guard = self.commit_lock.lock().await;
        self.store.delete(&key(ACCOUNTS, email)).await
    }

    // Zones

    /// Create or replace a zone and notify watchers
    pub async fn save_zone(&self, zone: &Zone) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        let existed = self.store.get(&key(ZONES, &zone.name)).await?.is_some();
        let kind = if existed {
            ZoneEventKind::Updated
        } else {
            ZoneEventKind::Created
        };
        self.commit_zone(zone, kind).await?;
        Ok(())
    }

    /// Replace a zone only if its stored `updated_at` still equals `expected`.
    ///
    /// Fails with [`Error::Conflict`] when the zone was deleted or changed in the
    /// meantime. Returns the committed state.
    pub async fn save_zone_if(&self, zone: &Zone, expected: DateTime<Utc>) -> Result<Zone> {
        let _guard = self.commit_lock.lock().await;
        let current: Option<Zone> = self.get_json(ZONES, &zone.name).await?;
        match current {
            None => Err(Error::Conflict(format!("Zone '{}' was deleted", zone.name))),
            Some(current) if current.updated_at != expected => Err(Error::Conflict(format!(
                "Zone '{}' was modified concurrently",
                zone.name
            ))),
            Some(_) => self.commit_zone(zone, ZoneEventKind::Updated).await,
        }
    }

    // Caller holds the commit lock.
    async fn commit_zone(&self, zone: &Zone, kind: ZoneEventKind) -> Result<Zone> {
        let mut zone = zone.clone();
        zone.updated_at = Utc::now();
        self.put_json(ZONES, &zone.name, &zone).await?;

        info!(zone = %zone.name, %kind, "Zone committed");
        // no subscribers is fine
        let _ = self.events.send(ZoneEvent {
            zone: zone.clone(),
            kind,
        });
        Ok(zone)
    }

    pub async fn find_zone(&self, name: &str) -> Result<Option<Zone>> {
        self.get_json(ZONES, name).await
    }

    /// Like [`Self::find_zone`] but missing zones are an error
    pub async fn get_zone(&self, name: &str) -> Result<Zone> {
        self.find_zone(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Zone '{}'", name)))
    }

    pub async fn list_zones(&self, prefix: &str) -> Result<Vec<Zone>> {
        load_all(self.store.as_ref(), ZONES, prefix).await
    }

    /// Remove a zone; watchers see its last state with `Deleted`
    pub async fn delete_zone(&self, name: &str) -> Result<bool> {
        let _guard = self.commit_lock.lock().await;
        let existing: Option<Zone> = self.get_json(ZONES, name).await?;
        let Some(zone) = existing else {
            return Ok(false);
        };

        self.store.delete(&key(ZONES, name)).await?;
        info!(zone = %name, "Zone deleted");
        let _ = self.events.send(ZoneEvent {
            zone,
            kind: ZoneEventKind::Deleted,
        });
        Ok(true)
    }

    /// Subscribe to zone changes committed from now on
    pub async fn watch(&self, cancel: CancellationToken) -> Result<ZoneWatch> {
        // No commit can slip between the subscription and the snapshot.
        let _guard = self.commit_lock.lock().await;
        let rx = self.events.subscribe();
        let snapshot = load_all(self.store.as_ref(), ZONES, "").await?;
        Ok(ZoneWatch::new(rx, self.store.clone(), cancel, snapshot))
    }

    /// Run `callback` for each change until it returns `false` or the watch is cancelled
    pub async fn watch_with<F>(&self, cancel: CancellationToken, callback: F) -> Result<WatchHandle>
    where
        F: FnMut(ZoneEvent) -> bool + Send + 'static,
    {
        Ok(WatchHandle::spawn(self.watch(cancel).await?, callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn memory_repo() -> CertificateRepository {
        CertificateRepository::new(Arc::new(MemoryStore::new()))
    }

    fn zone(name: &str) -> Zone {
        Zone::new(name, IssuanceMode::SelfSigned { issuer: "ca".into() })
    }

    #[tokio::test]
    async fn test_zone_crud() {
        let repo = memory_repo();
        repo.save_zone(&zone("a.test")).await.unwrap();
        repo.save_zone(&zone("b.test")).await.unwrap();

        assert!(repo.find_zone("a.test").await.unwrap().is_some());
        assert!(matches!(repo.get_zone("c.test").await, Err(Error::NotFound(_))));
        assert_eq!(repo.list_zones("").await.unwrap().len(), 2);
        assert_eq!(repo.list_zones("b").await.unwrap().len(), 1);

        assert!(repo.delete_zone("a.test").await.unwrap());
        assert!(!repo.delete_zone("a.test").await.unwrap());
        assert_eq!(repo.list_zones("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_zone_save() {
        let repo = memory_repo();
        repo.save_zone(&zone("a.test")).await.unwrap();
        let read = repo.get_zone("a.test").await.unwrap();

        let mut changed = read.clone();
        changed.last_error = Some("first".into());
        let committed = repo.save_zone_if(&changed, read.updated_at).await.unwrap();
        assert!(committed.updated_at >= read.updated_at);

        // stale read
        changed.last_error = Some("second".into());
        assert!(matches!(
            repo.save_zone_if(&changed, read.updated_at).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(repo.get_zone("a.test").await.unwrap().last_error.as_deref(), Some("first"));

        // deleted zones are not brought back
        repo.delete_zone("a.test").await.unwrap();
        assert!(matches!(
            repo.save_zone_if(&committed, committed.updated_at).await,
            Err(Error::Conflict(_))
        ));
        assert!(repo.find_zone("a.test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_self_signer_rejects_existing_name() {
        let repo = memory_repo();
        let signer = SelfSigner {
            name: "ca".into(),
            nodes: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.insert_self_signer(&signer).await.unwrap();
        assert!(matches!(
            repo.insert_self_signer(&signer).await,
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(repo.list_self_signers("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_account_credentials_are_immutable() {
        let repo = memory_repo();
        let account = AcmeAccount {
            email: "ops@example.test".into(),
            registration: AcmeResource::default(),
            credentials: serde_json::json!({"key": "one"}),
            created_at: Utc::now(),
        };
        repo.save_acme_account(&account).await.unwrap();
        // identical re-save is fine
        repo.save_acme_account(&account).await.unwrap();

        let mut changed = account.clone();
        changed.credentials = serde_json::json!({"key": "two"});
        assert!(matches!(
            repo.save_acme_account(&changed).await,
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(repo.list_acme_accounts("ops").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_delivers_in_commit_order() {
        let repo = memory_repo();
        let cancel = CancellationToken::new();
        let mut watch = repo.watch(cancel.clone()).await.unwrap();

        repo.save_zone(&zone("a.test")).await.unwrap();
        repo.save_zone(&zone("a.test")).await.unwrap();
        repo.delete_zone("a.test").await.unwrap();

        let kinds: Vec<_> = [
            watch.next().await.unwrap(),
            watch.next().await.unwrap(),
            watch.next().await.unwrap(),
        ]
        .iter()
        .map(|e| e.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![ZoneEventKind::Created, ZoneEventKind::Updated, ZoneEventKind::Deleted]
        );

        cancel.cancel();
        assert!(watch.next().await.is_none());
    }

    async fn flood(repo: &CertificateRepository, name: &str) {
        for i in 0..(WATCH_BUFFER + 10) {
            let mut z = zone(name);
            z.last_error = Some(format!("attempt {}", i));
            repo.save_zone(&z).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_lagging_watcher_is_resynchronized() {
        let repo = memory_repo();
        let mut watch = repo.watch(CancellationToken::new()).await.unwrap();

        flood(&repo, "busy.test").await;

        let first = watch.next().await.unwrap();
        assert_eq!(first.kind, ZoneEventKind::Created);
        assert_eq!(
            first.zone.last_error.as_deref(),
            Some(format!("attempt {}", WATCH_BUFFER + 9).as_str())
        );

        // later commits are delivered normally
        repo.delete_zone("busy.test").await.unwrap();
        let next = watch.next().await.unwrap();
        assert_eq!(next.kind, ZoneEventKind::Deleted);
        assert_eq!(next.zone.name, "busy.test");
    }

    #[tokio::test]
    async fn test_lagging_watcher_sees_deletions() {
        let repo = memory_repo();
        repo.save_zone(&zone("gone.test")).await.unwrap();
        repo.save_zone(&zone("kept.test")).await.unwrap();
        let mut watch = repo.watch(CancellationToken::new()).await.unwrap();

        repo.delete_zone("gone.test").await.unwrap();
        flood(&repo, "busy.test").await;

        let deleted = watch.next().await.unwrap();
        assert_eq!(deleted.kind, ZoneEventKind::Deleted);
        assert_eq!(deleted.zone.name, "gone.test");

        let created = watch.next().await.unwrap();
        assert_eq!(created.kind, ZoneEventKind::Created);
        assert_eq!(created.zone.name, "busy.test");

        // kept.test is unchanged, so nothing else is pending
        repo.save_zone(&zone("late.test")).await.unwrap();
        let late = watch.next().await.unwrap();
        assert_eq!(late.zone.name, "late.test");
    }

    #[tokio::test]
    async fn test_watch_with_callback_stops() {
        let repo = memory_repo();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = repo
            .watch_with(CancellationToken::new(), move |event| {
                let _ = tx.send(event.zone.name.clone());
                false
            })
            .await
            .unwrap();

        repo.save_zone(&zone("a.test")).await.unwrap();
        repo.save_zone(&zone("b.test")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("a.test"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_file_backed_repository() {
        let dir = tempdir().unwrap();
        let repo = CertificateRepository::new(Arc::new(FileStore::new(dir.path())));
        repo.save_zone(&zone("a.test")).await.unwrap();

        let reopened = CertificateRepository::new(Arc::new(FileStore::new(dir.path())));
        let loaded = reopened.get_zone("a.test").await.unwrap();
        assert_eq!(loaded.name, "a.test");
    }
}
