use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::supervisor::Supervisor;

/// Delay before reconnecting a dropped inventory watch.
const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Cadence of the periodic inventory snapshot flush.
const SNAPSHOT_FLUSH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// One server as known to the inventory source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    /// Stable logical name.
    pub name: String,
    /// BMC network address.
    pub bmc_address: String,
    /// Boot interface MAC, when known.
    #[serde(default)]
    pub boot_mac: Option<String>,
    /// Per-server BMC username; empty falls back to process defaults.
    #[serde(default)]
    pub username: String,
    /// Per-server BMC password; empty falls back to process defaults.
    #[serde(default)]
    pub password: String,
    /// Reachability hint from the source.
    #[serde(default)]
    pub powered_on: bool,
}

/// Watch event kinds from the inventory source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryEventKind {
    /// A server appeared.
    Added,
    /// A server's attributes changed.
    Modified,
    /// The source claims the server is gone. Advisory only: the backing
    /// object store is replicated and emits spurious deletes, so removal
    /// happens exclusively through a full list reconcile.
    Deleted,
}

/// One change notification from the inventory source.
#[derive(Debug, Clone)]
pub struct InventoryEvent {
    /// What happened.
    pub kind: InventoryEventKind,
    /// The server the event concerns.
    pub host: HostRecord,
}

/// A source of inventory state: a full listing plus a long-lived watch.
pub trait InventorySource: Send + Sync {
    /// Fetch the current full inventory.
    fn list<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Vec<HostRecord>>> + Send + 'a>>;

    /// Stream change events into `tx` until the source disconnects.
    fn watch<'a>(
        &'a self,
        tx: mpsc::Sender<InventoryEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// In-memory inventory with merge semantics tolerant of partial updates.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, HostRecord>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one record. Attribute updates only overwrite with non-empty
    /// values so a source that omits credentials does not erase known ones.
    pub fn apply(&self, record: HostRecord) -> bool {
        if record.bmc_address.is_empty() {
            return false;
        }

        let mut inner = self.inner.write().expect("registry lock");
        match inner.get_mut(&record.name) {
            Some(existing) => {
                let mut changed = false;
                if existing.powered_on != record.powered_on {
                    existing.powered_on = record.powered_on;
                    changed = true;
                }
                if let Some(mac) = record.boot_mac.as_ref()
                    && existing.boot_mac.as_ref() != Some(mac)
                {
                    existing.boot_mac = Some(mac.clone());
                    changed = true;
                }
                if !record.username.is_empty() && existing.username != record.username {
                    existing.username = record.username;
                    changed = true;
                }
                if !record.password.is_empty() && existing.password != record.password {
                    existing.password = record.password;
                    changed = true;
                }
                changed
            }
            None => {
                info!(server = %record.name, address = %record.bmc_address, "discovered server");
                inner.insert(record.name.clone(), record);
                true
            }
        }
    }

    /// Apply a watch event. DELETEs are advisory and ignored; removal only
    /// happens through [`Registry::reconcile`].
    pub fn apply_event(&self, event: &InventoryEvent) -> bool {
        match event.kind {
            InventoryEventKind::Added | InventoryEventKind::Modified => {
                self.apply(event.host.clone())
            }
            InventoryEventKind::Deleted => {
                debug!(server = %event.host.name, "ignoring advisory inventory delete");
                false
            }
        }
    }

    /// Merge a full listing without removing anything.
    pub fn absorb_list(&self, records: Vec<HostRecord>) -> bool {
        let mut changed = false;
        for record in records {
            changed |= self.apply(record);
        }
        changed
    }

    /// Authoritative reconcile: merge `records` and drop every server absent
    /// from them. Returns the removed names.
    pub fn reconcile(&self, records: Vec<HostRecord>) -> Vec<String> {
        let keep: std::collections::HashSet<String> =
            records.iter().map(|r| r.name.clone()).collect();

        self.absorb_list(records);

        let mut inner = self.inner.write().expect("registry lock");
        let removed: Vec<String> = inner
            .keys()
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect();
        for name in &removed {
            inner.remove(name);
            info!(server = %name, "removed server on reconcile");
        }
        removed
    }

    /// Insert a statically configured server; discovery data merges on top.
    pub fn seed(&self, name: &str, host: &str) {
        let mut inner = self.inner.write().expect("registry lock");
        inner.entry(name.to_string()).or_insert_with(|| {
            info!(server = %name, host = %host, "seeded static server");
            HostRecord {
                name: name.to_string(),
                bmc_address: host.to_string(),
                boot_mac: None,
                username: String::new(),
                password: String::new(),
                powered_on: true,
            }
        });
    }

    /// Seed the registry from a cached snapshot without clobbering entries
    /// that already arrived live.
    pub fn absorb(&self, records: HashMap<String, HostRecord>) {
        let mut inner = self.inner.write().expect("registry lock");
        for (name, record) in records {
            inner.entry(name).or_insert(record);
        }
    }

    /// A copy of the current inventory.
    pub fn snapshot(&self) -> HashMap<String, HostRecord> {
        self.inner.read().expect("registry lock").clone()
    }
}

/// Local JSON cache so sessions can start before the source is reachable.
pub struct InventoryCache {
    path: PathBuf,
}

impl InventoryCache {
    /// Cache file lives at `{data_dir}/bmh-cache.json`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("bmh-cache.json"),
        }
    }

    /// Read cached servers; `None` when no usable cache exists.
    pub fn load(&self) -> Option<HashMap<String, HostRecord>> {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, "failed to read inventory cache");
                return None;
            }
        };

        match serde_json::from_slice::<HashMap<String, HostRecord>>(&data) {
            Ok(servers) => {
                info!(servers = servers.len(), "loaded inventory cache");
                Some(servers)
            }
            Err(e) => {
                warn!(error = %e, "failed to parse inventory cache");
                None
            }
        }
    }

    /// Atomically rewrite the cache (temp file + rename).
    pub fn save(&self, servers: &HashMap<String, HostRecord>) {
        let json = match serde_json::to_vec_pretty(servers) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialise inventory cache");
                return;
            }
        };

        if let Some(dir) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            warn!(error = %e, "failed to create cache directory");
            return;
        }

        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, &json) {
            warn!(error = %e, "failed to write inventory cache");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!(error = %e, "failed to move inventory cache into place");
            let _ = std::fs::remove_file(&tmp);
            return;
        }

        debug!(servers = servers.len(), "saved inventory cache");
    }
}

// Wire shapes of the BMH inventory API.

#[derive(Debug, Default, Deserialize)]
struct BareMetalHost {
    #[serde(default)]
    metadata: BmhMetadata,
    #[serde(default)]
    spec: BmhSpec,
    #[serde(default)]
    status: BmhStatus,
}

#[derive(Debug, Default, Deserialize)]
struct BmhMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct BmhSpec {
    #[serde(default)]
    bmc: BmhBmc,
    #[serde(rename = "bootMACAddress", default)]
    boot_mac_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct BmhBmc {
    #[serde(default)]
    address: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct BmhStatus {
    #[serde(rename = "poweredOn", default)]
    powered_on: bool,
}

#[derive(Debug, Deserialize)]
struct BareMetalHostList {
    #[serde(default)]
    items: Vec<BareMetalHost>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: BareMetalHost,
}

impl BareMetalHost {
    fn to_record(&self) -> HostRecord {
        HostRecord {
            name: self.metadata.name.clone(),
            bmc_address: self.spec.bmc.address.clone(),
            boot_mac: (!self.spec.boot_mac_address.is_empty())
                .then(|| self.spec.boot_mac_address.clone()),
            username: self.spec.bmc.username.clone(),
            password: self.spec.bmc.password.clone(),
            powered_on: self.status.powered_on,
        }
    }
}

/// HTTP inventory source: JSON list endpoint plus a line-delimited watch
/// stream, optionally scoped to one namespace.
pub struct HttpInventorySource {
    base_url: String,
    namespace: Option<String>,
    client: reqwest::Client,
    watch_client: reqwest::Client,
}

impl HttpInventorySource {
    /// Source rooted at `base_url`; empty namespace disables scoping.
    pub fn new(base_url: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            namespace: namespace.filter(|n| !n.is_empty()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            // The watch connection is long-lived; no overall timeout.
            watch_client: reqwest::Client::new(),
        }
    }

    fn in_scope(&self, bmh: &BareMetalHost) -> bool {
        match &self.namespace {
            Some(ns) => bmh.metadata.namespace == *ns,
            None => true,
        }
    }
}

impl InventorySource for HttpInventorySource {
    fn list<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Vec<HostRecord>>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/api/v1/baremetalhosts", self.base_url);
            let list: BareMetalHostList = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| crate::error::Error::protocol_owned(e.to_string()))?
                .json()
                .await
                .map_err(|e| crate::error::Error::protocol_owned(e.to_string()))?;

            Ok(list
                .items
                .iter()
                .filter(|b| self.in_scope(b))
                .map(BareMetalHost::to_record)
                .collect())
        })
    }

    fn watch<'a>(
        &'a self,
        tx: mpsc::Sender<InventoryEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/api/v1/baremetalhosts?watch=true", self.base_url);
            let mut resp = self
                .watch_client
                .get(&url)
                .send()
                .await
                .map_err(|e| crate::error::Error::protocol_owned(e.to_string()))?;

            info!("inventory watch connected");

            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = match resp.chunk().await {
                    Ok(Some(c)) => c,
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(crate::error::Error::protocol_owned(e.to_string())),
                };

                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }

                    let event: WatchEvent = match serde_json::from_slice(line) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(error = %e, "failed to decode inventory watch event");
                            continue;
                        }
                    };

                    if !self.in_scope(&event.object) {
                        continue;
                    }

                    let kind = match event.kind.as_str() {
                        "ADDED" => InventoryEventKind::Added,
                        "MODIFIED" => InventoryEventKind::Modified,
                        "DELETED" => InventoryEventKind::Deleted,
                        other => {
                            debug!(kind = %other, "ignoring unknown inventory event type");
                            continue;
                        }
                    };

                    let host = event.object.to_record();
                    if tx
                        .send(InventoryEvent { kind, host })
                        .await
                        .is_err()
                    {
                        return Ok(()); // consumer gone
                    }
                }
            }
        })
    }
}

/// Drives the supervisor from inventory state: starts sessions for powered-on
/// servers, stops powered-off ones, restarts on credential changes, and keeps
/// the cold-start cache current.
pub struct InventorySync {
    source: Arc<dyn InventorySource>,
    registry: Arc<Registry>,
    cache: Option<InventoryCache>,
    supervisor: Supervisor,
}

impl InventorySync {
    /// Wire a source, registry, optional cache, and the supervisor together.
    pub fn new(
        source: Arc<dyn InventorySource>,
        registry: Arc<Registry>,
        cache: Option<InventoryCache>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            source,
            registry,
            cache,
            supervisor,
        }
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run until `shutdown` flips: cold start from cache, initial list fetch,
    /// then the watch loop with 5-second reconnects and a periodic snapshot
    /// flush.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Some(cache) = &self.cache
            && let Some(servers) = cache.load()
        {
            self.registry.absorb(servers);
        }
        self.drive();

        self.refresh().await;

        // Periodic snapshot flush, independent of change traffic.
        {
            let sync = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SNAPSHOT_FLUSH_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = ticker.tick() => sync.flush_cache(),
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.watch_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "inventory watch failed");
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(WATCH_RECONNECT_DELAY) => {}
            }

            info!("reconnecting inventory watch");
            self.refresh().await;
        }

        self.flush_cache();
    }

    /// Fetch the full list and merge it additively.
    pub async fn refresh(&self) {
        match self.source.list().await {
            Ok(records) => {
                self.registry.absorb_list(records);
                self.flush_cache();
                self.drive();
            }
            Err(e) => warn!(error = %e, "failed to fetch inventory list"),
        }
    }

    /// Operator-initiated authoritative reconcile: removes servers absent
    /// from the source listing and stops their sessions.
    pub async fn reconcile_now(&self) -> Result<()> {
        let records = self.source.list().await?;
        let removed = self.registry.reconcile(records);
        for name in removed {
            self.supervisor.stop_session(&name);
        }
        self.flush_cache();
        self.drive();
        Ok(())
    }

    async fn watch_once(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(32);
        let mut watch_fut = std::pin::pin!(self.source.watch(tx));

        let result = loop {
            tokio::select! {
                result = &mut watch_fut => break result,
                event = rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(&event);
                    }
                }
            }
        };

        // Drain anything the stream produced right before ending.
        while let Ok(event) = rx.try_recv() {
            self.handle_event(&event);
        }

        result
    }

    fn handle_event(&self, event: &InventoryEvent) {
        if self.registry.apply_event(event) {
            self.flush_cache();
            self.drive();
        }
    }

    /// Apply inventory state to the supervisor.
    fn drive(&self) {
        for (name, record) in self.registry.snapshot() {
            let running = self.supervisor.has_session(&name);

            if record.powered_on && !running {
                info!(server = %name, address = %record.bmc_address, "starting SOL session");
                self.supervisor.start_session(
                    &name,
                    &record.bmc_address,
                    &record.username,
                    &record.password,
                );
            } else if !record.powered_on && running {
                info!(server = %name, "stopping SOL session (server offline)");
                self.supervisor.stop_session(&name);
            } else if record.powered_on
                && running
                && self
                    .supervisor
                    .credentials_differ(&name, &record.username, &record.password)
            {
                info!(server = %name, "credentials changed, restarting SOL session");
                self.supervisor.stop_session(&name);
                self.supervisor.start_session(
                    &name,
                    &record.bmc_address,
                    &record.username,
                    &record.password,
                );
            }
        }
    }

    fn flush_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.save(&self.registry.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, powered: bool) -> HostRecord {
        HostRecord {
            name: name.to_string(),
            bmc_address: format!("10.0.0.{}", name.len()),
            boot_mac: None,
            username: "user".to_string(),
            password: "pass".to_string(),
            powered_on: powered,
        }
    }

    #[test]
    fn apply_inserts_and_merges() {
        let registry = Registry::new();

        assert!(registry.apply(record("srv", true)));
        // Identical record: no change.
        assert!(!registry.apply(record("srv", true)));

        // Power flip is a change.
        assert!(registry.apply(record("srv", false)));
        assert!(!registry.snapshot()["srv"].powered_on);
    }

    #[test]
    fn empty_attributes_do_not_erase_known_values() {
        let registry = Registry::new();
        registry.apply(record("srv", true));

        let mut partial = record("srv", true);
        partial.username = String::new();
        partial.password = String::new();
        assert!(!registry.apply(partial));

        let snap = registry.snapshot();
        assert_eq!(snap["srv"].username, "user");
        assert_eq!(snap["srv"].password, "pass");
    }

    #[test]
    fn records_without_address_are_ignored() {
        let registry = Registry::new();
        let mut r = record("srv", true);
        r.bmc_address = String::new();
        assert!(!registry.apply(r));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn delete_events_are_advisory() {
        let registry = Registry::new();
        registry.apply(record("srv", true));

        let changed = registry.apply_event(&InventoryEvent {
            kind: InventoryEventKind::Deleted,
            host: record("srv", true),
        });

        assert!(!changed);
        assert!(registry.snapshot().contains_key("srv"));
    }

    #[test]
    fn reconcile_removes_absent_servers() {
        let registry = Registry::new();
        registry.apply(record("keep", true));
        registry.apply(record("drop", true));

        let removed = registry.reconcile(vec![record("keep", true)]);

        assert_eq!(removed, vec!["drop".to_string()]);
        let snap = registry.snapshot();
        assert!(snap.contains_key("keep"));
        assert!(!snap.contains_key("drop"));
    }

    #[test]
    fn seed_does_not_clobber_discovered_entries() {
        let registry = Registry::new();
        registry.apply(record("srv", true));
        registry.seed("srv", "other-host");

        assert_eq!(registry.snapshot()["srv"].bmc_address, "10.0.0.3");
    }

    #[test]
    fn cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InventoryCache::new(dir.path());

        let mut servers = HashMap::new();
        servers.insert("srv".to_string(), record("srv", true));
        cache.save(&servers);

        let loaded = cache.load().expect("cache loads");
        assert_eq!(loaded, servers);
    }

    #[test]
    fn missing_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InventoryCache::new(dir.path().join("nested"));
        assert!(cache.load().is_none());
    }

    #[test]
    fn watch_event_json_decodes() {
        let line = r#"{"type":"MODIFIED","object":{"metadata":{"name":"srvA","namespace":"g11"},"spec":{"bmc":{"address":"10.0.0.10","username":"ADMIN","password":"ADMIN"},"bootMACAddress":"aa:bb:cc:dd:ee:ff"},"status":{"poweredOn":true}}}"#;

        let event: WatchEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.kind, "MODIFIED");

        let record = event.object.to_record();
        assert_eq!(record.name, "srvA");
        assert_eq!(record.bmc_address, "10.0.0.10");
        assert_eq!(record.boot_mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(record.powered_on);
    }
}
