use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Boots kept per server before the oldest is dropped.
const BOOT_HISTORY_CAP: usize = 10;

/// A BIOS banner seen while a boot younger than this is in flight is treated
/// as a redraw of the same boot, not a new one.
const BOOT_ARCHIVE_GUARD_SECS: i64 = 30;

/// A network interface link transition observed during a boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvent {
    /// Interface name as printed on the console.
    pub interface: String,
    /// `"up"` or `"down"`.
    pub event: String,
    /// When the transition was observed.
    pub time: DateTime<Utc>,
}

/// Aggregated link-transition counters for one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    /// Interface name.
    pub interface: String,
    /// Count of observed link-up transitions.
    pub up_count: u32,
    /// Count of observed link-down transitions.
    pub down_count: u32,
}

/// One observed boot, from BIOS banner to OS-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootEvent {
    /// When the BIOS phase was first detected.
    pub start_time: DateTime<Utc>,
    /// When an OS-up pattern closed the boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds from start to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_duration: Option<f64>,
    /// Seconds from log rotation to first console output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_on_delay: Option<f64>,
    /// The rotation that kicked this boot off, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_time: Option<DateTime<Utc>>,
    /// Whether an OS-up pattern was seen.
    pub complete: bool,
    /// OS/image detected during this boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_os: Option<String>,
    /// Link transitions observed during the boot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_events: Vec<NetworkEvent>,
    /// Per-interface transition counters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_stats: Vec<NetworkStats>,
}

/// Everything this process knows about one server's boot lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAnalytics {
    /// Logical server name.
    pub server_name: String,
    /// The boot currently in flight, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_boot: Option<BootEvent>,
    /// Most recent completed or superseded boots, oldest first.
    #[serde(default)]
    pub boot_history: Vec<BootEvent>,
    /// Last time console output was processed for this server.
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    /// When the OS was last observed up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_up_since: Option<DateTime<Utc>>,
    /// Count of boots started since tracking began.
    #[serde(default)]
    pub total_reboots: u32,
    /// Most recently detected OS/image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_os: Option<String>,
    /// Hostname detected from the login prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    // Pending rotation tracking; runtime-only.
    #[serde(skip)]
    pending_rotation: Option<DateTime<Utc>>,
    #[serde(skip)]
    rotation_delay: Option<f64>,
    #[serde(skip)]
    rotation_time: Option<DateTime<Utc>>,
}

impl ServerAnalytics {
    fn new(name: &str) -> Self {
        Self {
            server_name: name.to_string(),
            current_boot: None,
            boot_history: Vec::new(),
            last_seen: Utc::now(),
            os_up_since: None,
            total_reboots: 0,
            current_os: None,
            hostname: None,
            pending_rotation: None,
            rotation_delay: None,
            rotation_time: None,
        }
    }
}

struct OsDetector {
    name: &'static str,
    pattern: Regex,
}

/// Regex-driven boot state machine over cleaned console text, persisted to
/// `analytics.json`.
pub struct Analytics {
    servers: RwLock<HashMap<String, ServerAnalytics>>,
    bios_substrings: Vec<&'static str>,
    bios_patterns: Vec<Regex>,
    os_patterns: Vec<Regex>,
    os_detectors: Vec<OsDetector>,
    host_pattern: Regex,
    net_up_pattern: Regex,
    net_down_pattern: Regex,
    data_path: Option<PathBuf>,
    persist_tx: mpsc::UnboundedSender<()>,
    persist_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

/// BIOS boot start patterns.
const BIOS_PATTERNS: &[&str] = &[
    r"American Megatrends",
    r"Press <DEL> to run Setup",
    r"Press DEL to run Setup",
    r"BIOS Date:",
    r"Supermicro",
    r"Version \d+\.\d+\.\d+.*Copyright",
    r"Intel\(R\) Boot Agent",
    r"CLIENT MAC ADDR:",
    r"PXE-",
    r"PXE->",
    r"iPXE initialising",
    r"iPXE \d+\.\d+",
    r"Open Source Network Boot Firmware",
    r"Booting baremetalservices",
    r"UNDI code segment",
    r"free base memory after PXE",
];

/// OS up patterns - indicate boot complete.
const OS_PATTERNS: &[&str] = &[
    r"login:",
    r"Welcome to",
    r"Started .*Service",
    r"Reached target",
    r"systemd.*Startup finished",
    r"Bare Metal Services Ready",
    r"SSH:.*port 22",
];

/// OS/image detection table; first match wins.
const OS_DETECTORS: &[(&str, &str)] = &[
    ("Bare Metal Services", r"Bare Metal Services Ready"),
    ("OpenShift", r"openshift|Red Hat OpenShift|CoreOS"),
    ("Kubernetes", r"kubelet|kube-apiserver|k3s|k8s"),
    ("Docker", r"dockerd|Docker Engine"),
    ("VMware ESXi", r"VMware ESXi|vmkernel"),
    ("Ubuntu", r"Ubuntu \d+\.\d+"),
    ("Debian", r"Debian GNU/Linux"),
    ("CentOS", r"CentOS Linux|CentOS Stream"),
    ("Rocky Linux", r"Rocky Linux"),
    ("AlmaLinux", r"AlmaLinux"),
    ("Red Hat Enterprise Linux", r"Red Hat Enterprise Linux"),
    ("Fedora", r"Fedora release"),
    ("Alpine Linux", r"Alpine Linux"),
    ("Arch Linux", r"Arch Linux"),
    ("FreeBSD", r"FreeBSD"),
];

impl Analytics {
    /// Load persisted state from `data_path` (when given) and compile the
    /// pattern tables. `extra_bios_patterns` come from configuration and are
    /// matched case-insensitively alongside the built-in set.
    pub fn new(data_path: Option<PathBuf>, extra_bios_patterns: &[String]) -> Self {
        let compile = |p: &str| Regex::new(&format!("(?i){p}"));

        let mut bios_patterns: Vec<Regex> =
            BIOS_PATTERNS.iter().filter_map(|p| compile(p).ok()).collect();
        for p in extra_bios_patterns {
            match compile(&regex::escape(p)) {
                Ok(re) => bios_patterns.push(re),
                Err(e) => warn!(pattern = %p, error = %e, "skipping bad boot pattern"),
            }
        }

        let os_patterns = OS_PATTERNS.iter().filter_map(|p| compile(p).ok()).collect();

        let os_detectors = OS_DETECTORS
            .iter()
            .filter_map(|(name, p)| {
                compile(p).ok().map(|pattern| OsDetector { name, pattern })
            })
            .collect();

        // Hostname from common login prompts.
        let host_pattern = Regex::new(r"(?m)^([a-zA-Z0-9][a-zA-Z0-9\-]{0,62}) login:").unwrap();

        // Network interface up/down. Common shapes: "eth0: link up",
        // "enp0s31f6: link down", "NIC Link is Up ... eth0".
        let net_up_pattern = Regex::new(
            r"(?i)([a-z]{2,}[0-9]+[a-z0-9]*):?\s+(?:link\s+)?(?:is\s+)?up|NIC Link is Up.*?([a-z]{2,}[0-9]+)",
        )
        .unwrap();
        let net_down_pattern = Regex::new(
            r"(?i)([a-z]{2,}[0-9]+[a-z0-9]*):?\s+(?:link\s+)?(?:is\s+)?down|NIC Link is Down.*?([a-z]{2,}[0-9]+)",
        )
        .unwrap();

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let analytics = Self {
            servers: RwLock::new(HashMap::new()),
            bios_substrings: vec![
                "ipxe",
                "pxe->",
                "pxe-e",
                "client mac addr",
                "boot agent",
                "undi code",
                "bios date",
                "american megatrends",
                "supermicro",
                "booting baremetalservices",
                "network boot",
            ],
            bios_patterns,
            os_patterns,
            os_detectors,
            host_pattern,
            net_up_pattern,
            net_down_pattern,
            data_path,
            persist_tx,
            persist_rx: Mutex::new(Some(persist_rx)),
        };

        analytics.load();
        analytics
    }

    /// Start the persistence task: every state change queues one atomic
    /// rewrite of `analytics.json`. Call once, inside a tokio runtime.
    pub fn spawn_persister(self: Arc<Self>) {
        let Some(mut rx) = self.persist_rx.lock().expect("persist lock").take() else {
            return;
        };
        let this = self;
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Coalesce a burst of changes into one write.
                while rx.try_recv().is_ok() {}
                this.save();
            }
        });
    }

    fn mark_changed(&self) {
        let _ = self.persist_tx.send(());
    }

    /// Feed a chunk of cleaned console text through the state machine.
    pub fn process_text(&self, server_name: &str, text: &str) {
        let mut servers = self.servers.write().expect("analytics lock");
        let server = servers
            .entry(server_name.to_string())
            .or_insert_with(|| ServerAnalytics::new(server_name));

        let now = Utc::now();
        server.last_seen = now;
        let mut changed = false;

        // Consume a pending rotation on the first console output after it.
        if let Some(pending) = server.pending_rotation.take() {
            let delay = (now - pending).num_milliseconds() as f64 / 1000.0;
            server.rotation_delay = Some(delay);
            server.rotation_time = Some(pending);
            info!(server = server_name, delay_secs = delay, "power-on delay");
        }

        if self.matches_bios(text) {
            debug!(
                server = server_name,
                tracking = server.current_boot.is_some(),
                "BIOS phase detected"
            );

            // An in-flight boot means this is a reboot - archive the old boot.
            // The age guard keeps multiple BIOS banners within one boot from
            // creating duplicates.
            if let Some(current) = server.current_boot.as_ref() {
                let elapsed = (now - current.start_time).num_seconds();
                if elapsed > BOOT_ARCHIVE_GUARD_SECS {
                    debug!(
                        server = server_name,
                        complete = current.complete,
                        "archiving previous boot"
                    );
                    let archived = server.current_boot.take().expect("boot present");
                    server.boot_history.push(archived);
                    if server.boot_history.len() > BOOT_HISTORY_CAP {
                        server.boot_history.remove(0);
                    }
                    server.os_up_since = None;
                    changed = true;
                }
            }

            if server.current_boot.is_none() {
                info!(
                    server = server_name,
                    total_reboots = server.total_reboots + 1,
                    "tracking new boot"
                );
                let mut boot = BootEvent {
                    start_time: now,
                    end_time: None,
                    boot_duration: None,
                    power_on_delay: None,
                    rotation_time: None,
                    complete: false,
                    detected_os: None,
                    network_events: Vec::new(),
                    network_stats: Vec::new(),
                };
                if let Some(rotation) = server.rotation_time.take() {
                    boot.rotation_time = Some(rotation);
                    boot.power_on_delay = server.rotation_delay.take();
                }
                server.current_boot = Some(boot);
                server.total_reboots += 1;
                changed = true;
            }
        }

        if self.matches_os(text) {
            match server.current_boot.as_mut() {
                Some(boot) if !boot.complete => {
                    boot.end_time = Some(now);
                    boot.boot_duration =
                        Some((now - boot.start_time).num_milliseconds() as f64 / 1000.0);
                    boot.complete = true;
                    server.os_up_since = Some(now);
                    changed = true;
                }
                _ => {
                    // OS is up but we never saw the boot (service started late).
                    if server.os_up_since.is_none() {
                        server.os_up_since = Some(now);
                        changed = true;
                    }
                }
            }
        }

        if let Some(detected) = self.detect_os(text)
            && server.current_os.as_deref() != Some(detected)
        {
            server.current_os = Some(detected.to_string());
            if let Some(boot) = server.current_boot.as_mut() {
                boot.detected_os = Some(detected.to_string());
            }
            changed = true;
        }

        if let Some(hostname) = self.detect_hostname(text)
            && server.hostname.as_deref() != Some(hostname)
        {
            server.hostname = Some(hostname.to_string());
            changed = true;
        }

        self.track_network_events(server, text, now);

        if changed {
            drop(servers);
            self.mark_changed();
        }
    }

    /// Mark a rotation; the next console chunk computes the power-on delay.
    pub fn record_rotation(&self, server_name: &str) {
        let mut servers = self.servers.write().expect("analytics lock");
        let server = servers
            .entry(server_name.to_string())
            .or_insert_with(|| ServerAnalytics::new(server_name));

        let now = Utc::now();
        server.pending_rotation = Some(now);
        info!(server = server_name, at = %now.to_rfc3339(), "recorded rotation");
    }

    /// Snapshot for one server (empty record when unknown).
    pub fn server(&self, server_name: &str) -> ServerAnalytics {
        let servers = self.servers.read().expect("analytics lock");
        servers
            .get(server_name)
            .cloned()
            .unwrap_or_else(|| ServerAnalytics::new(server_name))
    }

    /// Snapshot of every tracked server.
    pub fn all(&self) -> HashMap<String, ServerAnalytics> {
        self.servers.read().expect("analytics lock").clone()
    }

    fn matches_bios(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        for p in &self.bios_substrings {
            if lower.contains(p) {
                return true;
            }
        }
        self.bios_patterns.iter().any(|p| p.is_match(text))
    }

    fn matches_os(&self, text: &str) -> bool {
        self.os_patterns.iter().any(|p| p.is_match(text))
    }

    fn detect_os(&self, text: &str) -> Option<&'static str> {
        self.os_detectors
            .iter()
            .find(|d| d.pattern.is_match(text))
            .map(|d| d.name)
    }

    fn detect_hostname<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.host_pattern
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    fn track_network_events(&self, server: &mut ServerAnalytics, text: &str, now: DateTime<Utc>) {
        if server.current_boot.is_none() {
            return;
        }

        let mut transitions: Vec<(String, &'static str)> = Vec::new();
        for caps in self.net_up_pattern.captures_iter(text) {
            if let Some(iface) = first_group(&caps) {
                transitions.push((iface.to_string(), "up"));
            }
        }
        for caps in self.net_down_pattern.captures_iter(text) {
            if let Some(iface) = first_group(&caps) {
                transitions.push((iface.to_string(), "down"));
            }
        }

        let Some(boot) = server.current_boot.as_mut() else {
            return;
        };
        for (iface, event) in transitions {
            boot.network_events.push(NetworkEvent {
                interface: iface.clone(),
                event: event.to_string(),
                time: now,
            });
            update_network_stats(boot, &iface, event);
        }
    }

    fn file_path(&self) -> Option<PathBuf> {
        self.data_path.as_ref().map(|p| p.join("analytics.json"))
    }

    /// Serialise the full map and rewrite `analytics.json` atomically.
    pub fn save(&self) {
        let Some(path) = self.file_path() else {
            return;
        };

        #[derive(Serialize)]
        struct Persisted<'a> {
            servers: &'a HashMap<String, ServerAnalytics>,
        }

        let servers = self.servers.read().expect("analytics lock");
        let json = match serde_json::to_vec_pretty(&Persisted { servers: &servers }) {
            Ok(j) => j,
            Err(e) => {
                error!(error = %e, "failed to serialise analytics");
                return;
            }
        };
        drop(servers);

        if let Some(dir) = path.parent()
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            error!(error = %e, "failed to create analytics directory");
            return;
        }

        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, &json) {
            error!(error = %e, "failed to write analytics");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            error!(error = %e, "failed to move analytics into place");
            let _ = std::fs::remove_file(&tmp);
        }
    }

    fn load(&self) {
        let Some(path) = self.file_path() else {
            return;
        };

        #[derive(Deserialize)]
        struct Persisted {
            servers: HashMap<String, ServerAnalytics>,
        }

        let json = match std::fs::read(&path) {
            Ok(j) => j,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                error!(error = %e, "failed to read analytics");
                return;
            }
        };

        match serde_json::from_slice::<Persisted>(&json) {
            Ok(persisted) => {
                let count = persisted.servers.len();
                *self.servers.write().expect("analytics lock") = persisted.servers;
                info!(servers = count, "loaded analytics");
            }
            Err(e) => error!(error = %e, "failed to parse analytics"),
        }
    }
}

fn first_group<'t>(caps: &regex::Captures<'t>) -> Option<&'t str> {
    (1..caps.len()).find_map(|i| caps.get(i)).map(|m| m.as_str())
}

fn update_network_stats(boot: &mut BootEvent, iface: &str, event: &str) {
    let stats = match boot.network_stats.iter_mut().find(|s| s.interface == iface) {
        Some(s) => s,
        None => {
            boot.network_stats.push(NetworkStats {
                interface: iface.to_string(),
                up_count: 0,
                down_count: 0,
            });
            boot.network_stats.last_mut().expect("just pushed")
        }
    };

    if event == "up" {
        stats.up_count += 1;
    } else {
        stats.down_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analytics() -> Analytics {
        Analytics::new(None, &[])
    }

    #[test]
    fn bios_banner_starts_a_boot() {
        let a = analytics();
        a.process_text("srv", "iPXE initialising devices...");

        let s = a.server("srv");
        assert!(s.current_boot.is_some());
        assert_eq!(s.total_reboots, 1);
        assert!(!s.current_boot.unwrap().complete);
    }

    #[test]
    fn repeated_bios_banners_do_not_double_count() {
        let a = analytics();
        a.process_text("srv", "American Megatrends BIOS");
        a.process_text("srv", "PXE-E53: no boot filename");

        let s = a.server("srv");
        assert_eq!(s.total_reboots, 1);
        assert!(s.boot_history.is_empty());
    }

    #[test]
    fn os_up_closes_the_boot() {
        let a = analytics();
        a.process_text("srv", "CLIENT MAC ADDR: 00 11 22 33 44 55");
        a.process_text("srv", "myhost login:");

        let s = a.server("srv");
        let boot = s.current_boot.expect("boot tracked");
        assert!(boot.complete);
        assert!(boot.end_time.is_some());
        assert!(boot.boot_duration.is_some());
        assert!(s.os_up_since.is_some());
        assert_eq!(s.hostname.as_deref(), Some("myhost"));
    }

    #[test]
    fn os_up_without_boot_sets_up_since_only() {
        let a = analytics();
        a.process_text("srv", "Reached target Multi-User System");

        let s = a.server("srv");
        assert!(s.current_boot.is_none());
        assert!(s.os_up_since.is_some());
        assert_eq!(s.total_reboots, 0);
    }

    #[test]
    fn os_detection_first_match_wins() {
        let a = analytics();
        a.process_text("srv", "Supermicro BIOS");
        a.process_text("srv", "Welcome to Ubuntu 22.04 LTS");

        let s = a.server("srv");
        assert_eq!(s.current_os.as_deref(), Some("Ubuntu"));
        assert_eq!(
            s.current_boot.unwrap().detected_os.as_deref(),
            Some("Ubuntu")
        );
    }

    #[test]
    fn rotation_mark_feeds_power_on_delay_into_next_boot() {
        let a = analytics();
        a.record_rotation("srv");
        a.process_text("srv", "iPXE 1.21.1 booting");

        let s = a.server("srv");
        let boot = s.current_boot.expect("boot tracked");
        assert!(boot.rotation_time.is_some());
        let delay = boot.power_on_delay.expect("delay computed");
        assert!(delay >= 0.0);
    }

    #[test]
    fn network_events_tracked_during_boot() {
        let a = analytics();
        a.process_text("srv", "BIOS Date: 01/02/2024");
        a.process_text("srv", "eth0: link up\neth0: link down\neth0: link up");

        let s = a.server("srv");
        let boot = s.current_boot.expect("boot tracked");
        assert_eq!(boot.network_events.len(), 3);
        let stats = &boot.network_stats[0];
        assert_eq!(stats.interface, "eth0");
        assert_eq!(stats.up_count, 2);
        assert_eq!(stats.down_count, 1);
    }

    #[test]
    fn link_events_outside_a_boot_are_ignored() {
        let a = analytics();
        a.process_text("srv", "eth0: link up");
        assert!(a.server("srv").current_boot.is_none());
    }

    #[test]
    fn extra_patterns_extend_the_bios_set() {
        let a = Analytics::new(None, &["CustomBootBanner".to_string()]);
        a.process_text("srv", "** custombootbanner **");
        assert_eq!(a.server("srv").total_reboots, 1);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let a = Analytics::new(Some(dir.path().to_path_buf()), &[]);
            a.process_text("srv", "Supermicro BIOS Date: 01/01/2024");
            a.process_text("srv", "web-01 login:");
            a.save();
        }

        let reloaded = Analytics::new(Some(dir.path().to_path_buf()), &[]);
        let s = reloaded.server("srv");
        assert_eq!(s.total_reboots, 1);
        assert_eq!(s.hostname.as_deref(), Some("web-01"));
        assert!(s.current_boot.expect("boot restored").complete);
    }
}
