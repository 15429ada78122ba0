use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a client may go without a request before it counts as closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct ClientEntry {
    controller: Option<String>,
    last_seen: Instant,
}

/// Pages known to the host and the generation currently controlling each.
///
/// The host never hears a page close, so a client that stays quiet for
/// longer than the idle timeout is treated as gone.
pub struct Clients {
    entries: RwLock<HashMap<String, ClientEntry>>,
    idle_timeout: Duration,
}

impl Default for Clients {
    fn default() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn is_live(&self, entry: &ClientEntry, now: Instant) -> bool {
        now.duration_since(entry.last_seen) < self.idle_timeout
    }

    /// Record activity from a client. On first sight it is controlled by
    /// `controller` (the active generation at that moment); known clients
    /// keep their controller.
    pub fn observe(&self, client: &str, controller: Option<&str>) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(client) {
            Some(entry) => entry.last_seen = now,
            None => {
                entries.insert(
                    client.to_string(),
                    ClientEntry {
                        controller: controller.map(str::to_string),
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// A client went away.
    pub fn release(&self, client: &str) -> bool {
        self.entries.write().remove(client).is_some()
    }

    /// Forget every client idle for longer than the timeout. Returns how many
    /// were dropped.
    pub fn expire_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| self.is_live(entry, now));
        let expired = before - entries.len();
        if expired > 0 {
            tracing::debug!(expired, remaining = entries.len(), "idle clients expired");
        }
        expired
    }

    /// Take control of every known client for `generation`. Returns how many
    /// changed controller.
    pub fn claim(&self, generation: &str) -> usize {
        let mut entries = self.entries.write();
        let mut claimed = 0;
        for entry in entries.values_mut() {
            if entry.controller.as_deref() != Some(generation) {
                entry.controller = Some(generation.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    pub fn controller_of(&self, client: &str) -> Option<String> {
        self.entries
            .read()
            .get(client)
            .and_then(|entry| entry.controller.clone())
    }

    /// Number of live clients controlled by `generation`. Idle clients are
    /// not counted even before they are expired.
    pub fn controlled_by(&self, generation: &str) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| self.is_live(entry, now))
            .filter(|entry| entry.controller.as_deref() == Some(generation))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_keeps_first_controller() {
        let clients = Clients::new();
        clients.observe("tab-1", None);
        clients.observe("tab-1", Some("v1"));
        assert_eq!(clients.controller_of("tab-1"), None);
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn claim_takes_every_client() {
        let clients = Clients::new();
        clients.observe("tab-1", None);
        clients.observe("tab-2", Some("v1"));
        clients.observe("tab-3", Some("v2"));

        assert_eq!(clients.claim("v2"), 2);
        assert_eq!(clients.controlled_by("v2"), 3);
        assert_eq!(clients.controlled_by("v1"), 0);
        assert_eq!(clients.claim("v2"), 0);
    }

    #[test]
    fn release_forgets_client() {
        let clients = Clients::new();
        clients.observe("tab-1", Some("v1"));
        assert!(clients.release("tab-1"));
        assert!(!clients.release("tab-1"));
        assert!(clients.is_empty());
    }

    #[test]
    fn idle_clients_stop_counting_and_expire() {
        let clients = Clients::with_idle_timeout(Duration::from_millis(20));
        clients.observe("10.0.0.1", Some("v1"));
        clients.observe("10.0.0.2", Some("v1"));
        assert_eq!(clients.controlled_by("v1"), 2);

        std::thread::sleep(Duration::from_millis(40));
        clients.observe("10.0.0.2", Some("v1")); // still active

        assert_eq!(clients.controlled_by("v1"), 1);
        assert_eq!(clients.expire_idle(), 1);
        assert_eq!(clients.len(), 1);
        assert_eq!(clients.controller_of("10.0.0.2").as_deref(), Some("v1"));
        assert!(clients.controller_of("10.0.0.1").is_none());
    }
}
