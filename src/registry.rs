//! Process-wide table of live and recently-closed rover sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::geo::GpggaFix;

/// Default retention window for closed sessions: seven days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default interval between sweeps: six hours.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Last known position of a rover, as parsed from its most recent GPGGA.
#[derive(Clone, PartialEq, Debug)]
pub struct LastPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub fix_quality: u8,
    pub satellites: u8,
}

impl From<&GpggaFix> for LastPosition {
    fn from(fix: &GpggaFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            fix_quality: fix.fix_quality,
            satellites: fix.satellites,
        }
    }
}

/// A point-in-time snapshot of a rover session, as seen by the admin
/// collaborator.
#[derive(Clone, PartialEq, Debug)]
pub struct RoverSessionSnapshot {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub connected_at: SystemTime,
    pub disconnected_at: Option<SystemTime>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_position: Option<LastPosition>,
    pub bound_mount_point: Option<String>,
    pub active: bool,
}

impl RoverSessionSnapshot {
    pub fn new(id: Uuid, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: SystemTime::now(),
            disconnected_at: None,
            bytes_sent: 0,
            bytes_received: 0,
            last_position: None,
            bound_mount_point: None,
            active: true,
        }
    }

    fn retention_anchor(&self) -> SystemTime {
        self.disconnected_at.unwrap_or(self.connected_at)
    }
}

/// Partial update merged into an existing entry by [`ConnectionRegistry::update`].
#[derive(Clone, Default, Debug)]
pub struct SessionDelta {
    pub bytes_sent_delta: u64,
    pub bytes_received_delta: u64,
    pub last_position: Option<LastPosition>,
    pub bound_mount_point: Option<Option<String>>,
}

/// Concurrency-safe mapping from session id to session snapshot. Many
/// writers (sessions updating their own entry, the sweeper deleting
/// expired ones), many readers (the admin collaborator).
pub struct ConnectionRegistry {
    sessions: DashMap<Uuid, RoverSessionSnapshot>,
    retention: Duration,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            retention,
        }
    }

    /// Register a newly-accepted session.
    pub fn track(&self, id: Uuid, initial: RoverSessionSnapshot) {
        self.sessions.insert(id, initial);
    }

    /// Merge a delta into an existing entry. A no-op if the id is unknown
    /// (e.g. the entry already aged out of the window).
    pub fn update(&self, id: Uuid, delta: SessionDelta) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.bytes_sent += delta.bytes_sent_delta;
            entry.bytes_received += delta.bytes_received_delta;
            if let Some(pos) = delta.last_position {
                entry.last_position = Some(pos);
            }
            if let Some(bound) = delta.bound_mount_point {
                entry.bound_mount_point = bound;
            }
        }
    }

    /// Mark a session closed.
    pub fn mark_closed(&self, id: Uuid) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.active = false;
            entry.disconnected_at = Some(SystemTime::now());
        }
    }

    /// Snapshot of a single session.
    pub fn get(&self, id: Uuid) -> Option<RoverSessionSnapshot> {
        self.sessions.get(&id).map(|e| e.clone())
    }

    /// Snapshot of every tracked session (live and closed, within the
    /// retention window), for the admin collaborator.
    pub fn list(&self) -> Vec<RoverSessionSnapshot> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.active).count()
    }

    /// Remove entries whose retention anchor is older than the
    /// configured window. Returns the ids removed so the caller can
    /// delete any per-session auxiliary artifacts (e.g. NMEA log files).
    pub fn sweep(&self, now: SystemTime) -> Vec<Uuid> {
        let mut expired = Vec::new();
        self.sessions.retain(|id, session| {
            let anchor = session.retention_anchor();
            let age = now.duration_since(anchor).unwrap_or(Duration::ZERO);
            let keep = session.active || age < self.retention;
            if !keep {
                expired.push(*id);
            }
            keep
        });
        expired
    }

    /// Run a periodic sweep until `shutdown` resolves.
    pub async fn run_sweep_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.sweep(SystemTime::now());
                    if !expired.is_empty() {
                        info!("registry sweep removed {} expired session(s)", expired.len());
                        for id in expired {
                            debug!("expired session {} removed from registry", id);
                        }
                    }
                },
                _ = shutdown.recv() => {
                    debug!("registry sweep loop exiting on shutdown signal");
                    break;
                }
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12345)
    }

    #[test]
    fn track_then_get_roundtrips() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.track(id, RoverSessionSnapshot::new(id, addr()));
        let snap = registry.get(id).unwrap();
        assert!(snap.active);
        assert_eq!(snap.bytes_sent, 0);
    }

    #[test]
    fn update_merges_deltas() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.track(id, RoverSessionSnapshot::new(id, addr()));

        registry.update(
            id,
            SessionDelta {
                bytes_sent_delta: 100,
                bytes_received_delta: 20,
                last_position: None,
                bound_mount_point: Some(Some("A".to_string())),
            },
        );
        registry.update(
            id,
            SessionDelta {
                bytes_sent_delta: 50,
                ..Default::default()
            },
        );

        let snap = registry.get(id).unwrap();
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.bytes_received, 20);
        assert_eq!(snap.bound_mount_point.as_deref(), Some("A"));
    }

    #[test]
    fn mark_closed_sets_timestamp() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.track(id, RoverSessionSnapshot::new(id, addr()));
        registry.mark_closed(id);
        let snap = registry.get(id).unwrap();
        assert!(!snap.active);
        assert!(snap.disconnected_at.is_some());
    }

    #[test]
    fn sweep_removes_only_stale_closed_sessions() {
        let registry = ConnectionRegistry::with_retention(Duration::from_secs(60));
        let id_stale = Uuid::new_v4();
        let id_fresh = Uuid::new_v4();
        let id_active = Uuid::new_v4();

        let mut stale = RoverSessionSnapshot::new(id_stale, addr());
        stale.active = false;
        stale.disconnected_at = Some(SystemTime::now() - Duration::from_secs(120));
        registry.track(id_stale, stale);

        let mut fresh = RoverSessionSnapshot::new(id_fresh, addr());
        fresh.active = false;
        fresh.disconnected_at = Some(SystemTime::now());
        registry.track(id_fresh, fresh);

        registry.track(id_active, RoverSessionSnapshot::new(id_active, addr()));

        let expired = registry.sweep(SystemTime::now());
        assert_eq!(expired, vec![id_stale]);
        assert!(registry.get(id_stale).is_none());
        assert!(registry.get(id_fresh).is_some());
        assert!(registry.get(id_active).is_some());
    }
}
