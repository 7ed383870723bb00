use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use chanprims_alloc::{AllocError, ChannelAllocator, ChannelMax};
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::negotiate::negotiate_channel_max;

/// A session open on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Channel number carrying the session.
    pub channel: u16,
    /// Optional caller-supplied label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// When the session was opened.
    #[serde(serialize_with = "serialize_unix_seconds")]
    pub opened_at: SystemTime,
}

/// Owns a connection's channel allocator and the sessions opened on it.
///
/// Lock order is always sessions first, allocator second, so a channel opened
/// through the manager gets its session entry before any other manager call
/// can see it. Reserved channels, and channels taken directly through
/// [`SessionManager::allocator`], are allocated without a session entry.
#[derive(Debug)]
pub struct SessionManager {
    name: String,
    reserved: Vec<u16>,
    allocator: Arc<ChannelAllocator>,
    sessions: Mutex<BTreeMap<u16, SessionInfo>>,
}

impl SessionManager {
    /// Create a manager using the configured channel limit as-is.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let channel_max = ChannelMax::from_negotiated(config.channel_max);
        Self::with_channel_max(config, channel_max)
    }

    /// Create a manager after negotiating the limit against the server's proposal.
    pub fn with_negotiated(config: SessionConfig, server_channel_max: u16) -> Result<Self> {
        let channel_max = negotiate_channel_max(config.channel_max, server_channel_max);
        debug!(
            connection = %config.name,
            client = config.channel_max,
            server = server_channel_max,
            negotiated = channel_max.get(),
            "negotiated channel_max"
        );
        Self::with_channel_max(config, channel_max)
    }

    fn with_channel_max(config: SessionConfig, channel_max: ChannelMax) -> Result<Self> {
        config.validate()?;

        let allocator = Arc::new(ChannelAllocator::new(channel_max));
        for &channel in &config.reserved_channels {
            allocator.allocate_specific(channel)?;
        }

        Ok(Self {
            name: config.name,
            reserved: config.reserved_channels,
            allocator,
            sessions: Mutex::new(BTreeMap::new()),
        })
    }

    /// Connection label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channels held for protocol-level use.
    pub fn reserved_channels(&self) -> &[u16] {
        &self.reserved
    }

    /// The connection's allocator.
    pub fn allocator(&self) -> &Arc<ChannelAllocator> {
        &self.allocator
    }

    /// Open a session on the lowest free channel.
    pub fn open(&self, label: Option<&str>) -> Result<u16> {
        let mut sessions = self.lock_sessions();
        let channel = self
            .allocator
            .allocate_next()
            .inspect_err(|err| self.log_alloc_failure(err))?;
        self.record(&mut sessions, channel, label)?;
        debug!(connection = %self.name, channel, "session opened");
        Ok(channel)
    }

    /// Open a session on a caller-chosen channel.
    pub fn open_on(&self, channel: u16, label: Option<&str>) -> Result<u16> {
        let mut sessions = self.lock_sessions();
        let channel = self
            .allocator
            .allocate_specific(channel)
            .inspect_err(|err| self.log_alloc_failure(err))?;
        self.record(&mut sessions, channel, label)?;
        debug!(connection = %self.name, channel, "session opened on requested channel");
        Ok(channel)
    }

    // A live entry here means the channel was released through the shared
    // allocator behind the session's back. The existing session keeps it.
    fn record(
        &self,
        sessions: &mut BTreeMap<u16, SessionInfo>,
        channel: u16,
        label: Option<&str>,
    ) -> Result<()> {
        match sessions.entry(channel) {
            Entry::Occupied(_) => {
                warn!(
                    connection = %self.name,
                    channel,
                    "allocator returned a channel that still has an open session"
                );
                Err(SessionError::SessionExists(channel))
            }
            Entry::Vacant(slot) => {
                slot.insert(new_session(channel, label));
                Ok(())
            }
        }
    }

    /// Close the session on `channel` and free its number.
    ///
    /// Fails with [`SessionError::UnknownChannel`] when no session is open on
    /// `channel`, leaving the allocator untouched. Reserved channels never have
    /// a session entry, so they are rejected this way too.
    pub fn close(&self, channel: u16) -> Result<SessionInfo> {
        let mut sessions = self.lock_sessions();
        let info = sessions
            .remove(&channel)
            .ok_or(SessionError::UnknownChannel(channel))?;
        self.allocator.release(channel);
        debug!(connection = %self.name, channel, "session closed");
        Ok(info)
    }

    /// Close every open session. Called when the connection goes away.
    ///
    /// Returns the number of sessions closed. Reserved channels stay allocated.
    pub fn close_all(&self) -> usize {
        let mut sessions = self.lock_sessions();
        let closed = sessions.len();
        for channel in std::mem::take(&mut *sessions).into_keys() {
            self.allocator.release(channel);
        }
        if closed > 0 {
            info!(connection = %self.name, closed, "closed all sessions");
        }
        closed
    }

    /// Look up the session on `channel`.
    pub fn get(&self, channel: u16) -> Option<SessionInfo> {
        self.lock_sessions().get(&channel).cloned()
    }

    /// All open sessions, ordered by channel.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.lock_sessions().values().cloned().collect()
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Returns true if no session is open.
    pub fn is_empty(&self) -> bool {
        self.lock_sessions().is_empty()
    }

    fn log_alloc_failure(&self, err: &AllocError) {
        match err {
            AllocError::ChannelsExhausted => warn!(
                connection = %self.name,
                channel_max = self.allocator.channel_max().get(),
                "no free channels left on connection"
            ),
            other => debug!(connection = %self.name, error = %other, "channel request rejected"),
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, BTreeMap<u16, SessionInfo>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let open = self.lock_sessions().len();
        if open > 0 {
            debug!(connection = %self.name, open, "dropping session manager with open sessions");
        }
    }
}

fn new_session(channel: u16, label: Option<&str>) -> SessionInfo {
    SessionInfo {
        channel,
        label: label.map(str::to_string),
        opened_at: SystemTime::now(),
    }
}

fn serialize_unix_seconds<S: Serializer>(
    time: &SystemTime,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    serializer.serialize_u64(secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;

    fn manager(channel_max: u16) -> SessionManager {
        SessionManager::new(SessionConfig {
            channel_max,
            ..SessionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn open_and_close_track_allocator() {
        let mgr = manager(4);
        let a = mgr.open(Some("publisher")).unwrap();
        let b = mgr.open(None).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(mgr.len(), 2);
        assert_eq!(mgr.get(1).unwrap().label.as_deref(), Some("publisher"));

        let info = mgr.close(a).unwrap();
        assert_eq!(info.channel, 1);
        assert!(!mgr.allocator().is_allocated(1));
        assert_eq!(mgr.open(None).unwrap(), 1);
    }

    #[test]
    fn close_unknown_channel_leaves_allocator_alone() {
        let mgr = SessionManager::new(SessionConfig {
            channel_max: 8,
            reserved_channels: vec![1],
            ..SessionConfig::default()
        })
        .unwrap();

        assert!(matches!(mgr.close(1), Err(SessionError::UnknownChannel(1))));
        assert!(mgr.allocator().is_allocated(1));
        assert!(matches!(mgr.close(5), Err(SessionError::UnknownChannel(5))));
    }

    #[test]
    fn reserved_channels_are_skipped() {
        let mgr = SessionManager::new(SessionConfig {
            channel_max: 4,
            reserved_channels: vec![1, 3],
            ..SessionConfig::default()
        })
        .unwrap();

        assert_eq!(mgr.reserved_channels(), &[1, 3]);
        assert_eq!(mgr.open(None).unwrap(), 2);
        assert_eq!(mgr.open(None).unwrap(), 4);
        assert!(matches!(
            mgr.open(None),
            Err(SessionError::Alloc(AllocError::ChannelsExhausted))
        ));
    }

    #[test]
    fn reserved_channel_above_limit_fails() {
        let result = SessionManager::new(SessionConfig {
            channel_max: 4,
            reserved_channels: vec![5],
            ..SessionConfig::default()
        });
        assert!(matches!(
            result,
            Err(SessionError::Alloc(AllocError::InvalidChannelNumber {
                channel: 5,
                channel_max: 4
            }))
        ));
    }

    #[test]
    fn open_on_collision_reports_channel() {
        let mgr = manager(3);
        mgr.open_on(2, Some("rpc")).unwrap();
        let err = mgr.open_on(2, None).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Alloc(AllocError::ChannelInUse(2))
        ));
        assert_eq!(mgr.get(2).unwrap().label.as_deref(), Some("rpc"));
    }

    #[test]
    fn reopen_after_external_release_keeps_live_session() {
        let mgr = manager(4);
        assert_eq!(mgr.open(Some("first")).unwrap(), 1);

        mgr.allocator().release(1);
        let err = mgr.open(Some("second")).unwrap_err();
        assert!(matches!(err, SessionError::SessionExists(1)));

        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.get(1).unwrap().label.as_deref(), Some("first"));
        assert!(mgr.allocator().is_allocated(1));
        assert_eq!(mgr.open(Some("second")).unwrap(), 2);

        mgr.allocator().release(2);
        assert!(matches!(
            mgr.open_on(2, None),
            Err(SessionError::SessionExists(2))
        ));
        assert_eq!(mgr.get(2).unwrap().label.as_deref(), Some("second"));
    }

    #[test]
    fn close_all_frees_sessions_but_keeps_reserved() {
        let mgr = SessionManager::new(SessionConfig {
            channel_max: 10,
            reserved_channels: vec![10],
            ..SessionConfig::default()
        })
        .unwrap();
        for _ in 0..5 {
            mgr.open(None).unwrap();
        }

        assert_eq!(mgr.close_all(), 5);
        assert!(mgr.is_empty());
        assert_eq!(mgr.allocator().allocated(), vec![10]);
        assert_eq!(mgr.close_all(), 0);
    }

    #[test]
    fn negotiated_limit_applies() {
        let config = SessionConfig {
            channel_max: 0,
            ..SessionConfig::default()
        };
        let mgr = SessionManager::with_negotiated(config, 2).unwrap();
        assert_eq!(mgr.allocator().channel_max().get(), 2);
        mgr.open(None).unwrap();
        mgr.open(None).unwrap();
        assert!(mgr.open(None).is_err());
    }

    #[test]
    fn unlimited_config_uses_full_range() {
        let mgr = manager(0);
        assert_eq!(mgr.allocator().channel_max(), ChannelMax::UNLIMITED);
        assert_eq!(mgr.open_on(u16::MAX, None).unwrap(), u16::MAX);
    }

    #[test]
    fn session_info_serializes_unix_seconds() {
        let mgr = manager(2);
        mgr.open(None).unwrap();
        let json = serde_json::to_value(mgr.sessions()).unwrap();
        assert_eq!(json[0]["channel"], 1);
        assert!(json[0]["opened_at"].as_u64().unwrap() > 0);
        assert!(json[0].get("label").is_none());
    }

    #[test]
    fn concurrent_open_assigns_unique_channels() {
        let mgr = Arc::new(manager(256));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || {
                    (0..32)
                        .map(|_| mgr.open(None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let channels: HashSet<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(channels.len(), 256);
        assert_eq!(mgr.len(), 256);
        assert!(mgr.allocator().is_exhausted());
    }
}
