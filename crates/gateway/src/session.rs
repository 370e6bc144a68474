//! Per-connection session table.

use std::time::{Duration, Instant};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    mememo_auth::User,
    mememo_common::{Error, Result},
    tracing::{debug, info},
};

/// One live connection. Unauthenticated until a login succeeds.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: String,
    pub user: Option<User>,
    pub connected_at: Instant,
}

impl Session {
    fn new(conn_id: &str) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            user: None,
            connected_at: Instant::now(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    fn is_stale(&self, timeout: Duration) -> bool {
        !self.is_authenticated() && self.connected_at.elapsed() >= timeout
    }
}

/// Concurrent `conn_id -> Session` map.
///
/// A connection that has not logged in within `timeout` is dropped the
/// next time it is used.
pub struct SessionTable {
    sessions: DashMap<String, Session>,
    timeout: Duration,
}

impl SessionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
        }
    }

    pub fn connect(&self, conn_id: &str) -> Result<()> {
        match self.sessions.entry(conn_id.to_string()) {
            Entry::Occupied(_) => Err(Error::validation(format!(
                "connection already open: {conn_id}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Session::new(conn_id));
                debug!(conn_id, "session opened");
                Ok(())
            },
        }
    }

    pub fn disconnect(&self, conn_id: &str) -> bool {
        let removed = self.sessions.remove(conn_id).is_some();
        if removed {
            debug!(conn_id, "session closed");
        }
        removed
    }

    /// Bind `user` to the session, replacing any earlier login.
    pub fn authenticate(&self, conn_id: &str, user: User) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(conn_id)
            .ok_or_else(|| Error::authentication("no open session"))?;
        info!(conn_id, user = %user.username, "session authenticated");
        session.user = Some(user);
        Ok(())
    }

    /// Return the session to anonymous, restarting its login window.
    pub fn logout(&self, conn_id: &str) -> bool {
        match self.sessions.get_mut(conn_id) {
            Some(mut session) => {
                session.user = None;
                session.connected_at = Instant::now();
                true
            },
            None => false,
        }
    }

    /// The logged-in user of `conn_id`, `None` while still anonymous.
    ///
    /// Unknown connections and anonymous ones past the timeout are
    /// `Authentication` errors; the latter are removed.
    pub fn user(&self, conn_id: &str) -> Result<Option<User>> {
        if self
            .sessions
            .remove_if(conn_id, |_, s| s.is_stale(self.timeout))
            .is_some()
        {
            info!(conn_id, "unauthenticated session expired");
            return Err(Error::authentication("session expired"));
        }
        self.sessions
            .get(conn_id)
            .map(|s| s.user.clone())
            .ok_or_else(|| Error::authentication("no open session"))
    }

    /// Drop every anonymous session past the timeout.
    pub fn reap_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_stale(self.timeout));
        let reaped = before.saturating_sub(self.sessions.len());
        if reaped > 0 {
            debug!(reaped, "expired sessions removed");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_twice_is_rejected() {
        let table = SessionTable::new(Duration::from_secs(60));
        table.connect("c1").unwrap();
        assert!(table.connect("c1").is_err());
        assert_eq!(table.len(), 1);
        assert!(table.disconnect("c1"));
        assert!(!table.disconnect("c1"));
        assert!(table.is_empty());
    }

    #[test]
    fn anonymous_until_authenticated() {
        let table = SessionTable::new(Duration::from_secs(60));
        table.connect("c1").unwrap();
        assert!(table.user("c1").unwrap().is_none());
        table.authenticate("c1", User::new("alice")).unwrap();
        assert_eq!(table.user("c1").unwrap().unwrap().username, "alice");
    }

    #[test]
    fn unknown_connection_is_unauthenticated() {
        let table = SessionTable::new(Duration::from_secs(60));
        assert!(matches!(
            table.user("ghost"),
            Err(Error::Authentication { .. })
        ));
        assert!(table.authenticate("ghost", User::new("alice")).is_err());
    }

    #[test]
    fn stale_anonymous_session_expires() {
        let table = SessionTable::new(Duration::ZERO);
        table.connect("c1").unwrap();
        let err = table.user("c1").unwrap_err();
        assert_eq!(err.to_string(), "not authenticated: session expired");
        assert!(table.is_empty());
    }

    #[test]
    fn logout_returns_to_anonymous() {
        let table = SessionTable::new(Duration::from_secs(60));
        table.connect("c1").unwrap();
        table.authenticate("c1", User::new("alice")).unwrap();
        assert!(table.logout("c1"));
        assert!(table.user("c1").unwrap().is_none());
        assert!(!table.logout("ghost"));
    }

    #[test]
    fn authenticated_sessions_never_expire() {
        let table = SessionTable::new(Duration::ZERO);
        table.connect("c1").unwrap();
        table.connect("c2").unwrap();
        table.authenticate("c1", User::new("alice")).unwrap();
        assert_eq!(table.reap_expired(), 1);
        assert!(table.user("c1").unwrap().is_some());
    }
}
