//! A pool of server sessions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("the deployment does not support sessions")]
    SessionsNotSupported,
}

// Sessions this close to expiring on the server are not handed out.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A logical session as known to the server.
#[derive(Clone, Debug)]
pub struct ServerSession {
    id: [u8; 16],
    last_used: Instant,
    dirty: bool,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            id: rand::random::<u128>().to_be_bytes(),
            last_used: Instant::now(),
            dirty: false,
        }
    }

    pub fn id(&self) -> &[u8; 16] {
        &self.id
    }

    /// Records use of the session by a command.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Marks a session which saw a network error; it is not reused.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn is_about_to_expire(&self, timeout: Duration) -> bool {
        let expires = self.last_used + timeout;
        expires.saturating_duration_since(Instant::now()) < EXPIRY_MARGIN
    }
}

/// Recently used sessions, most recent first.
///
/// The session timeout follows the topology; sessions are unavailable while
/// it is unknown.
#[derive(Debug, Default)]
pub struct SessionPool {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    timeout: Option<Duration>,
    sessions: VecDeque<ServerSession>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().timeout
    }

    pub(crate) fn update_timeout(&self, timeout: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        inner.timeout = timeout;
        if let Some(timeout) = timeout {
            inner.sessions.retain(|s| !s.is_about_to_expire(timeout));
        }
    }

    pub fn check_out(&self) -> Result<ServerSession, Error> {
        let mut inner = self.inner.lock().unwrap();
        let timeout = inner.timeout.ok_or(Error::SessionsNotSupported)?;
        while let Some(session) = inner.sessions.pop_front() {
            if !session.is_about_to_expire(timeout) {
                return Ok(session);
            }
        }
        Ok(ServerSession::new())
    }

    pub fn check_in(&self, session: ServerSession) {
        let mut inner = self.inner.lock().unwrap();
        let Some(timeout) = inner.timeout else {
            return;
        };
        // The oldest sessions sit at the back.
        while let Some(oldest) = inner.sessions.back() {
            if !oldest.is_about_to_expire(timeout) {
                break;
            }
            inner.sessions.pop_back();
        }
        if !session.dirty && !session.is_about_to_expire(timeout) {
            inner.sessions.push_front(session);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().sessions.clear();
    }
}
