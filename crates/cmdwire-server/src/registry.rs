//! SessionRegistry: the set of live sessions, keyed by session id.
//!
//! Backed by a sharded map so lookups from handler tasks never contend with
//! each other. Iteration always works on a snapshot: no map guard is held
//! across an await.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, info};

use cmdwire_transport::CloseFrame;

use crate::error::{ServerError, SessionError};
use crate::session::{CloseCause, Session};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Point-in-time copy of every registered session.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Send one frame to every live session, concurrently. Individual
    /// failures are logged and skipped. Returns the number of sessions the
    /// frame was queued on.
    pub async fn broadcast(&self, command_id: u32, payload: &[u8]) -> Result<usize, ServerError> {
        let frame = cmdwire_protocol::encode(command_id, payload).map_err(SessionError::from)?;
        let targets: Vec<_> = self.snapshot().into_iter().filter(|s| !s.is_closing()).collect();

        let sends = targets.iter().map(|session| {
            let frame = frame.clone();
            async move {
                match session.send_frame(frame, session.send_deadline()).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(session_id = %session.id(), command_id, "broadcast skipped session: {e}");
                        false
                    }
                }
            }
        });
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();

        debug!(command_id, targets = targets.len(), delivered, "broadcast complete");
        Ok(delivered)
    }

    /// Send one frame to a single session.
    pub async fn send_to(&self, id: &str, command_id: u32, payload: &[u8]) -> Result<(), ServerError> {
        let session = self
            .get(id)
            .ok_or_else(|| ServerError::SessionNotFound(id.to_string()))?;
        session.send(command_id, payload).await?;
        Ok(())
    }

    /// Close every registered session concurrently with the same frame.
    pub(crate) async fn close_all(&self, cause: CloseCause, frame: CloseFrame) {
        let sessions = self.snapshot();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "closing all sessions");
        join_all(
            sessions
                .iter()
                .map(|session| session.close_with(cause, frame.clone())),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use cmdwire_protocol::decode;

    use super::*;
    use crate::config::SessionConfig;

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = SessionRegistry::new();
        let (session, _rx) = Session::detached(SessionConfig::default());
        let id = session.id().to_string();

        registry.insert(session);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_closing_sessions() {
        let registry = SessionRegistry::new();
        let mut queues = Vec::new();
        let mut sessions = Vec::new();
        for _ in 0..3 {
            let (session, rx) = Session::detached(SessionConfig::default());
            registry.insert(session.clone());
            sessions.push(session);
            queues.push(rx);
        }
        sessions[1].close(1000, "").await.unwrap();

        let delivered = registry.broadcast(7, b"news").await.unwrap();
        assert_eq!(delivered, 2);

        for i in [0, 2] {
            let frame = queues[i].recv().await.unwrap();
            assert_eq!(decode(&frame).unwrap(), (7, &b"news"[..]));
        }
        assert!(queues[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.broadcast(1, b"").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_to_unknown_session() {
        let registry = SessionRegistry::new();
        let err = registry.send_to("missing", 1, b"").await.unwrap_err();
        assert!(matches!(err, ServerError::SessionNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn send_to_known_session() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = Session::detached(SessionConfig::default());
        let id = session.id().to_string();
        registry.insert(session);

        registry.send_to(&id, 3, b"direct").await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(decode(&frame).unwrap(), (3, &b"direct"[..]));
    }

    #[tokio::test]
    async fn close_all_marks_every_session() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = Session::detached(SessionConfig::default());
        let (b, _rx_b) = Session::detached(SessionConfig::default());
        registry.insert(a.clone());
        registry.insert(b.clone());

        registry
            .close_all(CloseCause::ServerShutdown, CloseFrame::new(1001, "Server shutting down"))
            .await;
        assert_eq!(a.close_cause(), Some(CloseCause::ServerShutdown));
        assert_eq!(b.close_cause(), Some(CloseCause::ServerShutdown));
    }
}
