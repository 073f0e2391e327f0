use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tare_core::{BoardAddress, BoardDetails, BoardStatus};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::session::{BoardSession, SessionError, SessionSettings};
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry is shutting down")]
    Closed,

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type SessionHandle<T> = Arc<BoardSession<<T as Transport>::Channel>>;

/// Every board session the hub knows about, keyed by address.
///
/// Cloning is cheap and every clone sees the same sessions.
pub struct BoardRegistry<T: Transport> {
    inner: Arc<RegistryInner<T>>,
}

struct RegistryInner<T: Transport> {
    transport: T,
    settings: SessionSettings,
    sessions: DashMap<BoardAddress, SessionHandle<T>>,
    closed: AtomicBool,
}

impl<T: Transport> Clone for BoardRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> BoardRegistry<T> {
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                settings,
                sessions: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Return the session for `address`, creating and connecting it if there
    /// is none.
    ///
    /// Concurrent calls for the same address share one session and only the
    /// caller that created it connects. A session whose connect fails is
    /// removed again so a later discovery can retry.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn upsert(&self, address: BoardAddress) -> Result<SessionHandle<T>, RegistryError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }

        let session = match self.inner.sessions.entry(address.clone()) {
            Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                // checked again under the shard lock so shutdown either sees
                // this entry or we see the flag
                if self.inner.closed.load(Ordering::SeqCst) {
                    return Err(RegistryError::Closed);
                }
                let session = Arc::new(BoardSession::new(address.clone(), self.inner.settings));
                entry.insert(Arc::clone(&session));
                session
            }
        };

        if let Err(e) = session.connect(&self.inner.transport).await {
            self.inner
                .sessions
                .remove_if(&address, |_, existing| Arc::ptr_eq(existing, &session));
            return Err(e.into());
        }

        Ok(session)
    }

    pub fn get(&self, address: &BoardAddress) -> Option<SessionHandle<T>> {
        self.inner
            .sessions
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, address: &BoardAddress) -> bool {
        self.inner.sessions.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// `(address, total mass)` of every connected board, ordered by address.
    pub fn snapshot(&self) -> Vec<(BoardAddress, f64)> {
        let mut snapshot: Vec<_> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().status() == BoardStatus::Connected)
            .map(|entry| (entry.key().clone(), entry.value().total_mass()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Details of every session regardless of status, ordered by address.
    pub fn details(&self) -> Vec<BoardDetails> {
        let mut details: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().details())
            .collect();
        details.sort_by(|a, b| a.address.cmp(&b.address));
        details
    }

    /// Drop sessions that ended and release their channels. Returns how many
    /// were removed.
    pub async fn remove_disconnected(&self) -> usize {
        let ended: Vec<BoardAddress> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().status() == BoardStatus::Disconnected)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for address in ended {
            let Some((_, session)) = self
                .inner
                .sessions
                .remove_if(&address, |_, s| s.status() == BoardStatus::Disconnected)
            else {
                continue;
            };
            session.disconnect().await;
            debug!(%address, "removed ended session");
            removed += 1;
        }
        removed
    }

    /// Refuse new sessions and disconnect every existing one.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("registry already shutting down");
        }

        let addresses: Vec<BoardAddress> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut tasks = JoinSet::new();
        for address in addresses {
            if let Some((_, session)) = self.inner.sessions.remove(&address) {
                tasks.spawn(async move { session.disconnect().await });
            }
        }

        let count = tasks.len();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Disconnect task failed");
            }
        }
        info!(sessions = count, "Registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, SimulatedBoard};

    fn registry(boards: &[&str]) -> BoardRegistry<MockTransport> {
        let transport =
            MockTransport::simulated(boards.iter().map(|a| SimulatedBoard::new(*a, [0.0; 4])));
        BoardRegistry::new(transport, SessionSettings::default())
    }

    #[tokio::test]
    async fn upsert_twice_returns_the_same_session() {
        let registry = registry(&["AA"]);

        let first = registry.upsert("AA".into()).await.unwrap();
        let second = registry.upsert("AA".into()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.transport().connect_count(), 1);
        assert_eq!(registry.len(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn failed_connect_is_forgotten() {
        let registry = registry(&[]);

        let err = registry.upsert("CC".into()).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Session(SessionError::Connect { .. })
        ));
        assert!(!registry.contains(&"CC".into()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_empties_and_closes() {
        let registry = registry(&["AA", "BB"]);
        let a = registry.upsert("AA".into()).await.unwrap();
        registry.upsert("BB".into()).await.unwrap();

        registry.shutdown().await;

        assert!(registry.is_empty());
        assert_eq!(a.status(), BoardStatus::Disconnected);
        assert!(matches!(
            registry.upsert("AA".into()).await,
            Err(RegistryError::Closed)
        ));
    }

    #[tokio::test]
    async fn reaping_only_touches_ended_sessions() {
        let registry = registry(&["AA", "BB"]);
        let a = registry.upsert("AA".into()).await.unwrap();
        registry.upsert("BB".into()).await.unwrap();

        a.disconnect().await;
        assert_eq!(registry.remove_disconnected().await, 1);
        assert!(!registry.contains(&"AA".into()));
        assert!(registry.contains(&"BB".into()));

        registry.shutdown().await;
    }
}
