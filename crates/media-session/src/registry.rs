use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Channel id to active session. At most one session per channel.
pub struct SessionRegistry<S> {
    sessions: DashMap<String, Arc<S>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<S>> {
        self.sessions
            .get(channel_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Registers `session` unless the channel is taken, in which case the
    /// existing session comes back as the error.
    pub fn insert_if_absent(&self, channel_id: &str, session: Arc<S>) -> Result<Arc<S>, Arc<S>> {
        match self.sessions.entry(channel_id.to_string()) {
            Entry::Occupied(entry) => Err(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn remove(&self, channel_id: &str) -> Option<Arc<S>> {
        self.sessions.remove(channel_id).map(|(_, session)| session)
    }

    /// Removes the entry only while it still maps to `session`, so a late
    /// teardown never evicts a newer session on the same channel.
    pub fn remove_if_same(&self, channel_id: &str, session: &Arc<S>) -> bool {
        self.sessions
            .remove_if(channel_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.sessions.contains_key(channel_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_insert_returns_existing_session() {
        let registry = SessionRegistry::new();
        let first = Arc::new(1);
        let second = Arc::new(2);
        assert!(registry.insert_if_absent("C1", first.clone()).is_ok());
        let existing = registry
            .insert_if_absent("C1", second)
            .expect_err("channel taken");
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_removal_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let old = Arc::new("old");
        registry.insert_if_absent("C1", old.clone()).unwrap();
        assert!(registry.remove_if_same("C1", &old));
        let new = Arc::new("new");
        registry.insert_if_absent("C1", new.clone()).unwrap();

        assert!(!registry.remove_if_same("C1", &old));
        assert!(Arc::ptr_eq(&registry.get("C1").unwrap(), &new));
    }

    #[test]
    fn double_removal_is_harmless() {
        let registry = SessionRegistry::new();
        let session = Arc::new(());
        registry.insert_if_absent("C1", session.clone()).unwrap();
        assert!(registry.remove_if_same("C1", &session));
        assert!(!registry.remove_if_same("C1", &session));
        assert!(registry.remove("C1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_create_and_delete_never_duplicates() {
        let registry = Arc::new(SessionRegistry::<usize>::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for n in 0..64 {
            let registry = registry.clone();
            let winners = winners.clone();
            tasks.push(tokio::spawn(async move {
                let channel = format!("C{}", n % 4);
                let session = Arc::new(n);
                if registry.insert_if_absent(&channel, session.clone()).is_ok() {
                    winners.fetch_add(1, Ordering::SeqCst);
                    assert!(registry.len() <= 4);
                    tokio::task::yield_now().await;
                    assert!(registry.remove_if_same(&channel, &session));
                }
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert!(winners.load(Ordering::SeqCst) >= 4);
        assert!(registry.is_empty());
    }
}
