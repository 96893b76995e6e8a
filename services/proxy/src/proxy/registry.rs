//! Registry of in-flight sessions.
//!
//! Uses ArcSwap for the live map so a sweep can prune without a global
//! lock. Inserts go into whatever map is live. A sweep swaps in an empty
//! map, waits until no writer still holds the displaced one, then moves
//! every unfinished session across. A session is never dropped while its
//! task is running.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use snare_id::SessionId;
use tokio::task::JoinHandle;

use super::connection::ConnectionRecord;
use crate::error::{ProxyError, Result};

type SessionMap = DashMap<SessionId, PendingSession>;

/// A connection and the task handling it.
#[derive(Debug)]
pub struct PendingSession {
    record: Arc<ConnectionRecord>,
    task: JoinHandle<()>,
}

impl PendingSession {
    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Concurrent map from session to handling task.
pub struct PendingRegistry {
    live: ArcSwap<SessionMap>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            live: ArcSwap::from_pointee(DashMap::new()),
        }
    }

    /// Track `task` as the handler for `record`.
    ///
    /// Fails if the session id is already registered; the task is then
    /// left running untracked.
    pub fn add(&self, record: Arc<ConnectionRecord>, task: JoinHandle<()>) -> Result<()> {
        let live = self.live.load_full();
        insert(&live, PendingSession { record, task })
    }

    /// Drop every session whose task has completed.
    ///
    /// Synchronous. It briefly blocks the calling thread while concurrent
    /// inserts on other threads finish with the displaced map.
    ///
    /// Returns the number of sessions removed. A re-insert collision is
    /// reported after the rest of the snapshot has been carried over.
    pub fn sweep(&self) -> Result<usize> {
        let displaced = exclusive(self.live.swap(Arc::new(DashMap::new())));
        let live = self.live.load();

        let mut removed = 0;
        let mut collision = None;
        for (_, pending) in displaced {
            if pending.is_finished() {
                removed += 1;
            } else if let Err(e) = insert(&live, pending) {
                collision = Some(e);
            }
        }

        match collision {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    pub fn len(&self) -> usize {
        self.live.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.load().is_empty()
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.live.load().contains_key(&session)
    }

    /// Records currently tracked, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionRecord>> {
        self.live
            .load()
            .iter()
            .map(|entry| Arc::clone(entry.value().record()))
            .collect()
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn insert(map: &SessionMap, pending: PendingSession) -> Result<()> {
    let session = pending.record.session_id();
    match map.entry(session) {
        Entry::Occupied(_) => Err(ProxyError::DuplicateSession(session)),
        Entry::Vacant(slot) => {
            slot.insert(pending);
            Ok(())
        }
    }
}

/// Wait out writers that loaded `map` before it was swapped out.
///
/// This spins on the calling thread with `yield_now`, so on a tokio worker
/// it blocks that worker until the last holder lets go. Holders never
/// await while they have the map, so the wait is bounded by one insert,
/// lookup or snapshot running on another thread. Nothing on the same
/// thread can be holding it, since every holder is synchronous.
fn exclusive(mut map: Arc<SessionMap>) -> SessionMap {
    loop {
        match Arc::try_unwrap(map) {
            Ok(map) => return map,
            Err(shared) => {
                map = shared;
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, PortRange};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn record() -> Arc<ConnectionRecord> {
        let endpoint = EndpointConfig::honeypot(PortRange::single(2222));
        Arc::new(ConnectionRecord::new(
            &endpoint,
            "127.0.0.1:2222".parse().unwrap(),
            "198.51.100.7:40000".parse().unwrap(),
        ))
    }

    /// A task that runs until the returned sender fires or is dropped.
    fn blocked_task() -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = rx.await;
        });
        (task, tx)
    }

    async fn finished_task() -> JoinHandle<()> {
        let task = tokio::spawn(async {});
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }
        task
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let registry = PendingRegistry::new();
        let record = record();

        let (first, _keep_first) = blocked_task();
        registry.add(Arc::clone(&record), first).unwrap();

        let (second, _keep_second) = blocked_task();
        let err = registry.add(Arc::clone(&record), second).unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateSession(id) if id == record.session_id()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_finished() {
        let registry = PendingRegistry::new();

        let done = record();
        registry.add(Arc::clone(&done), finished_task().await).unwrap();

        let running = record();
        let (task, release) = blocked_task();
        registry.add(Arc::clone(&running), task).unwrap();

        assert_eq!(registry.sweep().unwrap(), 1);
        assert!(!registry.contains(done.session_id()));
        assert!(registry.contains(running.session_id()));

        release.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.sweep().unwrap() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_on_empty_registry() {
        let registry = PendingRegistry::new();
        assert_eq!(registry.sweep().unwrap(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_lists_records() {
        let registry = PendingRegistry::new();
        let record = record();
        let (task, _keep) = blocked_task();
        registry.add(Arc::clone(&record), task).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id(), record.session_id());
    }

    #[test]
    fn test_sweep_waits_for_outstanding_holder() {
        let registry = PendingRegistry::new();
        let held = registry.live.load_full();
        let hold_for = std::time::Duration::from_millis(50);

        let holder = std::thread::spawn(move || {
            std::thread::sleep(hold_for);
            drop(held);
        });

        let started = std::time::Instant::now();
        assert_eq!(registry.sweep().unwrap(), 0);
        assert!(started.elapsed() >= hold_for);
        holder.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_survive_sweeps() {
        const WRITERS: usize = 4;
        const PER_WRITER: usize = 250;

        let registry = Arc::new(PendingRegistry::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let sweeper = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    registry.sweep().unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut writers = Vec::new();
        for _ in 0..WRITERS {
            let registry = Arc::clone(&registry);
            writers.push(tokio::spawn(async move {
                let mut keep = Vec::new();
                for i in 0..PER_WRITER {
                    if i % 2 == 0 {
                        let (task, tx) = blocked_task();
                        registry.add(record(), task).unwrap();
                        keep.push(tx);
                    } else {
                        registry.add(record(), tokio::spawn(async {})).unwrap();
                    }
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                keep
            }));
        }

        let mut senders = Vec::new();
        for writer in writers {
            senders.extend(writer.await.unwrap());
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        sweeper.await.unwrap();

        // Let the trivially finished tasks complete, then prune.
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.sweep().unwrap();

        assert_eq!(registry.len(), WRITERS * PER_WRITER / 2);
        assert_eq!(senders.len(), WRITERS * PER_WRITER / 2);
    }
}
