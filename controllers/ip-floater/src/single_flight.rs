//! Collapses concurrent runs of the same work into one.
//!
//! The first caller for a key runs the work. Callers arriving while it is in
//! flight wait instead of starting their own run, and their arrival makes the
//! running caller go again once the current run ends, so every caller gets
//! the result of a run that started after it arrived. If the running caller
//! is cancelled, its waiters start over and one of them takes the lead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Callers waiting on a key, and whether one joined after the current run started.
struct Flight<T> {
    waiters: Vec<oneshot::Sender<T>>,
    rerun: bool,
}

impl<T> Default for Flight<T> {
    fn default() -> Self {
        Self { waiters: Vec::new(), rerun: false }
    }
}

pub struct SingleFlight<T> {
    in_flight: Mutex<HashMap<String, Flight<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Flight<T>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `work` under `key`, or joins the run already in flight.
    ///
    /// Joining schedules another run of the leader's `work`, so the result a
    /// caller gets never comes from a run that started before it called.
    pub async fn run<F, Fut>(&self, key: &str, mut work: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let waiting = {
                let mut in_flight = self.lock();
                match in_flight.get_mut(key) {
                    Some(flight) => {
                        let (tx, rx) = oneshot::channel();
                        flight.waiters.push(tx);
                        flight.rerun = true;
                        Some(rx)
                    }
                    None => {
                        in_flight.insert(key.to_string(), Flight::default());
                        None
                    }
                }
            };

            match waiting {
                Some(rx) => {
                    if let Ok(result) = rx.await {
                        return result;
                    }
                    // leader went away without answering
                }
                None => break,
            }
        }

        let mut leader = Leader { flight: self, key, finished: false };
        loop {
            let result = work().await;
            if let Some(waiters) = leader.finish_unless_rerun() {
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
                return result;
            }
        }
    }

    /// Whether a run is in flight for `key`.
    #[cfg(test)]
    pub fn is_running(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of callers waiting on the run in flight for `key`.
    #[cfg(test)]
    pub fn waiting(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, |flight| flight.waiters.len())
    }
}

/// Clears the in-flight entry when the leading caller is dropped mid-run.
struct Leader<'a, T: Clone> {
    flight: &'a SingleFlight<T>,
    key: &'a str,
    finished: bool,
}

impl<T: Clone> Leader<'_, T> {
    /// Ends the flight and hands back its waiters, unless someone joined
    /// during the last run. In that case the rerun mark is cleared and the
    /// leader runs again.
    fn finish_unless_rerun(&mut self) -> Option<Vec<oneshot::Sender<T>>> {
        let mut in_flight = self.flight.lock();
        if let Some(flight) = in_flight.get_mut(self.key) {
            if flight.rerun {
                flight.rerun = false;
                return None;
            }
        }
        self.finished = true;
        Some(in_flight.remove(self.key).map(|flight| flight.waiters).unwrap_or_default())
    }
}

impl<T: Clone> Drop for Leader<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.flight.lock().remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_callers_joining_mid_run_share_one_rerun() {
        let flight = Arc::new(SingleFlight::<usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flight = flight.clone();
            let runs = runs.clone();
            let release = release.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("reconcile", || {
                        let runs = runs.clone();
                        let release = release.clone();
                        async move {
                            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
                            if run == 1 {
                                release.notified().await;
                            }
                            run
                        }
                    })
                    .await
            }));
        }

        // Everyone but the leader joins while the first run is held
        while flight.waiting("reconcile") < 4 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 2);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!flight.is_running("reconcile"));
    }

    #[tokio::test]
    async fn test_late_joiner_sees_state_written_before_joining() {
        let flight = Arc::new(SingleFlight::<Vec<u32>>::new());
        let state = Arc::new(std::sync::Mutex::new(vec![1]));
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let work = {
            let state = state.clone();
            let entered = entered.clone();
            let release = release.clone();
            move || {
                let state = state.clone();
                let entered = entered.clone();
                let release = release.clone();
                async move {
                    let snapshot = state.lock().unwrap().clone();
                    if snapshot.len() == 1 {
                        entered.notify_one();
                        release.notified().await;
                    }
                    snapshot
                }
            }
        };

        let leader = {
            let flight = flight.clone();
            let work = work.clone();
            tokio::spawn(async move { flight.run("k", work).await })
        };
        entered.notified().await;

        // Written after the leader took its snapshot
        state.lock().unwrap().push(2);
        let joiner = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("k", work).await })
        };
        while flight.waiting("k") < 1 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        assert_eq!(joiner.await.unwrap(), vec![1, 2]);
        assert_eq!(leader.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sequential_callers_run_again() {
        let flight = SingleFlight::<u32>::new();

        assert_eq!(flight.run("k", || async { 1 }).await, 1);
        assert_eq!(flight.run("k", || async { 2 }).await, 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let flight = SingleFlight::<&'static str>::new();

        let (a, b) = tokio::join!(
            flight.run("a", || async { "a" }),
            flight.run("b", || async { "b" }),
        );
        assert_eq!((a, b), ("a", "b"));
    }

    #[tokio::test]
    async fn test_cancelled_leader_hands_over() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight.run("k", || std::future::pending::<u32>()).await
            })
        };
        while !flight.is_running("k") {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("k", || async { 7 }).await })
        };
        while flight.waiting("k") < 1 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        assert_eq!(waiter.await.unwrap(), 7);
        assert!(!flight.is_running("k"));
    }
}
