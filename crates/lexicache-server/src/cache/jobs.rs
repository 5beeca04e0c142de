//! Bounded in-memory job tracking.
//!
//! Invalidation and warming each own one `JobStore`. Finished records are
//! dropped after the retention window, and the store never grows past
//! `max_size`: the oldest finished records go first, then the oldest overall.

use std::collections::VecDeque;
use std::time::Duration;

use lexicache_core::{InvalidationEvent, Timestamp, WarmingJob, now_utc};
use parking_lot::Mutex;
use uuid::Uuid;

pub trait JobRecord: Clone + Send + Sync + 'static {
    fn job_id(&self) -> Uuid;

    /// `None` while the job is still running.
    fn finished_at(&self) -> Option<Timestamp>;
}

impl JobRecord for InvalidationEvent {
    fn job_id(&self) -> Uuid {
        self.id
    }

    fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }
}

impl JobRecord for WarmingJob {
    fn job_id(&self) -> Uuid {
        self.id
    }

    fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }
}

pub struct JobStore<T: JobRecord> {
    jobs: Mutex<VecDeque<T>>,
    retention: Duration,
    max_size: usize,
}

impl<T: JobRecord> JobStore<T> {
    pub fn new(retention: Duration, max_size: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            retention,
            max_size: max_size.max(1),
        }
    }

    pub fn insert(&self, job: T) {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.iter_mut().find(|j| j.job_id() == job.job_id()) {
            *existing = job;
            return;
        }
        jobs.push_back(job);
        Self::enforce(&mut jobs, self.retention, self.max_size);
    }

    /// Apply `f` to the job with `id`, returning the updated copy.
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut T)) -> Option<T> {
        let mut jobs = self.jobs.lock();
        let job = jobs.iter_mut().find(|j| j.job_id() == id)?;
        f(job);
        Some(job.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<T> {
        self.jobs.lock().iter().find(|j| j.job_id() == id).cloned()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        self.jobs.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn list(&self) -> Vec<T> {
        self.jobs.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    pub fn active(&self) -> usize {
        self.jobs
            .lock()
            .iter()
            .filter(|j| j.finished_at().is_none())
            .count()
    }

    /// Drop finished jobs past retention. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        Self::enforce(&mut jobs, self.retention, self.max_size);
        before - jobs.len()
    }

    fn enforce(jobs: &mut VecDeque<T>, retention: Duration, max_size: usize) {
        let now = now_utc();
        jobs.retain(|j| match j.finished_at() {
            Some(done) => now.since(&done) < retention,
            None => true,
        });
        while jobs.len() > max_size {
            match jobs.iter().position(|j| j.finished_at().is_some()) {
                Some(idx) => {
                    jobs.remove(idx);
                }
                None => {
                    jobs.pop_front();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexicache_core::{InvalidationStatus, InvalidationTrigger, WarmingKind};

    fn event() -> InvalidationEvent {
        InvalidationEvent::new(InvalidationTrigger::Glossary {
            glossary_id: "g1".into(),
        })
    }

    #[test]
    fn test_insert_update_get() {
        let store = JobStore::new(Duration::from_secs(60), 10);
        let ev = event();
        let id = ev.id;
        store.insert(ev);
        assert_eq!(store.active(), 1);
        let updated = store
            .update(id, |e| {
                e.transition(InvalidationStatus::Applying).unwrap();
            })
            .unwrap();
        assert_eq!(updated.status, InvalidationStatus::Applying);
        assert_eq!(store.get(id).unwrap().status, InvalidationStatus::Applying);
        assert!(store.update(Uuid::new_v4(), |_| {}).is_none());
    }

    #[test]
    fn test_cap_drops_oldest_finished_first() {
        let store = JobStore::new(Duration::from_secs(3600), 3);
        let running = WarmingJob::new(WarmingKind::Predictive, None, 10);
        let running_id = running.id;
        store.insert(running);
        for _ in 0..4 {
            let mut done = WarmingJob::new(WarmingKind::TargetedPattern, Some("p".into()), 1);
            done.finish(1, 0, false);
            store.insert(done);
        }
        assert_eq!(store.len(), 3);
        assert!(store.get(running_id).is_some());
    }

    #[test]
    fn test_retention_removes_finished() {
        let store = JobStore::new(Duration::ZERO, 10);
        let mut done = WarmingJob::new(WarmingKind::Predictive, None, 0);
        done.finish(0, 0, false);
        store.insert(WarmingJob::new(WarmingKind::Predictive, None, 0));
        store.insert(done);
        assert_eq!(store.len(), 1);
        assert_eq!(store.cleanup(), 0);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let store = JobStore::new(Duration::from_secs(60), 10);
        let first = event();
        let second = event();
        let second_id = second.id;
        store.insert(first);
        store.insert(second);
        assert_eq!(store.recent(1)[0].id, second_id);
    }
}
