use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::{ClusterSource, RemoteMap};
use crate::cluster::{ClusterPath, ClusterType, ItemId, Job};
use crate::error::Result;
use crate::transaction::Locker;

/// Jobs offered on an item, keyed by job id
#[derive(Debug)]
pub struct JobList {
    map: RemoteMap<Job>,
}

impl JobList {
    pub fn new(source: Arc<dyn ClusterSource>, item: ItemId, locker: Option<Locker>) -> Self {
        Self {
            map: RemoteMap::new(source, item, ClusterPath::root(ClusterType::Job), locker),
        }
    }

    /// Store a job under a freshly allocated id
    pub fn add_job(&mut self, mut job: Job) -> Result<Job> {
        job.id = self.map.next_id()?;
        self.map.put(job.clone())?;
        Ok(job)
    }

    pub fn job(&mut self, id: i64) -> Result<Option<Job>> {
        self.map.get(&id.to_string())
    }

    /// Jobs offered to one agent role, in id order
    pub fn jobs_for_role(&mut self, role: &str) -> Result<Vec<Job>> {
        Ok(self
            .map
            .values()?
            .into_iter()
            .filter(|job| job.agent_role == role)
            .collect())
    }
}

impl Deref for JobList {
    type Target = RemoteMap<Job>;

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl DerefMut for JobList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::router::StorageRouter;

    #[test]
    fn test_jobs_for_role_filters_in_id_order() {
        let router = StorageRouter::builder()
            .backend(Arc::new(MemoryBackend::new("mem")))
            .build()
            .unwrap();
        let item = ItemId::new();
        let mut jobs = JobList::new(Arc::new(router), item, None);
        jobs.add_job(Job::new(item, "Review", "Approve", "Reviewer")).unwrap();
        jobs.add_job(Job::new(item, "Edit", "Save", "Author")).unwrap();
        jobs.add_job(Job::new(item, "Review", "Reject", "Reviewer")).unwrap();

        let reviewer: Vec<(i64, String)> = jobs
            .jobs_for_role("Reviewer")
            .unwrap()
            .into_iter()
            .map(|j| (j.id, j.transition))
            .collect();
        assert_eq!(reviewer, vec![(0, "Approve".to_string()), (2, "Reject".to_string())]);
        assert!(jobs.jobs_for_role("Nobody").unwrap().is_empty());
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let router = StorageRouter::builder()
            .backend(Arc::new(MemoryBackend::new("mem")))
            .build()
            .unwrap();
        let item = ItemId::new();
        let mut jobs = JobList::new(Arc::new(router.clone()), item, None);
        let job = jobs.add_job(Job::new(item, "Step", "Go", "Role")).unwrap();
        jobs.remove(&job.id.to_string()).unwrap();

        // a fresh view over the now-empty cluster
        let mut again = JobList::new(Arc::new(router), item, None);
        assert_eq!(again.last_id().unwrap(), -1);
        let next = again.add_job(Job::new(item, "Step", "Go", "Role")).unwrap();
        assert_eq!(next.id, job.id + 1);
    }
}
