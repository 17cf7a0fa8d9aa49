//! A job system that schedules every job on its own OS thread.
//!
//! This is the trivial implementation of the [`JobSystem`] contract. It has
//! no fiber machinery and no worker pool; a nested `wait_for_jobs` simply
//! blocks the thread the outer job is running on, which is fine because
//! every job has a whole thread to itself.

use std::panic;
use std::thread;

use crate::error::Error;
use crate::job::Job;
use crate::job_system::JobSystem;

/// Job system backend that spawns one OS thread per job.
#[derive(Debug, Default)]
pub struct ThreadJobSystem;

impl ThreadJobSystem {
    pub fn new() -> ThreadJobSystem {
        ThreadJobSystem
    }
}

impl JobSystem for ThreadJobSystem {
    fn add_jobs(&self, jobs: Vec<Job>) -> Result<(), Error> {
        for job in jobs {
            // The join handle is intentionally discarded; nothing observes
            // the result of a fire-and-forget job.
            thread::Builder::new()
                .spawn(job)
                .map_err(Error::ThreadSpawn)?;
        }

        Ok(())
    }

    fn wait_for_jobs(&self, jobs: Vec<Job>) -> Result<(), Error> {
        let handles = jobs
            .into_iter()
            .map(|job| thread::Builder::new().spawn(job))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::ThreadSpawn)?;

        // Join everything before surfacing a failure so no job in the batch
        // outlives the wait.
        let mut first_panic = None;

        for handle in handles {
            if let Err(payload) = handle.join() {
                first_panic.get_or_insert(payload);
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }

        Ok(())
    }
}
