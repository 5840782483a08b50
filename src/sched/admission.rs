use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use super::{RunLease, Scheduler};
use crate::error::Result;
use crate::net::ConnId;
use crate::protocol::{commands as cmd, FieldId, Item, Message};
use crate::state::JobState;

/// An instruction for the connection layer: send `message` to agent `conn`.
#[derive(Debug)]
pub struct Dispatch {
    pub conn: ConnId,
    pub message: Message,
}

/// Candidate ordering key: queue priority descending, then job priority
/// descending, then submit time ascending, with the job id as the final
/// tiebreak so the order is a strict total order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct AdmissionKey {
    neg_queue_priority: i64,
    neg_job_priority: i64,
    submit_time: DateTime<Utc>,
    job_id: u64,
}

impl Scheduler {
    /// One greedy admission pass: all eligible PENDING jobs are collected and
    /// sorted together before any admission decision, then admitted in order
    /// while their queue and resources allow. Not globally optimal by design.
    /// Returns the dispatch directives for admitted jobs.
    pub fn admission_sweep(&mut self, now: DateTime<Utc>) -> Result<Vec<Dispatch>> {
        let mut candidates: Vec<(AdmissionKey, u64)> = self
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Pending
                    && !j.hold
                    && j.defer_time.is_none_or(|t| t <= now)
            })
            .filter_map(|j| {
                let queue = self.queues.get(&j.queue)?;
                Some((
                    AdmissionKey {
                        neg_queue_priority: -queue.priority,
                        neg_job_priority: -j.priority,
                        submit_time: j.submit_time,
                        job_id: j.id,
                    },
                    j.id,
                ))
            })
            .collect();
        candidates.sort();
        candidates.truncate(self.max_sched());

        let mut dispatches = Vec::new();
        for (_, job_id) in candidates {
            if let Some(dispatch) = self.try_admit(job_id, now)? {
                dispatches.push(dispatch);
            }
        }
        Ok(dispatches)
    }

    /// Admit one candidate if its queue has OPEN and STARTED set, a free
    /// slot, a logged-in agent and enough of every requested resource.
    /// Failing any check is not an error; the job simply stays PENDING.
    fn try_admit(&mut self, job_id: u64, now: DateTime<Utc>) -> Result<Option<Dispatch>> {
        let job = &self.jobs[&job_id];
        let Some(queue) = self.queues.get(&job.queue) else {
            return Ok(None);
        };
        if !queue.accepts_jobs() || !queue.runs_jobs() || !queue.has_free_slot() {
            return Ok(None);
        }
        let Some(agent_conn) = self.agents.conn_for_node(&queue.node) else {
            debug!(job_id, node = %queue.node, "no agent for node, job stays pending");
            return Ok(None);
        };
        for req in &job.resources {
            match self.resources.get(&req.name) {
                Some(res) if res.free() >= req.count => {}
                _ => return Ok(None),
            }
        }

        // All checks passed; reserve and transition atomically.
        let requests = job.resources.clone();
        for req in &requests {
            self.resources
                .get_mut(&req.name)
                .expect("checked above")
                .reserve(req.count)?;
        }
        let queue_name = job.queue.clone();
        self.queues
            .get_mut(&queue_name)
            .expect("checked above")
            .running += 1;

        let job = self.jobs.get_mut(&job_id).expect("candidate exists");
        job.state = JobState::Running;
        job.start_time = Some(now);
        let message = Message::with_item(cmd::RUN_JOB, job.to_item());

        // The release path works from this capture, not from the job's
        // then-current fields, which a mod_job may have changed meanwhile.
        self.leases.insert(
            job_id,
            RunLease {
                queue: queue_name.clone(),
                resources: requests,
            },
        );

        self.agents.assign(agent_conn, job_id);
        self.totals.started += 1;
        self.journal_job(job_id)?;
        self.journal_totals()?;

        info!(job_id, queue = %queue_name, conn = agent_conn, "job dispatched");
        Ok(Some(Dispatch {
            conn: agent_conn,
            message,
        }))
    }

    /// Wake DEFERRED jobs whose defer time has elapsed. Returns how many
    /// moved to PENDING.
    pub fn release_deferred(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let due: Vec<u64> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Deferred && j.defer_time.is_none_or(|t| t <= now))
            .map(|j| j.id)
            .collect();

        for id in &due {
            let job = self.jobs.get_mut(id).expect("collected above");
            job.state = JobState::Pending;
            self.journal_job(*id)?;
            debug!(job_id = id, "defer time elapsed, job pending");
        }
        Ok(due.len())
    }

    /// An agent reported a job start: stamp the agent-side pid and start
    /// time. Reports for jobs the agent does not own are discarded.
    pub fn job_started(&mut self, conn: ConnId, item: &Item) -> Result<()> {
        let Some(job_id) = item.get_int(FieldId::JobId).map(|n| n as u64) else {
            return Ok(());
        };
        if !self.agents.owns(conn, job_id) {
            debug!(conn, job_id, "discarding start report from non-owner");
            return Ok(());
        }
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.pid = item.get_int(FieldId::JobPid);
            if let Some(t) = item.get_int(FieldId::StartTime).and_then(|t| Utc.timestamp_opt(t, 0).single()) {
                job.start_time = Some(t);
            }
            self.journal_job(job_id)?;
        }
        Ok(())
    }

    /// An agent reported completion. Late or duplicate reports (job not
    /// RUNNING, or not owned by this agent) are discarded without error.
    pub fn job_completed(&mut self, conn: ConnId, item: &Item, now: DateTime<Utc>) -> Result<()> {
        let Some(job_id) = item.get_int(FieldId::JobId).map(|n| n as u64) else {
            return Ok(());
        };
        if !self.agents.owns(conn, job_id) {
            debug!(conn, job_id, "discarding completion report from non-owner");
            return Ok(());
        }
        let Some(job) = self.jobs.get(&job_id) else {
            return Ok(());
        };
        if job.state != JobState::Running {
            debug!(job_id, state = %job.state, "discarding completion report for non-running job");
            return Ok(());
        }

        let exit_code = item.get_int(FieldId::ExitCode).unwrap_or(0);
        let signal = item.get_int(FieldId::Signal);
        self.finish_job(job_id, exit_code, signal, now)?;
        self.agents.unassign(conn, job_id);
        Ok(())
    }

    /// Release a finished or abandoned run's reservations and counters,
    /// exactly as they were taken at admission.
    fn release_run(&mut self, job_id: u64) {
        let Some(lease) = self.leases.remove(&job_id) else {
            return;
        };
        for req in &lease.resources {
            if let Some(res) = self.resources.get_mut(&req.name) {
                res.release(req.count);
            }
        }
        if let Some(queue) = self.queues.get_mut(&lease.queue) {
            queue.running -= 1;
        }
    }

    fn finish_job(
        &mut self,
        job_id: u64,
        exit_code: i64,
        signal: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.release_run(job_id);

        let job = self.jobs.get_mut(&job_id).expect("caller validated");
        job.finish_time = Some(now);
        job.exit_code = Some(exit_code);
        job.signal = signal;
        if exit_code == 0 && signal.is_none() {
            job.state = JobState::Completed;
            self.totals.completed += 1;
        } else {
            job.state = JobState::Exited;
            self.totals.exited += 1;
        }
        let state = job.state;
        self.journal_job(job_id)?;
        self.journal_totals()?;
        info!(job_id, exit_code, state = %state, "job finished");
        Ok(())
    }

    /// An agent connection closed. Jobs it owned go back to PENDING with
    /// their resources and queue slots released, ready for re-dispatch; a
    /// RUNNING job with no owning connection is never left behind.
    pub fn agent_lost(&mut self, conn: ConnId, now: DateTime<Utc>) -> Result<()> {
        let Some(session) = self.agents.logout(conn) else {
            return Ok(());
        };
        for job_id in session.running {
            if self.jobs.get(&job_id).is_none_or(|j| j.state != JobState::Running) {
                continue;
            }
            warn!(job_id, node = %session.node, "agent lost, requeueing job");
            self.release_run(job_id);
            let job = self.jobs.get_mut(&job_id).expect("checked above");
            job.reset_for_restart(now);
            self.journal_job(job_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::state::{Job, Resource, ResourceRequest};

    fn add_pending_job(
        sched: &mut Scheduler,
        queue: &str,
        priority: i64,
        submit: DateTime<Utc>,
    ) -> u64 {
        let id = sched.assign_job_id();
        let mut job = Job::new(id, format!("job{id}"), queue.into(), submit);
        job.priority = priority;
        sched.jobs.insert(id, job);
        id
    }

    #[test]
    fn sweep_orders_by_queue_then_job_priority_then_submit_time() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "low", "node1", 10);
        open_started_queue(&mut sched, "high", "node1", 10);
        sched.queues.get_mut("low").unwrap().set_priority(10).unwrap();
        sched.queues.get_mut("high").unwrap().set_priority(20).unwrap();
        sched.agents.login(1, "node1").unwrap();

        // A: queue prio 10, job prio 5; B: queue prio 10, job prio 9;
        // C: queue prio 20, job prio 1. Expected order: C, B, A.
        let a = add_pending_job(&mut sched, "low", 5, now);
        let b = add_pending_job(&mut sched, "low", 9, now);
        let c = add_pending_job(&mut sched, "high", 1, now);

        let dispatches = sched.admission_sweep(now).unwrap();
        let order: Vec<u64> = dispatches
            .iter()
            .map(|d| d.message.item().unwrap().get_int(FieldId::JobId).unwrap() as u64)
            .collect();
        assert_eq!(order, vec![c, b, a]);
    }

    #[test]
    fn equal_priorities_admit_in_submit_order() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "batch", "node1", 10);
        sched.agents.login(1, "node1").unwrap();

        let later = add_pending_job(&mut sched, "batch", 50, now + chrono::Duration::seconds(5));
        let earlier = add_pending_job(&mut sched, "batch", 50, now - chrono::Duration::seconds(5));

        let dispatches = sched.admission_sweep(now + chrono::Duration::seconds(10)).unwrap();
        let order: Vec<u64> = dispatches
            .iter()
            .map(|d| d.message.item().unwrap().get_int(FieldId::JobId).unwrap() as u64)
            .collect();
        assert_eq!(order, vec![earlier, later]);
    }

    #[test]
    fn queue_must_be_open_started_with_free_slot() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        sched.agents.login(1, "node1").unwrap();

        // OPEN but not STARTED
        let queue = crate::state::Queue::new("stopped".into(), "node1".into()).unwrap();
        sched.queues.insert("stopped".into(), queue);
        add_pending_job(&mut sched, "stopped", 50, now);
        assert!(sched.admission_sweep(now).unwrap().is_empty());

        // OPEN+STARTED with job_limit 1: second job waits
        open_started_queue(&mut sched, "batch", "node1", 1);
        add_pending_job(&mut sched, "batch", 50, now);
        add_pending_job(&mut sched, "batch", 50, now);
        assert_eq!(sched.admission_sweep(now).unwrap().len(), 1);
        assert_eq!(sched.queues["batch"].running, 1);
        assert!(sched.admission_sweep(now).unwrap().is_empty());
    }

    #[test]
    fn no_agent_means_no_admission() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "batch", "node1", 10);
        add_pending_job(&mut sched, "batch", 50, now);

        assert!(sched.admission_sweep(now).unwrap().is_empty());
        assert_eq!(sched.jobs.values().next().unwrap().state, JobState::Pending);

        sched.agents.login(1, "node1").unwrap();
        assert_eq!(sched.admission_sweep(now).unwrap().len(), 1);
    }

    #[test]
    fn resource_contention_licence_scenario() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "batch", "node1", 1);
        sched.agents.login(1, "node1").unwrap();
        sched
            .resources
            .insert("licence".into(), Resource::new("licence".into(), 1).unwrap());

        let licence = ResourceRequest {
            name: "licence".into(),
            count: 1,
        };
        let first = add_pending_job(&mut sched, "batch", 50, now);
        sched.jobs.get_mut(&first).unwrap().resources = vec![licence.clone()];
        let second = add_pending_job(&mut sched, "batch", 50, now);
        sched.jobs.get_mut(&second).unwrap().resources = vec![licence];

        // First sweep admits only the first job and reserves the licence.
        let dispatches = sched.admission_sweep(now).unwrap();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(sched.jobs[&first].state, JobState::Running);
        assert_eq!(sched.jobs[&second].state, JobState::Pending);
        assert_eq!(sched.resources["licence"].inuse, 1);

        // Still pending while the first runs.
        assert!(sched.admission_sweep(now).unwrap().is_empty());

        // Completion releases the licence; the next sweep admits the second.
        let mut report = Item::new();
        report.set_int(FieldId::JobId, first as i64);
        report.set_int(FieldId::ExitCode, 0);
        sched.job_completed(1, &report, now).unwrap();
        assert_eq!(sched.jobs[&first].state, JobState::Completed);
        assert_eq!(sched.resources["licence"].inuse, 0);

        assert_eq!(sched.admission_sweep(now).unwrap().len(), 1);
        assert_eq!(sched.jobs[&second].state, JobState::Running);
        assert_eq!(sched.resources["licence"].inuse, 1);
    }

    #[test]
    fn late_and_foreign_completion_reports_are_discarded() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "batch", "node1", 10);
        sched.agents.login(1, "node1").unwrap();
        sched.agents.login(2, "node2").unwrap();

        let id = add_pending_job(&mut sched, "batch", 50, now);
        sched.admission_sweep(now).unwrap();

        let mut report = Item::new();
        report.set_int(FieldId::JobId, id as i64);
        report.set_int(FieldId::ExitCode, 0);

        // Wrong agent: discarded.
        sched.job_completed(2, &report, now).unwrap();
        assert_eq!(sched.jobs[&id].state, JobState::Running);

        // Owner: applied.
        sched.job_completed(1, &report, now).unwrap();
        assert_eq!(sched.jobs[&id].state, JobState::Completed);

        // Duplicate: discarded.
        sched.job_completed(1, &report, now).unwrap();
        assert_eq!(sched.jobs[&id].state, JobState::Completed);
    }

    #[test]
    fn nonzero_exit_or_signal_means_exited() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "batch", "node1", 10);
        sched.agents.login(1, "node1").unwrap();

        let id = add_pending_job(&mut sched, "batch", 50, now);
        sched.admission_sweep(now).unwrap();

        let mut report = Item::new();
        report.set_int(FieldId::JobId, id as i64);
        report.set_int(FieldId::ExitCode, 1);
        sched.job_completed(1, &report, now).unwrap();

        assert_eq!(sched.jobs[&id].state, JobState::Exited);
        assert_eq!(sched.totals.exited, 1);
    }

    #[test]
    fn deferred_release_wakes_elapsed_jobs() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "batch", "node1", 10);

        let id = add_pending_job(&mut sched, "batch", 50, now);
        {
            let job = sched.jobs.get_mut(&id).unwrap();
            job.defer_time = Some(now + chrono::Duration::seconds(30));
            job.settle(now);
            assert_eq!(job.state, JobState::Deferred);
        }

        assert_eq!(sched.release_deferred(now).unwrap(), 0);
        assert_eq!(
            sched
                .release_deferred(now + chrono::Duration::seconds(31))
                .unwrap(),
            1
        );
        assert_eq!(sched.jobs[&id].state, JobState::Pending);
    }

    #[test]
    fn agent_loss_requeues_running_jobs_and_releases_resources() {
        let (mut sched, _dir) = scheduler();
        let now = Utc::now();
        open_started_queue(&mut sched, "batch", "node1", 10);
        sched.agents.login(1, "node1").unwrap();
        sched
            .resources
            .insert("licence".into(), Resource::new("licence".into(), 2).unwrap());

        let id = add_pending_job(&mut sched, "batch", 50, now);
        sched.jobs.get_mut(&id).unwrap().resources = vec![ResourceRequest {
            name: "licence".into(),
            count: 2,
        }];
        sched.admission_sweep(now).unwrap();
        assert_eq!(sched.resources["licence"].inuse, 2);

        sched.agent_lost(1, now).unwrap();
        assert_eq!(sched.jobs[&id].state, JobState::Pending);
        assert!(sched.jobs[&id].start_time.is_none());
        assert_eq!(sched.resources["licence"].inuse, 0);
        assert_eq!(sched.queues["batch"].running, 0);

        // Agent returns; the job runs again.
        sched.agents.login(3, "node1").unwrap();
        assert_eq!(sched.admission_sweep(now).unwrap().len(), 1);
    }
}
