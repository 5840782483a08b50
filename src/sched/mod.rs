pub mod admission;
pub mod agent;
pub mod commands;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{BatchdError, Result};
use crate::journal::Journal;
use crate::protocol::{commands as cmd, FieldId, Item, Message};
use crate::state::{Job, JobState, Queue, Resource, ResourceRequest};

pub use admission::Dispatch;
pub use agent::AgentRoster;

/// Lifetime counters. Persisted as an absolute `totals` record, written into
/// every snapshot and appended to the journal whenever a counter moves, so
/// the values survive restarts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub submitted: i64,
    pub started: i64,
    pub completed: i64,
    pub exited: i64,
}

impl Totals {
    pub fn to_item(self) -> Item {
        let mut item = Item::new();
        item.set_int(FieldId::StatsTotalSubmitted, self.submitted);
        item.set_int(FieldId::StatsTotalStarted, self.started);
        item.set_int(FieldId::StatsTotalCompleted, self.completed);
        item.set_int(FieldId::StatsTotalExited, self.exited);
        item
    }

    pub fn from_item(item: &Item) -> Totals {
        Totals {
            submitted: item.get_int(FieldId::StatsTotalSubmitted).unwrap_or(0),
            started: item.get_int(FieldId::StatsTotalStarted).unwrap_or(0),
            completed: item.get_int(FieldId::StatsTotalCompleted).unwrap_or(0),
            exited: item.get_int(FieldId::StatsTotalExited).unwrap_or(0),
        }
    }
}

/// What a dispatched run holds: the queue slot and resource amounts captured
/// at admission. Releases go through this, never through the job's current
/// fields, so a mod_job while the job runs cannot skew the accounting.
#[derive(Debug, Clone)]
pub(crate) struct RunLease {
    pub(crate) queue: String,
    pub(crate) resources: Vec<ResourceRequest>,
}

/// The scheduler context: exclusive owner of the job/queue/resource
/// collections, the agent roster and the journal handle. Mutated only by the
/// single event-loop task.
pub struct Scheduler {
    pub jobs: HashMap<u64, Job>,
    pub queues: HashMap<String, Queue>,
    pub resources: HashMap<String, Resource>,
    pub agents: AgentRoster,
    pub totals: Totals,
    leases: HashMap<u64, RunLease>,
    journal: Journal,
    next_job_id: u64,
    max_sched: usize,
    retention_ms: i64,
}

impl Scheduler {
    pub fn new(journal: Journal, config: &ServerConfig) -> Self {
        Self {
            jobs: HashMap::new(),
            queues: HashMap::new(),
            resources: HashMap::new(),
            agents: AgentRoster::default(),
            totals: Totals::default(),
            leases: HashMap::new(),
            journal,
            next_job_id: 1,
            max_sched: config.max_sched,
            retention_ms: config.retention_ms,
        }
    }

    /// Rebuild scheduler state from the snapshot and journal tail under
    /// `state_dir`. Runs before any listener binds; failure aborts startup.
    pub fn recover(state_dir: &Path, config: &ServerConfig) -> Result<Scheduler> {
        let records = Journal::replay(state_dir)?;
        let journal = Journal::open(state_dir)?;
        let mut sched = Scheduler::new(journal, config);

        for record in &records {
            sched.apply_record(record)?;
        }
        sched.reconcile_after_replay();

        info!(
            jobs = sched.jobs.len(),
            queues = sched.queues.len(),
            resources = sched.resources.len(),
            next_job_id = sched.next_job_id,
            "state recovered"
        );
        Ok(sched)
    }

    /// Apply one durable record. Replay path only; no journaling here.
    fn apply_record(&mut self, record: &Message) -> Result<()> {
        let item = record
            .item()
            .ok_or_else(|| BatchdError::Journal(format!("{} record without item", record.command)))?;

        match record.command.as_str() {
            cmd::ADD_JOB | cmd::JOB_STATE => {
                let job = Job::from_item(item)?;
                if record.command == cmd::ADD_JOB {
                    self.totals.submitted += 1;
                }
                self.next_job_id = self.next_job_id.max(job.id + 1);
                self.jobs.insert(job.id, job);
            }
            cmd::DEL_JOB => {
                let id = item
                    .get_int(FieldId::JobId)
                    .ok_or_else(|| BatchdError::Journal("del_job record missing id".into()))?;
                self.jobs.remove(&(id as u64));
            }
            cmd::ADD_QUEUE | cmd::MOD_QUEUE => {
                let queue = Queue::from_item(item)?;
                self.queues.insert(queue.name.clone(), queue);
            }
            cmd::DEL_QUEUE => {
                let name = item
                    .get_str(FieldId::QueueName)
                    .ok_or_else(|| BatchdError::Journal("del_queue record missing name".into()))?;
                self.queues.remove(name);
            }
            cmd::ADD_RES | cmd::MOD_RES => {
                let res = Resource::from_item(item)?;
                self.resources.insert(res.name.clone(), res);
            }
            cmd::DEL_RES => {
                let name = item
                    .get_str(FieldId::ResName)
                    .ok_or_else(|| BatchdError::Journal("del_res record missing name".into()))?;
                self.resources.remove(name);
            }
            cmd::TOTALS => {
                self.totals = Totals::from_item(item);
            }
            other => {
                return Err(BatchdError::Journal(format!("unknown record '{other}'")));
            }
        }
        Ok(())
    }

    /// Post-replay fixups: no agent owns anything yet, so jobs recorded as
    /// RUNNING are requeued (same policy as agent loss), and the derived
    /// queue counters and resource reservations are recomputed from scratch.
    fn reconcile_after_replay(&mut self) {
        for queue in self.queues.values_mut() {
            queue.running = 0;
        }
        for res in self.resources.values_mut() {
            res.inuse = 0;
        }
        let now = Utc::now();
        for job in self.jobs.values_mut() {
            if job.state == JobState::Running {
                warn!(job_id = job.id, "job was running at shutdown, requeueing");
                job.reset_for_restart(now);
            }
        }
    }

    pub fn assign_job_id(&mut self) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    /// Append a full-state upsert for a mutated job.
    pub(crate) fn journal_job(&mut self, id: u64) -> Result<()> {
        let record = {
            let job = self
                .jobs
                .get(&id)
                .ok_or(BatchdError::JobNotFound(id))?;
            Message::with_item(cmd::JOB_STATE, job.to_item())
        };
        self.journal.append(&record)
    }

    pub(crate) fn journal_record(&mut self, record: &Message) -> Result<()> {
        self.journal.append(record)
    }

    pub fn journal_dirty(&self) -> bool {
        self.journal.is_dirty()
    }

    pub fn flush_journal(&mut self) -> Result<()> {
        self.journal.flush()
    }

    /// Serialize the whole state and truncate the journal. Jobs go out as
    /// plain state upserts; only live `add_job` records count as submissions
    /// on replay, the lifetime totals travel in their own record.
    pub fn save_snapshot(&mut self) -> Result<()> {
        let mut records: Vec<Message> = Vec::new();
        records.push(Message::with_item(cmd::TOTALS, self.totals.to_item()));
        for queue in self.queues.values() {
            records.push(Message::with_item(cmd::ADD_QUEUE, queue.to_item()));
        }
        for res in self.resources.values() {
            records.push(Message::with_item(cmd::ADD_RES, res.to_item()));
        }
        for job in self.jobs.values() {
            records.push(Message::with_item(cmd::JOB_STATE, job.to_item()));
        }
        self.journal.write_snapshot(records)
    }

    /// Append the current lifetime totals to the journal.
    pub(crate) fn journal_totals(&mut self) -> Result<()> {
        let record = Message::with_item(cmd::TOTALS, self.totals.to_item());
        self.journal.append(&record)
    }

    /// Remove terminal jobs past the retention window, at most `max` per
    /// sweep to bound loop latency. Returns the number removed.
    pub fn cleanup_sweep(&mut self, now: DateTime<Utc>, max: usize) -> Result<usize> {
        let cutoff = now - chrono::Duration::milliseconds(self.retention_ms);
        let expired: Vec<u64> = self
            .jobs
            .values()
            .filter(|j| j.state.is_terminal() && j.finish_time.is_some_and(|t| t < cutoff))
            .map(|j| j.id)
            .take(max)
            .collect();

        for id in &expired {
            self.jobs.remove(id);
            let mut item = crate::protocol::Item::new();
            item.set_int(FieldId::JobId, *id as i64);
            self.journal_record(&Message::with_item(cmd::DEL_JOB, item))?;
            debug!(job_id = id, "terminal job cleaned up");
        }
        Ok(expired.len())
    }

    pub fn max_sched(&self) -> usize {
        self.max_sched
    }

    /// Per-state job counts over the active collection.
    pub fn state_counts(&self) -> [(JobState, i64); 6] {
        let mut counts = [
            (JobState::Running, 0),
            (JobState::Pending, 0),
            (JobState::Deferred, 0),
            (JobState::Holding, 0),
            (JobState::Completed, 0),
            (JobState::Exited, 0),
        ];
        for job in self.jobs.values() {
            for slot in counts.iter_mut() {
                if slot.0 == job.state {
                    slot.1 += 1;
                }
            }
        }
        counts
    }

    /// True if any active job references the queue.
    pub fn queue_referenced(&self, name: &str) -> bool {
        self.jobs.values().any(|j| j.queue == name)
    }

    /// True if any active job requests the resource.
    pub fn resource_referenced(&self, name: &str) -> bool {
        self.jobs
            .values()
            .any(|j| j.resources.iter().any(|r| r.name == name))
    }
}
