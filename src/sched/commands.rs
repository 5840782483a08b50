use chrono::{DateTime, TimeZone, Utc};
use tracing::info;

use super::{Dispatch, Scheduler};
use crate::error::{BatchdError, Result};
use crate::net::ConnId;
use crate::protocol::{commands as cmd, FieldId, Item, Message};
use crate::state::{Job, JobState, Queue, QueueFlags, Resource, ResourceRequest};

impl Scheduler {
    /// Run one client command to completion. Validation failures become an
    /// error reply for the requester; nothing is journaled for them.
    pub fn run_client_command(&mut self, msg: &Message, now: DateTime<Utc>) -> (Message, Vec<Dispatch>) {
        match self.client_command(msg, now) {
            Ok(outcome) => outcome,
            Err(e) => (Message::error_reply(&msg.command, e.to_string()), Vec::new()),
        }
    }

    fn client_command(&mut self, msg: &Message, now: DateTime<Utc>) -> Result<(Message, Vec<Dispatch>)> {
        let reply = match msg.command.as_str() {
            cmd::ADD_JOB => self.add_job(required_item(msg)?, now)?,
            cmd::MOD_JOB => self.mod_job(required_item(msg)?, now)?,
            cmd::GET_JOB => self.get_job(required_item(msg)?)?,
            cmd::DEL_JOB => self.del_job(required_item(msg)?)?,
            cmd::SIG_JOB => {
                let (reply, dispatch) = self.sig_job(required_item(msg)?)?;
                return Ok((reply, vec![dispatch]));
            }
            cmd::ADD_QUEUE => self.add_queue(required_item(msg)?)?,
            cmd::MOD_QUEUE => self.mod_queue(required_item(msg)?)?,
            cmd::GET_QUEUE => self.get_queue(required_item(msg)?)?,
            cmd::DEL_QUEUE => self.del_queue(required_item(msg)?)?,
            cmd::ADD_RES => self.add_res(required_item(msg)?)?,
            cmd::MOD_RES => self.mod_res(required_item(msg)?)?,
            cmd::GET_RES => self.get_res(required_item(msg)?)?,
            cmd::DEL_RES => self.del_res(required_item(msg)?)?,
            cmd::STATS => self.stats()?,
            other => {
                return Err(BatchdError::InvalidRequest(format!(
                    "unknown command '{other}'"
                )))
            }
        };
        Ok((reply, Vec::new()))
    }

    /// Run one agent command to completion. Errors here are protocol-level
    /// and fatal to the agent connection.
    pub fn run_agent_command(&mut self, conn: ConnId, msg: &Message, now: DateTime<Utc>) -> Result<()> {
        match msg.command.as_str() {
            cmd::AGENT_LOGIN => {
                let node = required_item(msg)?
                    .get_str(FieldId::Node)
                    .ok_or_else(|| BatchdError::InvalidRequest("login without node".into()))?
                    .to_string();
                self.agents.login(conn, &node)
            }
            cmd::JOB_STARTED => self.job_started(conn, required_item(msg)?),
            cmd::JOB_COMPLETED => self.job_completed(conn, required_item(msg)?, now),
            other => Err(BatchdError::Protocol(format!(
                "unexpected agent command '{other}'"
            ))),
        }
    }

    fn add_job(&mut self, item: &Item, now: DateTime<Utc>) -> Result<Message> {
        let name = item
            .get_str(FieldId::JobName)
            .ok_or_else(|| BatchdError::InvalidRequest("job name is required".into()))?
            .to_string();
        let queue_name = item
            .get_str(FieldId::QueueName)
            .ok_or_else(|| BatchdError::InvalidRequest("queue is required".into()))?
            .to_string();
        let queue = self
            .queues
            .get(&queue_name)
            .ok_or_else(|| BatchdError::QueueNotFound(queue_name.clone()))?;
        if !queue.accepts_jobs() {
            return Err(BatchdError::InvalidRequest(format!(
                "queue {queue_name} is closed to submissions"
            )));
        }

        let resources = self.parse_resource_requests(item)?;

        let id = self.assign_job_id();
        let mut job = Job::new(id, name, queue_name, now);
        job.resources = resources;
        if let Some(uid) = item.get_int(FieldId::Uid) {
            job.uid = uid as u32;
        }
        if let Some(p) = item.get_int(FieldId::Priority) {
            job.priority = p;
        }
        if let Some(n) = item.get_int(FieldId::Nice) {
            job.nice = n;
        }
        if let Some(h) = item.get_bool(FieldId::Hold) {
            job.hold = h;
        }
        if let Some(t) = item.get_int(FieldId::DeferTime) {
            job.defer_time = Some(timestamp(t)?);
        }
        job.shell = item.get_str(FieldId::Shell).map(str::to_string);
        job.pre_cmd = item.get_str(FieldId::PreCmd).map(str::to_string);
        job.post_cmd = item.get_str(FieldId::PostCmd).map(str::to_string);
        job.stdout_path = item.get_str(FieldId::Stdout).map(str::to_string);
        job.stderr_path = item.get_str(FieldId::Stderr).map(str::to_string);
        job.args = item.get_array(FieldId::Args).unwrap_or_default().to_vec();
        job.envs = item.get_array(FieldId::Envs).unwrap_or_default().to_vec();
        job.tags = item.get_array(FieldId::Tags).unwrap_or_default().to_vec();
        job.settle(now);

        let record = Message::with_item(cmd::ADD_JOB, job.to_item());
        let state = job.state;
        self.jobs.insert(id, job);
        self.totals.submitted += 1;
        self.journal_record(&record)?;

        info!(job_id = id, state = %state, "job submitted");
        let mut reply_item = Item::new();
        reply_item.set_int(FieldId::JobId, id as i64);
        Ok(Message::with_item(cmd::ADD_JOB, reply_item))
    }

    fn mod_job(&mut self, item: &Item, now: DateTime<Utc>) -> Result<Message> {
        let id = required_job_id(item)?;
        if !self.jobs.contains_key(&id) {
            return Err(BatchdError::JobNotFound(id));
        }

        // Validate references before mutating anything.
        if let Some(queue_name) = item.get_str(FieldId::QueueName) {
            if !self.queues.contains_key(queue_name) {
                return Err(BatchdError::QueueNotFound(queue_name.to_string()));
            }
        }
        let resources = if item.is_set(FieldId::Resources) {
            Some(self.parse_resource_requests(item)?)
        } else {
            None
        };
        if item.get_bool(FieldId::Restart) == Some(true)
            && !self.jobs[&id].state.is_terminal()
        {
            return Err(BatchdError::InvalidRequest(format!(
                "job {id} is not finished, cannot restart"
            )));
        }

        let job = self.jobs.get_mut(&id).expect("checked above");
        if let Some(queue_name) = item.get_str(FieldId::QueueName) {
            job.queue = queue_name.to_string();
        }
        if let Some(p) = item.get_int(FieldId::Priority) {
            job.priority = p;
        }
        if let Some(n) = item.get_int(FieldId::Nice) {
            job.nice = n;
        }
        if let Some(h) = item.get_bool(FieldId::Hold) {
            job.hold = h;
        }
        if item.is_set(FieldId::DeferTime) {
            let t = item.get_int(FieldId::DeferTime).expect("bit checked");
            job.defer_time = if t == 0 { None } else { Some(timestamp(t)?) };
        }
        if let Some(tags) = item.get_array(FieldId::Tags) {
            job.tags = tags.to_vec();
        }
        if let Some(resources) = resources {
            job.resources = resources;
        }
        if item.get_bool(FieldId::Restart) == Some(true) {
            job.reset_for_restart(now);
        } else if !matches!(job.state, JobState::Running) && !job.state.is_terminal() {
            // Hold/defer changes take effect immediately for waiting jobs;
            // a RUNNING job keeps its dispatched run and picks the new
            // attributes up on a later admission.
            job.settle(now);
        }

        let reply = Message::with_item(cmd::MOD_JOB, job.to_item());
        self.journal_job(id)?;
        Ok(reply)
    }

    fn get_job(&self, item: &Item) -> Result<Message> {
        if let Some(id) = item.get_int(FieldId::JobId) {
            let job = self
                .jobs
                .get(&(id as u64))
                .ok_or(BatchdError::JobNotFound(id as u64))?;
            return Ok(Message::with_item(cmd::GET_JOB, job.to_item()));
        }

        let queue_filter = item.get_str(FieldId::QueueName);
        let state_mask = item.get_int(FieldId::State).unwrap_or(!0);
        let mut matches: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| queue_filter.is_none_or(|q| j.queue == q))
            .filter(|j| j.state.mask() & state_mask != 0)
            .collect();
        matches.sort_by_key(|j| j.id);

        let mut reply = Message::new(cmd::GET_JOB);
        reply.items = matches.iter().map(|j| j.to_item()).collect();
        Ok(reply)
    }

    fn del_job(&mut self, item: &Item) -> Result<Message> {
        let id = required_job_id(item)?;
        let job = self.jobs.get(&id).ok_or(BatchdError::JobNotFound(id))?;
        if job.state == JobState::Running {
            return Err(BatchdError::InvalidRequest(format!(
                "job {id} is running, cannot delete"
            )));
        }
        self.jobs.remove(&id);

        let mut record_item = Item::new();
        record_item.set_int(FieldId::JobId, id as i64);
        self.journal_record(&Message::with_item(cmd::DEL_JOB, record_item))?;
        info!(job_id = id, "job deleted");
        Ok(Message::new(cmd::DEL_JOB))
    }

    fn sig_job(&mut self, item: &Item) -> Result<(Message, Dispatch)> {
        let id = required_job_id(item)?;
        let signal = item
            .get_int(FieldId::Signal)
            .ok_or_else(|| BatchdError::InvalidRequest("signal is required".into()))?;
        let job = self.jobs.get(&id).ok_or(BatchdError::JobNotFound(id))?;
        if job.state != JobState::Running {
            return Err(BatchdError::InvalidRequest(format!(
                "job {id} is not running"
            )));
        }
        let conn = self
            .agents
            .owner_of(id)
            .ok_or_else(|| BatchdError::InvalidRequest(format!("job {id} has no owning agent")))?;

        // Just a forwarded command; the result comes back as a completion
        // report correlated by job id.
        let mut directive_item = Item::new();
        directive_item.set_int(FieldId::JobId, id as i64);
        directive_item.set_int(FieldId::Signal, signal);
        let dispatch = Dispatch {
            conn,
            message: Message::with_item(cmd::SIG_JOB, directive_item),
        };
        Ok((Message::new(cmd::SIG_JOB), dispatch))
    }

    fn add_queue(&mut self, item: &Item) -> Result<Message> {
        let name = item
            .get_str(FieldId::QueueName)
            .ok_or_else(|| BatchdError::InvalidRequest("queue name is required".into()))?
            .to_string();
        if self.queues.contains_key(&name) {
            return Err(BatchdError::AlreadyExists(format!("queue {name}")));
        }
        let node = item
            .get_str(FieldId::Node)
            .ok_or_else(|| BatchdError::InvalidRequest("queue node is required".into()))?
            .to_string();

        let mut queue = Queue::new(name, node)?;
        apply_queue_fields(&mut queue, item)?;

        let record = Message::with_item(cmd::ADD_QUEUE, queue.to_item());
        info!(queue = %queue.name, node = %queue.node, "queue added");
        self.queues.insert(queue.name.clone(), queue);
        self.journal_record(&record)?;
        Ok(Message::new(cmd::ADD_QUEUE))
    }

    fn mod_queue(&mut self, item: &Item) -> Result<Message> {
        let name = item
            .get_str(FieldId::QueueName)
            .ok_or_else(|| BatchdError::InvalidRequest("queue name is required".into()))?;
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| BatchdError::QueueNotFound(name.to_string()))?;
        apply_queue_fields(queue, item)?;
        if let Some(node) = item.get_str(FieldId::Node) {
            queue.node = node.to_string();
        }

        let record = Message::with_item(cmd::MOD_QUEUE, queue.to_item());
        self.journal_record(&record)?;
        Ok(Message::new(cmd::MOD_QUEUE))
    }

    fn get_queue(&self, item: &Item) -> Result<Message> {
        let mut reply = Message::new(cmd::GET_QUEUE);
        if let Some(name) = item.get_str(FieldId::QueueName) {
            let queue = self
                .queues
                .get(name)
                .ok_or_else(|| BatchdError::QueueNotFound(name.to_string()))?;
            reply.items.push(self.queue_item_with_stats(queue));
            return Ok(reply);
        }
        let mut queues: Vec<&Queue> = self.queues.values().collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        reply.items = queues
            .iter()
            .map(|q| self.queue_item_with_stats(q))
            .collect();
        Ok(reply)
    }

    /// Queue item plus its derived per-state job counters.
    fn queue_item_with_stats(&self, queue: &Queue) -> Item {
        let mut item = queue.to_item();
        let mut counts = [0i64; 6];
        for job in self.jobs.values() {
            if job.queue != queue.name {
                continue;
            }
            let slot = match job.state {
                JobState::Running => 0,
                JobState::Pending => 1,
                JobState::Deferred => 2,
                JobState::Holding => 3,
                JobState::Completed => 4,
                JobState::Exited => 5,
            };
            counts[slot] += 1;
        }
        item.set_int(FieldId::StatsRunning, counts[0]);
        item.set_int(FieldId::StatsPending, counts[1]);
        item.set_int(FieldId::StatsDeferred, counts[2]);
        item.set_int(FieldId::StatsHolding, counts[3]);
        item.set_int(FieldId::StatsCompleted, counts[4]);
        item.set_int(FieldId::StatsExited, counts[5]);
        item
    }

    fn del_queue(&mut self, item: &Item) -> Result<Message> {
        let name = item
            .get_str(FieldId::QueueName)
            .ok_or_else(|| BatchdError::InvalidRequest("queue name is required".into()))?
            .to_string();
        if !self.queues.contains_key(&name) {
            return Err(BatchdError::QueueNotFound(name));
        }
        if self.queue_referenced(&name) {
            return Err(BatchdError::InvalidRequest(format!(
                "queue {name} still has jobs"
            )));
        }
        self.queues.remove(&name);

        let mut record_item = Item::new();
        record_item.set_str(FieldId::QueueName, name.clone());
        self.journal_record(&Message::with_item(cmd::DEL_QUEUE, record_item))?;
        info!(queue = %name, "queue deleted");
        Ok(Message::new(cmd::DEL_QUEUE))
    }

    fn add_res(&mut self, item: &Item) -> Result<Message> {
        let name = item
            .get_str(FieldId::ResName)
            .ok_or_else(|| BatchdError::InvalidRequest("resource name is required".into()))?
            .to_string();
        if self.resources.contains_key(&name) {
            return Err(BatchdError::AlreadyExists(format!("resource {name}")));
        }
        let count = item.get_int(FieldId::ResCount).unwrap_or(1);
        let res = Resource::new(name, count)?;

        let record = Message::with_item(cmd::ADD_RES, res.to_item());
        info!(resource = %res.name, count, "resource added");
        self.resources.insert(res.name.clone(), res);
        self.journal_record(&record)?;
        Ok(Message::new(cmd::ADD_RES))
    }

    fn mod_res(&mut self, item: &Item) -> Result<Message> {
        let name = item
            .get_str(FieldId::ResName)
            .ok_or_else(|| BatchdError::InvalidRequest("resource name is required".into()))?;
        let res = self
            .resources
            .get_mut(name)
            .ok_or_else(|| BatchdError::ResourceNotFound(name.to_string()))?;
        if let Some(count) = item.get_int(FieldId::ResCount) {
            res.set_count(count)?;
        }

        let record = Message::with_item(cmd::MOD_RES, res.to_item());
        self.journal_record(&record)?;
        Ok(Message::new(cmd::MOD_RES))
    }

    fn get_res(&self, item: &Item) -> Result<Message> {
        let mut reply = Message::new(cmd::GET_RES);
        if let Some(name) = item.get_str(FieldId::ResName) {
            let res = self
                .resources
                .get(name)
                .ok_or_else(|| BatchdError::ResourceNotFound(name.to_string()))?;
            reply.items.push(res.to_item());
            return Ok(reply);
        }
        let mut resources: Vec<&Resource> = self.resources.values().collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        reply.items = resources.iter().map(|r| r.to_item()).collect();
        Ok(reply)
    }

    fn del_res(&mut self, item: &Item) -> Result<Message> {
        let name = item
            .get_str(FieldId::ResName)
            .ok_or_else(|| BatchdError::InvalidRequest("resource name is required".into()))?
            .to_string();
        if !self.resources.contains_key(&name) {
            return Err(BatchdError::ResourceNotFound(name));
        }
        if self.resource_referenced(&name) {
            return Err(BatchdError::InvalidRequest(format!(
                "resource {name} is still requested by jobs"
            )));
        }
        self.resources.remove(&name);

        let mut record_item = Item::new();
        record_item.set_str(FieldId::ResName, name.clone());
        self.journal_record(&Message::with_item(cmd::DEL_RES, record_item))?;
        info!(resource = %name, "resource deleted");
        Ok(Message::new(cmd::DEL_RES))
    }

    fn stats(&self) -> Result<Message> {
        let mut item = Item::new();
        for (state, count) in self.state_counts() {
            let id = match state {
                JobState::Running => FieldId::StatsRunning,
                JobState::Pending => FieldId::StatsPending,
                JobState::Deferred => FieldId::StatsDeferred,
                JobState::Holding => FieldId::StatsHolding,
                JobState::Completed => FieldId::StatsCompleted,
                JobState::Exited => FieldId::StatsExited,
            };
            item.set_int(id, count);
        }
        item.set_int(FieldId::StatsTotalSubmitted, self.totals.submitted);
        item.set_int(FieldId::StatsTotalStarted, self.totals.started);
        item.set_int(FieldId::StatsTotalCompleted, self.totals.completed);
        item.set_int(FieldId::StatsTotalExited, self.totals.exited);
        Ok(Message::with_item(cmd::STATS, item))
    }

    fn parse_resource_requests(&self, item: &Item) -> Result<Vec<ResourceRequest>> {
        let Some(raw) = item.get_array(FieldId::Resources) else {
            return Ok(Vec::new());
        };
        let requests = raw
            .iter()
            .map(|r| ResourceRequest::parse(r))
            .collect::<Result<Vec<_>>>()?;
        for req in &requests {
            if !self.resources.contains_key(&req.name) {
                return Err(BatchdError::ResourceNotFound(req.name.clone()));
            }
        }
        Ok(requests)
    }
}

fn required_item(msg: &Message) -> Result<&Item> {
    msg.item()
        .ok_or_else(|| BatchdError::InvalidRequest(format!("{} without item", msg.command)))
}

fn required_job_id(item: &Item) -> Result<u64> {
    item.get_int(FieldId::JobId)
        .map(|n| n as u64)
        .ok_or_else(|| BatchdError::InvalidRequest("job id is required".into()))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| BatchdError::InvalidRequest(format!("bad timestamp {secs}")))
}

fn apply_queue_fields(queue: &mut Queue, item: &Item) -> Result<()> {
    if let Some(desc) = item.get_str(FieldId::Desc) {
        queue.set_desc(desc)?;
    }
    if let Some(limit) = item.get_int(FieldId::JobLimit) {
        queue.set_job_limit(limit)?;
    }
    if let Some(priority) = item.get_int(FieldId::Priority) {
        queue.set_priority(priority)?;
    }
    if let Some(bits) = item.get_int(FieldId::State) {
        queue.flags = QueueFlags::from_bits(bits as u16).ok_or_else(|| {
            BatchdError::InvalidRequest(format!("bad queue state {bits:#x}"))
        })?;
    }
    Ok(())
}
