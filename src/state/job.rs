use chrono::{DateTime, TimeZone, Utc};

use crate::error::{BatchdError, Result};
use crate::protocol::{FieldId, Item};

/// Job state. Exactly one state holds at any time; the wire representation
/// uses one bit per state so clients can filter with a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Pending,
    Deferred,
    Holding,
    Completed,
    Exited,
}

impl JobState {
    pub fn mask(self) -> i64 {
        match self {
            JobState::Running => 0x01,
            JobState::Pending => 0x02,
            JobState::Deferred => 0x04,
            JobState::Holding => 0x08,
            JobState::Completed => 0x10,
            JobState::Exited => 0x20,
        }
    }

    pub fn from_mask(mask: i64) -> Option<JobState> {
        match mask {
            0x01 => Some(JobState::Running),
            0x02 => Some(JobState::Pending),
            0x04 => Some(JobState::Deferred),
            0x08 => Some(JobState::Holding),
            0x10 => Some(JobState::Completed),
            0x20 => Some(JobState::Exited),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Exited)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Pending => write!(f, "pending"),
            JobState::Deferred => write!(f, "deferred"),
            JobState::Holding => write!(f, "holding"),
            JobState::Completed => write!(f, "completed"),
            JobState::Exited => write!(f, "exited"),
        }
    }
}

/// A requested amount of a named counted resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub name: String,
    pub count: i64,
}

impl ResourceRequest {
    /// Parse the wire form `name` or `name:count`.
    pub fn parse(raw: &str) -> Result<ResourceRequest> {
        let (name, count) = match raw.split_once(':') {
            Some((name, count)) => {
                let count: i64 = count
                    .parse()
                    .map_err(|_| BatchdError::InvalidRequest(format!("bad resource request '{raw}'")))?;
                (name, count)
            }
            None => (raw, 1),
        };
        if name.is_empty() || count < 1 {
            return Err(BatchdError::InvalidRequest(format!(
                "bad resource request '{raw}'"
            )));
        }
        Ok(ResourceRequest {
            name: name.to_string(),
            count,
        })
    }

    pub fn to_wire(&self) -> String {
        format!("{}:{}", self.name, self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub name: String,
    pub queue: String,
    pub uid: u32,
    pub priority: i64,
    pub nice: i64,
    pub hold: bool,
    pub defer_time: Option<DateTime<Utc>>,
    pub shell: Option<String>,
    pub pre_cmd: Option<String>,
    pub post_cmd: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub args: Vec<String>,
    pub envs: Vec<String>,
    pub tags: Vec<String>,
    pub resources: Vec<ResourceRequest>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub signal: Option<i64>,
    pub pid: Option<i64>,
    pub state: JobState,
}

pub const DEFAULT_JOB_PRIORITY: i64 = 100;

impl Job {
    pub fn new(id: u64, name: String, queue: String, submit_time: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            queue,
            uid: 0,
            priority: DEFAULT_JOB_PRIORITY,
            nice: 0,
            hold: false,
            defer_time: None,
            shell: None,
            pre_cmd: None,
            post_cmd: None,
            stdout_path: None,
            stderr_path: None,
            args: Vec::new(),
            envs: Vec::new(),
            tags: Vec::new(),
            resources: Vec::new(),
            submit_time,
            start_time: None,
            finish_time: None,
            exit_code: None,
            signal: None,
            pid: None,
            state: JobState::Pending,
        }
    }

    /// Resolve the state a newly submitted or restarted job settles into:
    /// HOLDING if held, DEFERRED while its defer time is in the future,
    /// otherwise PENDING.
    pub fn settle(&mut self, now: DateTime<Utc>) {
        self.state = if self.hold {
            JobState::Holding
        } else if self.defer_time.is_some_and(|t| t > now) {
            JobState::Deferred
        } else {
            JobState::Pending
        };
    }

    /// Clear a finished run so the job can go through admission again.
    pub fn reset_for_restart(&mut self, now: DateTime<Utc>) {
        self.start_time = None;
        self.finish_time = None;
        self.exit_code = None;
        self.signal = None;
        self.pid = None;
        self.settle(now);
    }

    /// Serialize every attribute into a protocol item. Used for replies,
    /// dispatch directives, journal records and snapshots alike.
    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.set_int(FieldId::JobId, self.id as i64);
        item.set_str(FieldId::JobName, self.name.clone());
        item.set_str(FieldId::QueueName, self.queue.clone());
        item.set_int(FieldId::Uid, self.uid as i64);
        item.set_int(FieldId::Priority, self.priority);
        item.set_int(FieldId::Nice, self.nice);
        item.set_bool(FieldId::Hold, self.hold);
        item.set_int(FieldId::SubmitTime, self.submit_time.timestamp());
        item.set_int(FieldId::State, self.state.mask());
        if let Some(t) = self.defer_time {
            item.set_int(FieldId::DeferTime, t.timestamp());
        }
        if let Some(s) = &self.shell {
            item.set_str(FieldId::Shell, s.clone());
        }
        if let Some(s) = &self.pre_cmd {
            item.set_str(FieldId::PreCmd, s.clone());
        }
        if let Some(s) = &self.post_cmd {
            item.set_str(FieldId::PostCmd, s.clone());
        }
        if let Some(s) = &self.stdout_path {
            item.set_str(FieldId::Stdout, s.clone());
        }
        if let Some(s) = &self.stderr_path {
            item.set_str(FieldId::Stderr, s.clone());
        }
        if !self.args.is_empty() {
            item.set_array(FieldId::Args, self.args.clone());
        }
        if !self.envs.is_empty() {
            item.set_array(FieldId::Envs, self.envs.clone());
        }
        if !self.tags.is_empty() {
            item.set_array(FieldId::Tags, self.tags.clone());
        }
        if !self.resources.is_empty() {
            item.set_array(
                FieldId::Resources,
                self.resources.iter().map(ResourceRequest::to_wire).collect(),
            );
        }
        if let Some(t) = self.start_time {
            item.set_int(FieldId::StartTime, t.timestamp());
        }
        if let Some(t) = self.finish_time {
            item.set_int(FieldId::FinishTime, t.timestamp());
        }
        if let Some(code) = self.exit_code {
            item.set_int(FieldId::ExitCode, code);
        }
        if let Some(sig) = self.signal {
            item.set_int(FieldId::Signal, sig);
        }
        if let Some(pid) = self.pid {
            item.set_int(FieldId::JobPid, pid);
        }
        item
    }

    /// Rebuild a job from a journal or snapshot record.
    pub fn from_item(item: &Item) -> Result<Job> {
        let id = item
            .get_int(FieldId::JobId)
            .ok_or_else(|| BatchdError::Journal("job record missing id".into()))? as u64;
        let name = item
            .get_str(FieldId::JobName)
            .ok_or_else(|| BatchdError::Journal("job record missing name".into()))?
            .to_string();
        let queue = item
            .get_str(FieldId::QueueName)
            .ok_or_else(|| BatchdError::Journal("job record missing queue".into()))?
            .to_string();
        let submit_time = epoch(
            item.get_int(FieldId::SubmitTime)
                .ok_or_else(|| BatchdError::Journal("job record missing submit time".into()))?,
        )?;

        let mut job = Job::new(id, name, queue, submit_time);
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
            job.defer_time = Some(epoch(t)?);
        }
        job.shell = item.get_str(FieldId::Shell).map(str::to_string);
        job.pre_cmd = item.get_str(FieldId::PreCmd).map(str::to_string);
        job.post_cmd = item.get_str(FieldId::PostCmd).map(str::to_string);
        job.stdout_path = item.get_str(FieldId::Stdout).map(str::to_string);
        job.stderr_path = item.get_str(FieldId::Stderr).map(str::to_string);
        job.args = item.get_array(FieldId::Args).unwrap_or_default().to_vec();
        job.envs = item.get_array(FieldId::Envs).unwrap_or_default().to_vec();
        job.tags = item.get_array(FieldId::Tags).unwrap_or_default().to_vec();
        if let Some(raw) = item.get_array(FieldId::Resources) {
            job.resources = raw
                .iter()
                .map(|r| ResourceRequest::parse(r))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(t) = item.get_int(FieldId::StartTime) {
            job.start_time = Some(epoch(t)?);
        }
        if let Some(t) = item.get_int(FieldId::FinishTime) {
            job.finish_time = Some(epoch(t)?);
        }
        job.exit_code = item.get_int(FieldId::ExitCode);
        job.signal = item.get_int(FieldId::Signal);
        job.pid = item.get_int(FieldId::JobPid);
        if let Some(mask) = item.get_int(FieldId::State) {
            job.state = JobState::from_mask(mask)
                .ok_or_else(|| BatchdError::Journal(format!("bad state mask {mask}")))?;
        }
        Ok(job)
    }
}

fn epoch(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| BatchdError::Journal(format!("bad timestamp {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_state_bit() {
        for state in [
            JobState::Running,
            JobState::Pending,
            JobState::Deferred,
            JobState::Holding,
            JobState::Completed,
            JobState::Exited,
        ] {
            assert_eq!(state.mask().count_ones(), 1);
            assert_eq!(JobState::from_mask(state.mask()), Some(state));
        }
        assert_eq!(JobState::from_mask(0x03), None);
    }

    #[test]
    fn settle_picks_single_state() {
        let now = Utc::now();
        let mut job = Job::new(1, "j".into(), "q".into(), now);

        job.settle(now);
        assert_eq!(job.state, JobState::Pending);

        job.hold = true;
        job.settle(now);
        assert_eq!(job.state, JobState::Holding);

        job.hold = false;
        job.defer_time = Some(now + chrono::Duration::seconds(60));
        job.settle(now);
        assert_eq!(job.state, JobState::Deferred);

        // An elapsed defer time no longer defers
        job.defer_time = Some(now - chrono::Duration::seconds(60));
        job.settle(now);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn resource_request_parse() {
        let r = ResourceRequest::parse("licence:3").unwrap();
        assert_eq!(r.name, "licence");
        assert_eq!(r.count, 3);

        let r = ResourceRequest::parse("gpu").unwrap();
        assert_eq!(r.count, 1);

        assert!(ResourceRequest::parse("licence:x").is_err());
        assert!(ResourceRequest::parse(":3").is_err());
        assert!(ResourceRequest::parse("licence:0").is_err());
    }

    #[test]
    fn item_round_trip() {
        let now = epoch(Utc::now().timestamp()).unwrap();
        let mut job = Job::new(9, "nightly".into(), "batch".into(), now);
        job.priority = 50;
        job.hold = true;
        job.args = vec!["a".into(), "b".into()];
        job.resources = vec![ResourceRequest {
            name: "licence".into(),
            count: 2,
        }];
        job.settle(now);

        let rebuilt = Job::from_item(&job.to_item()).unwrap();
        assert_eq!(rebuilt, job);
    }
}
