use crate::error::{BatchdError, Result};
use crate::protocol::{FieldId, Item};

pub const QUEUE_NAME_MAX: usize = 16;
pub const QUEUE_DESC_MAX: usize = 128;
pub const QUEUE_MAX_PRIORITY: i64 = 128;
pub const QUEUE_MAX_LIMIT: i64 = 1024;
pub const QUEUE_DEFAULT_PRIORITY: i64 = 100;
pub const QUEUE_DEFAULT_LIMIT: i64 = 1;
const QUEUE_INVALID_CHARS: &[char] = &['/', '\\', ' ', '$'];

/// OPEN/STARTED are orthogonal, not exclusive, so they stay a two-bit flag
/// set rather than an enum: a queue can accept submissions while stopped, or
/// run existing jobs while closed to new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags(u16);

impl QueueFlags {
    /// Jobs can run.
    pub const STARTED: QueueFlags = QueueFlags(0x0001);
    /// Jobs can be submitted.
    pub const OPEN: QueueFlags = QueueFlags(0x0002);

    pub const fn empty() -> QueueFlags {
        QueueFlags(0)
    }

    pub fn from_bits(bits: u16) -> Option<QueueFlags> {
        if bits & !(Self::STARTED.0 | Self::OPEN.0) != 0 {
            return None;
        }
        Some(QueueFlags(bits))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: QueueFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: QueueFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: QueueFlags) {
        self.0 &= !other.0;
    }
}

impl Default for QueueFlags {
    fn default() -> Self {
        QueueFlags::OPEN
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub desc: Option<String>,
    /// Node name of the agent that runs this queue's jobs.
    pub node: String,
    pub job_limit: i64,
    pub priority: i64,
    pub flags: QueueFlags,
    /// Jobs currently RUNNING in this queue, maintained by the scheduler.
    pub running: i64,
}

impl Queue {
    pub fn new(name: String, node: String) -> Result<Queue> {
        validate_name(&name)?;
        Ok(Queue {
            name,
            desc: None,
            node,
            job_limit: QUEUE_DEFAULT_LIMIT,
            priority: QUEUE_DEFAULT_PRIORITY,
            flags: QueueFlags::default(),
            running: 0,
        })
    }

    pub fn accepts_jobs(&self) -> bool {
        self.flags.contains(QueueFlags::OPEN)
    }

    pub fn runs_jobs(&self) -> bool {
        self.flags.contains(QueueFlags::STARTED)
    }

    pub fn has_free_slot(&self) -> bool {
        self.running < self.job_limit
    }

    pub fn set_job_limit(&mut self, limit: i64) -> Result<()> {
        if !(0..=QUEUE_MAX_LIMIT).contains(&limit) {
            return Err(BatchdError::InvalidRequest(format!(
                "job limit {limit} outside 0..={QUEUE_MAX_LIMIT}"
            )));
        }
        self.job_limit = limit;
        Ok(())
    }

    pub fn set_priority(&mut self, priority: i64) -> Result<()> {
        if !(0..=QUEUE_MAX_PRIORITY).contains(&priority) {
            return Err(BatchdError::InvalidRequest(format!(
                "priority {priority} outside 0..={QUEUE_MAX_PRIORITY}"
            )));
        }
        self.priority = priority;
        Ok(())
    }

    pub fn set_desc(&mut self, desc: &str) -> Result<()> {
        if desc.len() > QUEUE_DESC_MAX {
            return Err(BatchdError::InvalidRequest(format!(
                "description longer than {QUEUE_DESC_MAX} bytes"
            )));
        }
        self.desc = Some(desc.to_string());
        Ok(())
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.set_str(FieldId::QueueName, self.name.clone());
        item.set_str(FieldId::Node, self.node.clone());
        item.set_int(FieldId::JobLimit, self.job_limit);
        item.set_int(FieldId::Priority, self.priority);
        item.set_int(FieldId::State, self.flags.bits() as i64);
        if let Some(desc) = &self.desc {
            item.set_str(FieldId::Desc, desc.clone());
        }
        item
    }

    pub fn from_item(item: &Item) -> Result<Queue> {
        let name = item
            .get_str(FieldId::QueueName)
            .ok_or_else(|| BatchdError::Journal("queue record missing name".into()))?
            .to_string();
        let node = item
            .get_str(FieldId::Node)
            .ok_or_else(|| BatchdError::Journal("queue record missing node".into()))?
            .to_string();
        let mut queue = Queue::new(name, node)?;
        if let Some(limit) = item.get_int(FieldId::JobLimit) {
            queue.set_job_limit(limit)?;
        }
        if let Some(priority) = item.get_int(FieldId::Priority) {
            queue.set_priority(priority)?;
        }
        if let Some(bits) = item.get_int(FieldId::State) {
            queue.flags = QueueFlags::from_bits(bits as u16)
                .ok_or_else(|| BatchdError::Journal(format!("bad queue flags {bits:#x}")))?;
        }
        if let Some(desc) = item.get_str(FieldId::Desc) {
            queue.set_desc(desc)?;
        }
        Ok(queue)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > QUEUE_NAME_MAX {
        return Err(BatchdError::InvalidRequest(format!(
            "queue name must be 1..={QUEUE_NAME_MAX} bytes"
        )));
    }
    if name.contains(QUEUE_INVALID_CHARS) {
        return Err(BatchdError::InvalidRequest(format!(
            "queue name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}
