use crate::error::{BatchdError, Result};
use crate::protocol::{FieldId, Item};

/// A named counted resource. `0 <= inuse <= count` holds after every
/// reserve/release, which the admission path relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub count: i64,
    pub inuse: i64,
}

impl Resource {
    pub fn new(name: String, count: i64) -> Result<Resource> {
        if name.is_empty() {
            return Err(BatchdError::InvalidRequest("empty resource name".into()));
        }
        if count < 0 {
            return Err(BatchdError::InvalidRequest(format!(
                "negative resource count {count}"
            )));
        }
        Ok(Resource {
            name,
            count,
            inuse: 0,
        })
    }

    pub fn free(&self) -> i64 {
        self.count - self.inuse
    }

    /// Reserve `amount` units. Fails without side effects if not enough free.
    pub fn reserve(&mut self, amount: i64) -> Result<()> {
        if amount > self.free() {
            return Err(BatchdError::InvalidRequest(format!(
                "resource {} has {} free, {} requested",
                self.name,
                self.free(),
                amount
            )));
        }
        self.inuse += amount;
        Ok(())
    }

    pub fn release(&mut self, amount: i64) {
        debug_assert!(amount <= self.inuse, "releasing more than reserved");
        self.inuse = (self.inuse - amount).max(0);
    }

    /// Lowering the total below the in-use amount is refused; completions
    /// must drain it first.
    pub fn set_count(&mut self, count: i64) -> Result<()> {
        if count < self.inuse {
            return Err(BatchdError::InvalidRequest(format!(
                "resource {} has {} in use, cannot shrink to {}",
                self.name, self.inuse, count
            )));
        }
        self.count = count;
        Ok(())
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.set_str(FieldId::ResName, self.name.clone());
        item.set_int(FieldId::ResCount, self.count);
        item.set_int(FieldId::ResInUse, self.inuse);
        item
    }

    pub fn from_item(item: &Item) -> Result<Resource> {
        let name = item
            .get_str(FieldId::ResName)
            .ok_or_else(|| BatchdError::Journal("resource record missing name".into()))?
            .to_string();
        let count = item
            .get_int(FieldId::ResCount)
            .ok_or_else(|| BatchdError::Journal("resource record missing count".into()))?;
        let mut res = Resource::new(name, count)?;
        // Snapshot inuse is recomputed from RUNNING jobs on recovery, but the
        // journaled value keeps the record self-describing.
        res.inuse = item.get_int(FieldId::ResInUse).unwrap_or(0);
        Ok(res)
    }
}
