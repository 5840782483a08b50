use super::fields::{FieldId, FieldKind};

/// A tagged field value. The variant must agree with the id's declared kind;
/// the typed setters below and the codec both enforce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
    StrArray(Vec<String>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::StrArray(_) => FieldKind::StrArray,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub id: FieldId,
    pub value: FieldValue,
}

/// One item of a message: a presence bitmap plus the fields actually present.
///
/// Invariant: a field id appears in `fields` if and only if its bit is set in
/// `bitmap`. The bitmap is what distinguishes "explicitly provided" from
/// "absent" for partial-update commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    bitmap: u64,
    fields: Vec<Field>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bitmap(&self) -> u64 {
        self.bitmap
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_set(&self, id: FieldId) -> bool {
        self.bitmap & (1 << id as u8) != 0
    }

    /// Reassemble an item from decoded parts, checking the bitmap invariant.
    /// Returns `None` if the bitmap and field list disagree.
    pub fn from_parts(bitmap: u64, fields: Vec<Field>) -> Option<Self> {
        let mut seen = 0u64;
        for f in &fields {
            let bit = 1u64 << f.id as u8;
            if bitmap & bit == 0 || seen & bit != 0 {
                return None;
            }
            seen |= bit;
        }
        if seen != bitmap {
            return None;
        }
        Some(Self { bitmap, fields })
    }

    fn set(&mut self, id: FieldId, value: FieldValue) {
        debug_assert_eq!(id.kind(), value.kind());
        let bit = 1u64 << id as u8;
        if self.bitmap & bit != 0 {
            if let Some(f) = self.fields.iter_mut().find(|f| f.id == id) {
                f.value = value;
                return;
            }
        }
        self.bitmap |= bit;
        self.fields.push(Field { id, value });
    }

    pub fn set_str(&mut self, id: FieldId, value: impl Into<String>) {
        self.set(id, FieldValue::Str(value.into()));
    }

    pub fn set_int(&mut self, id: FieldId, value: i64) {
        self.set(id, FieldValue::Int(value));
    }

    pub fn set_bool(&mut self, id: FieldId, value: bool) {
        self.set(id, FieldValue::Bool(value));
    }

    pub fn set_array(&mut self, id: FieldId, value: Vec<String>) {
        self.set(id, FieldValue::StrArray(value));
    }

    fn get(&self, id: FieldId) -> Option<&FieldValue> {
        if !self.is_set(id) {
            return None;
        }
        self.fields.iter().find(|f| f.id == id).map(|f| &f.value)
    }

    pub fn get_str(&self, id: FieldId) -> Option<&str> {
        match self.get(id) {
            Some(FieldValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, id: FieldId) -> Option<i64> {
        match self.get(id) {
            Some(FieldValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, id: FieldId) -> Option<bool> {
        match self.get(id) {
            Some(FieldValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_array(&self, id: FieldId) -> Option<&[String]> {
        match self.get(id) {
            Some(FieldValue::StrArray(a)) => Some(a),
            _ => None,
        }
    }
}

/// Protocol version spoken by this build.
pub const PROTO_VERSION: u16 = 1;

/// A decoded protocol unit: command name, version, optional error and items.
///
/// The same envelope carries client requests, agent reports, server replies,
/// dispatch directives and durable journal/snapshot records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub version: u16,
    pub error: Option<String>,
    pub items: Vec<Item>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            version: PROTO_VERSION,
            error: None,
            items: Vec::new(),
        }
    }

    pub fn with_item(command: impl Into<String>, item: Item) -> Self {
        let mut msg = Self::new(command);
        msg.items.push(item);
        msg
    }

    /// An error reply echoing the failed command.
    pub fn error_reply(command: impl Into<String>, error: impl Into<String>) -> Self {
        let mut msg = Self::new(command);
        msg.error = Some(error.into());
        msg
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The first item, for single-item commands.
    pub fn item(&self) -> Option<&Item> {
        self.items.first()
    }
}
