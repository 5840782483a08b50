pub mod codec;
pub mod fields;
pub mod message;

pub use codec::{decode_message, encode_frame, encode_message, WireCodec, MAX_FRAME_SIZE};
pub use fields::{FieldId, FieldKind};
pub use message::{Field, FieldValue, Item, Message, PROTO_VERSION};

/// Client command names.
pub mod commands {
    pub const ADD_JOB: &str = "add_job";
    pub const MOD_JOB: &str = "mod_job";
    pub const GET_JOB: &str = "get_job";
    pub const DEL_JOB: &str = "del_job";
    pub const SIG_JOB: &str = "sig_job";
    pub const ADD_QUEUE: &str = "add_queue";
    pub const MOD_QUEUE: &str = "mod_queue";
    pub const GET_QUEUE: &str = "get_queue";
    pub const DEL_QUEUE: &str = "del_queue";
    pub const ADD_RES: &str = "add_res";
    pub const MOD_RES: &str = "mod_res";
    pub const GET_RES: &str = "get_res";
    pub const DEL_RES: &str = "del_res";
    pub const STATS: &str = "stats";

    /// Agent-originated commands.
    pub const AGENT_LOGIN: &str = "agent_login";
    pub const JOB_STARTED: &str = "job_started";
    pub const JOB_COMPLETED: &str = "job_completed";

    /// Server-to-agent directives.
    pub const RUN_JOB: &str = "run_job";

    /// Journal-only records.
    pub const JOB_STATE: &str = "job_state";
    pub const TOTALS: &str = "totals";
}
