/// Wire-level type of a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Bool,
    StrArray,
}

/// The single dense field-id space shared by every message kind.
///
/// Job, queue, resource and statistics fields all live in one enumeration so
/// the codec can encode and validate any command generically. Ids are wire
/// values and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldId {
    JobId = 0,
    JobName = 1,
    QueueName = 2,
    Args = 3,
    Envs = 4,
    Uid = 5,
    Shell = 6,
    Priority = 7,
    Hold = 8,
    PreCmd = 9,
    PostCmd = 10,
    DeferTime = 11,
    SubmitTime = 12,
    StartTime = 13,
    Tags = 14,
    State = 15,
    Nice = 16,
    Stdout = 17,
    Stderr = 18,
    FinishTime = 19,
    Node = 20,
    Resources = 21,
    JobPid = 22,
    ExitCode = 23,
    Signal = 24,
    Desc = 25,
    JobLimit = 26,
    Restart = 27,
    ResName = 28,
    ResCount = 29,
    ResInUse = 30,
    StatsRunning = 31,
    StatsPending = 32,
    StatsDeferred = 33,
    StatsHolding = 34,
    StatsCompleted = 35,
    StatsExited = 36,
    StatsTotalSubmitted = 37,
    StatsTotalStarted = 38,
    StatsTotalCompleted = 39,
    StatsTotalExited = 40,
}

impl FieldId {
    pub const COUNT: u8 = 41;

    pub fn from_u8(id: u8) -> Option<FieldId> {
        use FieldId::*;
        let all = [
            JobId,
            JobName,
            QueueName,
            Args,
            Envs,
            Uid,
            Shell,
            Priority,
            Hold,
            PreCmd,
            PostCmd,
            DeferTime,
            SubmitTime,
            StartTime,
            Tags,
            State,
            Nice,
            Stdout,
            Stderr,
            FinishTime,
            Node,
            Resources,
            JobPid,
            ExitCode,
            Signal,
            Desc,
            JobLimit,
            Restart,
            ResName,
            ResCount,
            ResInUse,
            StatsRunning,
            StatsPending,
            StatsDeferred,
            StatsHolding,
            StatsCompleted,
            StatsExited,
            StatsTotalSubmitted,
            StatsTotalStarted,
            StatsTotalCompleted,
            StatsTotalExited,
        ];
        all.get(id as usize).copied()
    }

    /// The declared value type for this id. Decoding rejects any frame whose
    /// wire tag disagrees with this.
    pub fn kind(self) -> FieldKind {
        use FieldId::*;
        match self {
            JobName | QueueName | Shell | PreCmd | PostCmd | Stdout | Stderr | Node | Desc
            | ResName => FieldKind::Str,
            Args | Envs | Tags | Resources => FieldKind::StrArray,
            Hold | Restart => FieldKind::Bool,
            JobId | Uid | Priority | DeferTime | SubmitTime | StartTime | State | Nice
            | FinishTime | JobPid | ExitCode | Signal | JobLimit | ResCount | ResInUse
            | StatsRunning | StatsPending | StatsDeferred | StatsHolding | StatsCompleted
            | StatsExited | StatsTotalSubmitted | StatsTotalStarted | StatsTotalCompleted
            | StatsTotalExited => FieldKind::Int,
        }
    }
}
