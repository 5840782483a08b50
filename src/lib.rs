pub mod config;
pub mod error;
pub mod events;
pub mod journal;
pub mod net;
pub mod protocol;
pub mod sched;
pub mod server;
pub mod shutdown;
pub mod state;
