pub mod breakpoint;
pub mod error;
pub mod feature;
mod io;
pub mod memory;
pub mod notif;
pub mod packet;
pub mod ptid;
pub mod register;
pub mod registry;
pub mod resume;
pub mod session;
pub mod stop;
pub mod target;
#[cfg(test)]
pub(crate) mod testing;
pub mod threads;
pub mod trace;
pub mod transport;

pub use error::Error;
pub use ptid::ThreadId;
pub use target::{EventHook, FollowFork, NoopHook, RemoteTarget, TargetKind};
