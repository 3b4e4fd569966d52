pub mod cli;
pub mod core;
pub mod platform;
pub mod util;

pub use crate::core::config::{
    CgroupSpec, Config, FreezerState, IdMap, Mount, Namespace, NetworkSpec, Process, Rlimit, Route,
};
pub use crate::core::container::{Container, Stats, StatsError, Status};
pub use crate::core::error::{Error, Result};
pub use crate::core::state::RuntimeState;
pub use crate::platform::linux::cgroups::{CgroupManager, CgroupStats, FsManager};
pub use crate::platform::linux::network::{
    NetworkRegistry, NetworkState, NetworkStats, NetworkStrategy,
};
