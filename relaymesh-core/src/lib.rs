//! relaymesh control plane core
//!
//! Exit node selection, client/site peer association reconciliation and
//! per-client rate limiting for a multi-tenant reverse proxy.

pub mod clock;
pub mod config;
pub mod control_plane;
pub mod core_exit;
pub mod core_mesh;
pub mod core_ratelimit;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod rpc;
pub mod shutdown;
pub mod storage;
pub mod test_utils;

pub use config::Config;
pub use control_plane::{Collaborators, ControlPlane};
pub use logging::{init_logging, LogLevel};
