//! Session Locator (§4.7), Heartbeat Manager (§4.5), and Membership Cleaner
//! (§4.6): the three pieces of this system that turn the KV store's
//! heartbeat-scored membership set into a local, lock-guarded consistent-hash
//! ring every Gateway and Logic replica can query without a network hop.

mod cleaner;
mod heartbeat;
mod instance;
mod locator;

pub use cleaner::MembershipCleaner;
pub use heartbeat::HeartbeatManager;
pub use instance::GatewayInstance;
pub use locator::{LocatorStats, SessionLocator};

use imss_common::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
