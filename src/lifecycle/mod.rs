pub mod controller;
pub mod error;
pub mod feedback;
pub mod merger;
pub mod monitor;
pub mod persister;

pub use controller::{Controller, ControllerConfig};
pub use error::Error;
pub use feedback::{FailureType, FeedbackLoop};
pub use merger::{AutoMerger, MergePolicy};
pub use monitor::{ChecksCiMonitor, CiMonitor};
pub use persister::MetricsPersister;
