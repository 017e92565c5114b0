#[macro_use]
extern crate lazy_static;

pub mod approval;
pub mod client;
pub mod config;
pub mod environment;
pub mod github;
pub mod lifecycle;
pub mod metrics;
pub mod state;
pub mod store;

pub use lifecycle::{AutoMerger, Controller, FeedbackLoop, MetricsPersister};
pub use metrics::Metrics;
pub use state::{CiStatus, PrStage, PrState};
pub use store::StateStore;
