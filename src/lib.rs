pub mod accumulator;
pub mod aggregator;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod publisher;
pub mod source;

pub use accumulator::{ItemKind, ItemSizes, SizeAggregate};
pub use config::{LogLevel, MonitorConfig};
pub use logging::with_invocation_logging;
pub use monitor::{CodeStorageMonitor, InvocationResult};
pub use publisher::{CloudWatchSink, MetricSink};
pub use source::{CodeStorageSource, LambdaSource};
