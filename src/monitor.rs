use crate::accumulator::{ItemKind, SizeAggregate};
use crate::aggregator::Aggregator;
use crate::config::MonitorConfig;
use crate::publisher::{CloudWatchSink, MetricPublisher, MetricSink, PublishError};
use crate::source::{CodeStorageSource, LambdaSource, SourceError};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{event, Level};

/// This is the entry point for the library. One `CodeStorageMonitor`
/// performs one metering run: it sums the code size of every function
/// version, then every layer version, and publishes the totals.
///
/// Nothing is kept between runs. A failed run publishes nothing unless
/// the failure happened while publishing.
pub struct CodeStorageMonitor<'a> {
    source: Box<dyn CodeStorageSource + 'a>,
    publisher: MetricPublisher<'a>,
    page_size: i32,
}

/// The totals computed by a successful run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub function_results: SizeAggregate,
    pub layer_results: SizeAggregate,
    pub published_batches: usize,
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to aggregate {kind} code sizes")]
    Aggregation {
        kind: ItemKind,
        #[source]
        source: SourceError,
    },

    /// Aggregation succeeded, the totals are kept for reporting.
    #[error("failed to publish code size metrics")]
    Publish {
        function_results: SizeAggregate,
        layer_results: SizeAggregate,
        #[source]
        source: PublishError,
    },
}

/// What the invocation hands back to the Lambda runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InvocationResult {
    pub status_code: u16,
    pub function_results: Option<SizeAggregate>,
    pub layer_results: Option<SizeAggregate>,
    pub published_batches: Option<usize>,
    pub error: Option<String>,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Renders an error with its whole source chain.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl<'a> CodeStorageMonitor<'a> {
    /// Builds a monitor backed by the Lambda and CloudWatch APIs.
    ///
    /// Calls block on `runtime`, run this from a blocking thread.
    pub fn new(
        config: &MonitorConfig,
        sdk_config: &aws_config::SdkConfig,
        runtime: Handle,
    ) -> CodeStorageMonitor<'a> {
        CodeStorageMonitor::new_with_clients(
            Box::new(LambdaSource::new(sdk_config, runtime.clone())),
            Box::new(CloudWatchSink::new(sdk_config, runtime)),
            config,
        )
    }

    /// Leaves the responsibility to provide the source and the sink to
    /// the client. Most of the times you should not need to use this.
    pub fn new_with_clients(
        source: Box<dyn CodeStorageSource + 'a>,
        sink: Box<dyn MetricSink + 'a>,
        config: &MonitorConfig,
    ) -> CodeStorageMonitor<'a> {
        CodeStorageMonitor {
            source,
            publisher: MetricPublisher::new(sink, &config.namespace, config.metric_batch_size),
            page_size: config.page_size,
        }
    }

    pub fn run(&self) -> Result<MonitorReport, MonitorError> {
        let aggregator = Aggregator::new(self.source.as_ref(), self.page_size);

        let function_results = aggregator
            .function_sizes()
            .map_err(|source| MonitorError::Aggregation {
                kind: ItemKind::Functions,
                source,
            })?;
        let layer_results = aggregator
            .layer_sizes()
            .map_err(|source| MonitorError::Aggregation {
                kind: ItemKind::Layers,
                source,
            })?;

        match self.publisher.publish(&[
            (ItemKind::Functions, &function_results),
            (ItemKind::Layers, &layer_results),
        ]) {
            Ok(published_batches) => Ok(MonitorReport {
                function_results,
                layer_results,
                published_batches,
            }),
            Err(source) => Err(MonitorError::Publish {
                function_results,
                layer_results,
                source,
            }),
        }
    }

    /// Runs once and converts the outcome into an `InvocationResult`,
    /// 200 on success and 500 on any failure.
    pub fn invoke(&self) -> InvocationResult {
        match self.run() {
            Ok(report) => {
                event!(
                    Level::INFO,
                    functions_total = report.function_results.total(),
                    layers_total = report.layer_results.total(),
                    "Code size metrics published."
                );
                InvocationResult {
                    status_code: 200,
                    function_results: Some(report.function_results),
                    layer_results: Some(report.layer_results),
                    published_batches: Some(report.published_batches),
                    error: None,
                }
            }
            Err(error) => {
                let message = error_chain(&error);
                event!(Level::ERROR, error = message.as_str(), "Code size metering failed.");
                match error {
                    MonitorError::Aggregation { .. } => InvocationResult {
                        status_code: 500,
                        function_results: None,
                        layer_results: None,
                        published_batches: None,
                        error: Some(message),
                    },
                    MonitorError::Publish {
                        function_results,
                        layer_results,
                        ..
                    } => InvocationResult {
                        status_code: 500,
                        function_results: Some(function_results),
                        layer_results: Some(layer_results),
                        published_batches: None,
                        error: Some(message),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CodeStorageMonitor, MonitorError};
    use crate::config::MonitorConfig;
    use crate::publisher::DummySink;
    use crate::source::{DummySource, Operation, Page};
    use serde_json::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn config() -> MonitorConfig {
        MonitorConfig::from_lookup(|name| match name {
            "PAGE_SIZE" => Some("10".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn account() -> DummySource {
        let mut source = DummySource::default()
            .with_function("f1", &[("1", 100), ("2", 200)])
            .with_layer("l1", &[(1, 50)]);
        source
            .functions
            .insert(None, Page::last(vec!["f1".to_string()]));
        source.layers.insert(None, Page::last(vec!["l1".to_string()]));
        source
    }

    #[test]
    fn test_successful_invocation() {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let sink = DummySink {
            batches: Rc::clone(&batches),
            fail: false,
        };
        let monitor =
            CodeStorageMonitor::new_with_clients(Box::new(account()), Box::new(sink), &config());

        let result = monitor.invoke();
        assert!(result.is_success());
        assert_eq!(result.function_results.as_ref().unwrap().total(), 300);
        assert_eq!(result.layer_results.as_ref().unwrap().total(), 50);
        assert_eq!(result.published_batches, Some(1));

        let batches = batches.borrow();
        assert_eq!(batches.len(), 1);
        let (namespace, data) = &batches[0];
        assert_eq!(namespace, "Custom/Lambda");
        let all_code = data
            .iter()
            .find(|datum| datum.dimension.name == "All Code")
            .unwrap();
        assert_eq!(all_code.value, 350);
        let f1 = data
            .iter()
            .find(|datum| datum.dimension.name == "Functions" && datum.dimension.value == "f1")
            .unwrap();
        assert_eq!(f1.value, 300);
        assert_eq!(data.len(), 5);
    }

    #[test]
    fn test_failure_publishes_nothing() {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let sink = DummySink {
            batches: Rc::clone(&batches),
            fail: false,
        };
        let mut source = account()
            .with_function("f2", &[("1", 1)])
            .failing_on(Operation::ListVersionsByFunction, Some("f2"));
        source
            .functions
            .insert(None, Page::with_marker(vec!["f1".to_string()], "tok"));
        source
            .functions
            .insert(Some("tok".to_string()), Page::last(vec!["f2".to_string()]));
        let monitor =
            CodeStorageMonitor::new_with_clients(Box::new(source), Box::new(sink), &config());

        let result = monitor.invoke();
        assert_eq!(result.status_code, 500);
        assert_eq!(result.function_results, None);
        assert_eq!(
            result.error.as_deref(),
            Some(
                "failed to aggregate Functions code sizes: \
                 ListVersionsByFunction failed for f2: service unavailable"
            )
        );
        assert_eq!(batches.borrow().len(), 0);
    }

    #[test]
    fn test_layer_failure() {
        let sink = DummySink {
            batches: Rc::new(RefCell::new(Vec::new())),
            fail: false,
        };
        let source = account().failing_on(Operation::ListLayerVersions, Some("l1"));
        let monitor =
            CodeStorageMonitor::new_with_clients(Box::new(source), Box::new(sink), &config());

        assert!(matches!(
            monitor.run(),
            Err(MonitorError::Aggregation {
                kind: crate::accumulator::ItemKind::Layers,
                ..
            })
        ));
    }

    #[test]
    fn test_publish_failure_keeps_results() {
        let sink = DummySink {
            batches: Rc::new(RefCell::new(Vec::new())),
            fail: true,
        };
        let monitor =
            CodeStorageMonitor::new_with_clients(Box::new(account()), Box::new(sink), &config());

        let result = monitor.invoke();
        assert_eq!(result.status_code, 500);
        assert_eq!(result.function_results.unwrap().total(), 300);
        assert_eq!(result.layer_results.unwrap().total(), 50);
        assert_eq!(result.published_batches, None);
    }

    #[test]
    fn test_result_json() {
        let sink = DummySink {
            batches: Rc::new(RefCell::new(Vec::new())),
            fail: false,
        };
        let monitor =
            CodeStorageMonitor::new_with_clients(Box::new(account()), Box::new(sink), &config());

        let value: Value = serde_json::to_value(monitor.invoke()).unwrap();
        assert_eq!(value["status_code"], 200);
        assert_eq!(value["function_results"]["items"]["f1"]["versions"]["2"], 200);
        assert_eq!(value["layer_results"]["total"], 50);
        assert!(value["error"].is_null());
    }
}
