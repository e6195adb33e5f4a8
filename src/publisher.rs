//! This module turns aggregated code sizes into metric data points
//! and submits them to a `MetricSink`.
//!
//! The CloudWatch implementation wraps the async SDK client so the
//! rest of the crate stays synchronous.

use crate::accumulator::{ItemKind, SizeAggregate};
use crate::source::BoxError;
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types::{
    Dimension as AwsDimension, MetricDatum as AwsMetricDatum, StandardUnit,
};
use aws_sdk_cloudwatch::Client as CloudWatchClient;
use chrono::{DateTime, Utc};
use std::num::NonZeroUsize;
#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::rc::Rc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{event, Level};

pub static METRIC_NAME: &str = "Code Size";
static ALL_CODE_DIMENSION: &str = "All Code";
static TOTAL_VALUE: &str = "Total";

/// The unit of measures we publish with.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricUnit {
    Bytes,
}

impl From<MetricUnit> for StandardUnit {
    fn from(unit: MetricUnit) -> Self {
        match unit {
            MetricUnit::Bytes => StandardUnit::Bytes,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// One data point, ready to be submitted.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricDatum {
    pub metric_name: String,
    pub dimension: Dimension,
    pub value: u64,
    pub unit: MetricUnit,
    pub timestamp: DateTime<Utc>,
}

impl MetricDatum {
    fn code_size(dimension: &str, value: &str, size: u64, timestamp: DateTime<Utc>) -> Self {
        MetricDatum {
            metric_name: METRIC_NAME.to_string(),
            dimension: Dimension {
                name: dimension.to_string(),
                value: value.to_string(),
            },
            value: size,
            unit: MetricUnit::Bytes,
            timestamp,
        }
    }
}

impl From<&MetricDatum> for AwsMetricDatum {
    fn from(datum: &MetricDatum) -> Self {
        AwsMetricDatum::builder()
            .metric_name(datum.metric_name.as_str())
            .dimensions(
                AwsDimension::builder()
                    .name(datum.dimension.name.as_str())
                    .value(datum.dimension.value.as_str())
                    .build(),
            )
            .value(datum.value as f64)
            .unit(datum.unit.into())
            .timestamp(AwsDateTime::from_millis(datum.timestamp.timestamp_millis()))
            .build()
    }
}

/// Metric publishing errors.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Failed to submit a batch of data points.
    #[error("failed to publish metric data to namespace {namespace}")]
    SendFailed {
        namespace: String,
        #[source]
        source: BoxError,
    },
}

/// A basic metrics backend.
pub trait MetricSink {
    fn put_metric_data(&self, namespace: &str, data: &[MetricDatum]) -> Result<(), PublishError>;
}

/// Submits data points with `PutMetricData`.
pub struct CloudWatchSink {
    client: CloudWatchClient,
    runtime: Handle,
}

impl CloudWatchSink {
    pub fn new(sdk_config: &aws_config::SdkConfig, runtime: Handle) -> CloudWatchSink {
        CloudWatchSink {
            client: CloudWatchClient::new(sdk_config),
            runtime,
        }
    }
}

impl MetricSink for CloudWatchSink {
    fn put_metric_data(&self, namespace: &str, data: &[MetricDatum]) -> Result<(), PublishError> {
        let metric_data: Vec<AwsMetricDatum> = data.iter().map(AwsMetricDatum::from).collect();
        self.runtime
            .block_on(
                self.client
                    .put_metric_data()
                    .namespace(namespace)
                    .set_metric_data(Some(metric_data))
                    .send(),
            )
            .map_err(|error| PublishError::SendFailed {
                namespace: namespace.to_string(),
                source: Box::new(aws_sdk_cloudwatch::Error::from(error)),
            })?;
        Ok(())
    }
}

pub struct MetricPublisher<'a> {
    sink: Box<dyn MetricSink + 'a>,
    namespace: String,
    batch_size: NonZeroUsize,
}

impl<'a> MetricPublisher<'a> {
    pub fn new(
        sink: Box<dyn MetricSink + 'a>,
        namespace: &str,
        batch_size: NonZeroUsize,
    ) -> MetricPublisher<'a> {
        MetricPublisher {
            sink,
            namespace: namespace.to_string(),
            batch_size,
        }
    }

    /// Flattens the aggregates into data points.
    ///
    /// Each kind gets a `Total` point and one point per item. When more
    /// than one kind is given an `All Code` point carries the sum.
    pub fn build_data(
        results: &[(ItemKind, &SizeAggregate)],
        timestamp: DateTime<Utc>,
    ) -> Vec<MetricDatum> {
        let mut data: Vec<MetricDatum> = results
            .iter()
            .map(|(kind, aggregate)| {
                MetricDatum::code_size(&kind.to_string(), TOTAL_VALUE, aggregate.total(), timestamp)
            })
            .collect();

        if results.len() > 1 {
            let all_code = results.iter().map(|(_, aggregate)| aggregate.total()).sum();
            data.push(MetricDatum::code_size(
                ALL_CODE_DIMENSION,
                TOTAL_VALUE,
                all_code,
                timestamp,
            ));
        }

        for (kind, aggregate) in results {
            let dimension = kind.to_string();
            for (name, sizes) in aggregate.items() {
                data.push(MetricDatum::code_size(&dimension, name, sizes.total(), timestamp));
            }
        }
        data
    }

    /// Builds every data point first, then submits them in batches of at
    /// most `batch_size`. Returns the number of batches sent.
    pub fn publish(&self, results: &[(ItemKind, &SizeAggregate)]) -> Result<usize, PublishError> {
        let data = MetricPublisher::build_data(results, Utc::now());
        let mut batches = 0;
        for chunk in data.chunks(self.batch_size.get()) {
            self.sink.put_metric_data(&self.namespace, chunk)?;
            batches += 1;
            event!(
                Level::INFO,
                namespace = self.namespace.as_str(),
                points = chunk.len(),
                "Metric batch published."
            );
        }
        Ok(batches)
    }
}

#[cfg(test)]
pub(crate) struct DummySink {
    pub batches: Rc<RefCell<Vec<(String, Vec<MetricDatum>)>>>,
    pub fail: bool,
}

#[cfg(test)]
impl MetricSink for DummySink {
    fn put_metric_data(&self, namespace: &str, data: &[MetricDatum]) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::SendFailed {
                namespace: namespace.to_string(),
                source: "access denied".into(),
            });
        }
        self.batches
            .borrow_mut()
            .push((namespace.to_string(), data.to_vec()));
        Ok(())
    }
}
