//! This module provides an abstraction over the Lambda listing APIs
//! in order to keep the aggregation code independent from the AWS SDK
//! and its async client.
//!
//! It also simplify unit tests.

use aws_sdk_lambda::Client as LambdaClient;
#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tokio::runtime::Handle;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The remote calls a source performs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    ListFunctions,
    ListVersionsByFunction,
    ListLayers,
    ListLayerVersions,
    GetLayerVersion,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::ListFunctions => write!(f, "ListFunctions"),
            Operation::ListVersionsByFunction => write!(f, "ListVersionsByFunction"),
            Operation::ListLayers => write!(f, "ListLayers"),
            Operation::ListLayerVersions => write!(f, "ListLayerVersions"),
            Operation::GetLayerVersion => write!(f, "GetLayerVersion"),
        }
    }
}

/// Errors raised while reading the listing APIs.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The remote call failed after the transport gave up retrying.
    #[error("{operation} failed")]
    Request {
        operation: Operation,
        #[source]
        source: BoxError,
    },

    /// The remote call scoped to one function or layer failed.
    #[error("{operation} failed for {name}")]
    ItemRequest {
        operation: Operation,
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("{operation} returned an entry without a name")]
    MissingName { operation: Operation },

    #[error("{operation} returned a version of {name} without a version id")]
    MissingVersion { operation: Operation, name: String },

    /// `GetLayerVersion` answered without the `Content` that holds the size.
    #[error("{operation} returned no content for {name}:{version}")]
    MissingContent {
        operation: Operation,
        name: String,
        version: i64,
    },

    #[error("{operation} returned a negative code size {size} for {name}")]
    InvalidCodeSize {
        operation: Operation,
        name: String,
        size: i64,
    },

    /// The backend handed back the marker it was just given.
    #[error("{operation} repeated pagination marker {marker}")]
    RepeatedMarker { operation: Operation, marker: String },
}

/// One page of a listing response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Page {
            items,
            next_marker: None,
        }
    }

    pub fn with_marker(items: Vec<T>, next_marker: &str) -> Self {
        Page {
            items,
            next_marker: Some(next_marker.to_string()),
        }
    }
}

/// A function version as reported by `ListVersionsByFunction`.
/// The code size is inline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FunctionVersion {
    pub version: String,
    pub code_size: u64,
}

/// The read-only calls the aggregation needs.
///
/// Layer version listings do not carry the code size, it has to be
/// resolved one version at a time with `layer_version_size`.
pub trait CodeStorageSource {
    fn list_functions(&self, max_items: i32, marker: Option<&str>)
        -> Result<Page<String>, SourceError>;

    fn list_function_versions(
        &self,
        function_name: &str,
        max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<FunctionVersion>, SourceError>;

    fn list_layers(&self, max_items: i32, marker: Option<&str>)
        -> Result<Page<String>, SourceError>;

    fn list_layer_versions(
        &self,
        layer_name: &str,
        max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<i64>, SourceError>;

    fn layer_version_size(&self, layer_name: &str, version: i64) -> Result<u64, SourceError>;
}

fn code_size(operation: Operation, name: &str, size: i64) -> Result<u64, SourceError> {
    u64::try_from(size).map_err(|_| SourceError::InvalidCodeSize {
        operation,
        name: name.to_string(),
        size,
    })
}

fn item_error<E>(operation: Operation, name: &str) -> impl FnOnce(E) -> SourceError + '_
where
    E: Into<aws_sdk_lambda::Error>,
{
    move |error| SourceError::ItemRequest {
        operation,
        name: name.to_string(),
        source: Box::new(error.into()),
    }
}

/// Reads the Lambda APIs through the AWS SDK.
///
/// The SDK client is async, every call blocks on the runtime handle
/// so this must be used from a thread that is not driving the runtime.
pub struct LambdaSource {
    client: LambdaClient,
    runtime: Handle,
}

impl LambdaSource {
    pub fn new(sdk_config: &aws_config::SdkConfig, runtime: Handle) -> LambdaSource {
        LambdaSource {
            client: LambdaClient::new(sdk_config),
            runtime,
        }
    }
}

impl CodeStorageSource for LambdaSource {
    fn list_functions(
        &self,
        max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<String>, SourceError> {
        let operation = Operation::ListFunctions;
        let response = self
            .runtime
            .block_on(
                self.client
                    .list_functions()
                    .max_items(max_items)
                    .set_marker(marker.map(str::to_string))
                    .send(),
            )
            .map_err(|error| SourceError::Request {
                operation,
                source: Box::new(aws_sdk_lambda::Error::from(error)),
            })?;

        let items = response
            .functions()
            .iter()
            .map(|function| {
                function
                    .function_name()
                    .map(str::to_string)
                    .ok_or(SourceError::MissingName { operation })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            next_marker: response.next_marker().map(str::to_string),
        })
    }

    fn list_function_versions(
        &self,
        function_name: &str,
        max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<FunctionVersion>, SourceError> {
        let operation = Operation::ListVersionsByFunction;
        let response = self
            .runtime
            .block_on(
                self.client
                    .list_versions_by_function()
                    .function_name(function_name)
                    .max_items(max_items)
                    .set_marker(marker.map(str::to_string))
                    .send(),
            )
            .map_err(item_error(operation, function_name))?;

        let items = response
            .versions()
            .iter()
            .map(|configuration| -> Result<FunctionVersion, SourceError> {
                Ok(FunctionVersion {
                    version: configuration.version().map(str::to_string).ok_or_else(|| {
                        SourceError::MissingVersion {
                            operation,
                            name: function_name.to_string(),
                        }
                    })?,
                    code_size: code_size(operation, function_name, configuration.code_size())?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            next_marker: response.next_marker().map(str::to_string),
        })
    }

    fn list_layers(&self, max_items: i32, marker: Option<&str>) -> Result<Page<String>, SourceError> {
        let operation = Operation::ListLayers;
        let response = self
            .runtime
            .block_on(
                self.client
                    .list_layers()
                    .max_items(max_items)
                    .set_marker(marker.map(str::to_string))
                    .send(),
            )
            .map_err(|error| SourceError::Request {
                operation,
                source: Box::new(aws_sdk_lambda::Error::from(error)),
            })?;

        let items = response
            .layers()
            .iter()
            .map(|layer| {
                layer
                    .layer_name()
                    .map(str::to_string)
                    .ok_or(SourceError::MissingName { operation })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            next_marker: response.next_marker().map(str::to_string),
        })
    }

    fn list_layer_versions(
        &self,
        layer_name: &str,
        max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<i64>, SourceError> {
        let operation = Operation::ListLayerVersions;
        let response = self
            .runtime
            .block_on(
                self.client
                    .list_layer_versions()
                    .layer_name(layer_name)
                    .max_items(max_items)
                    .set_marker(marker.map(str::to_string))
                    .send(),
            )
            .map_err(item_error(operation, layer_name))?;

        Ok(Page {
            items: response
                .layer_versions()
                .iter()
                .map(|version| version.version())
                .collect(),
            next_marker: response.next_marker().map(str::to_string),
        })
    }

    fn layer_version_size(&self, layer_name: &str, version: i64) -> Result<u64, SourceError> {
        let operation = Operation::GetLayerVersion;
        let response = self
            .runtime
            .block_on(
                self.client
                    .get_layer_version()
                    .layer_name(layer_name)
                    .version_number(version)
                    .send(),
            )
            .map_err(item_error(operation, layer_name))?;

        let content = response
            .content()
            .ok_or_else(|| SourceError::MissingContent {
                operation,
                name: layer_name.to_string(),
                version,
            })?;
        code_size(operation, layer_name, content.code_size())
    }
}

/// A call observed by the `DummySource`: operation, item name, marker.
#[cfg(test)]
pub(crate) type Call = (Operation, Option<String>, Option<String>);

/// Replays scripted pages. Pages are looked up by the marker that was
/// sent, `None` being the first page.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct DummySource {
    pub functions: HashMap<Option<String>, Page<String>>,
    pub function_versions: HashMap<(String, Option<String>), Page<FunctionVersion>>,
    pub layers: HashMap<Option<String>, Page<String>>,
    pub layer_versions: HashMap<(String, Option<String>), Page<i64>>,
    pub layer_sizes: HashMap<(String, i64), u64>,
    pub failing: HashSet<(Operation, Option<String>)>,
    pub failing_markers: HashSet<(Operation, String)>,
    pub calls: RefCell<Vec<Call>>,
}

#[cfg(test)]
impl DummySource {
    /// Adds a function whose versions fit in a single page.
    pub fn with_function(mut self, name: &str, versions: &[(&str, u64)]) -> Self {
        self.function_versions.insert(
            (name.to_string(), None),
            Page::last(
                versions
                    .iter()
                    .map(|(version, size)| FunctionVersion {
                        version: version.to_string(),
                        code_size: *size,
                    })
                    .collect(),
            ),
        );
        self
    }

    /// Adds a layer whose versions fit in a single page.
    pub fn with_layer(mut self, name: &str, versions: &[(i64, u64)]) -> Self {
        self.layer_versions.insert(
            (name.to_string(), None),
            Page::last(versions.iter().map(|(version, _)| *version).collect()),
        );
        for (version, size) in versions {
            self.layer_sizes.insert((name.to_string(), *version), *size);
        }
        self
    }

    pub fn failing_on(mut self, operation: Operation, name: Option<&str>) -> Self {
        self.failing.insert((operation, name.map(str::to_string)));
        self
    }

    /// Fails only the request that carries `marker`.
    pub fn failing_at(mut self, operation: Operation, marker: &str) -> Self {
        self.failing_markers
            .insert((operation, marker.to_string()));
        self
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|(op, _, _)| *op == operation)
            .count()
    }

    fn observe(
        &self,
        operation: Operation,
        name: Option<&str>,
        marker: Option<&str>,
    ) -> Result<(), SourceError> {
        self.calls.borrow_mut().push((
            operation,
            name.map(str::to_string),
            marker.map(str::to_string),
        ));
        let failing_marker = marker
            .map(|marker| {
                self.failing_markers
                    .contains(&(operation, marker.to_string()))
            })
            .unwrap_or(false);
        if failing_marker || self.failing.contains(&(operation, name.map(str::to_string))) {
            return Err(match name {
                Some(name) => SourceError::ItemRequest {
                    operation,
                    name: name.to_string(),
                    source: "service unavailable".into(),
                },
                None => SourceError::Request {
                    operation,
                    source: "service unavailable".into(),
                },
            });
        }
        Ok(())
    }
}

#[cfg(test)]
fn scripted<K, T>(
    operation: Operation,
    pages: &HashMap<K, Page<T>>,
    key: &K,
) -> Result<Page<T>, SourceError>
where
    K: std::hash::Hash + Eq,
    T: Clone,
{
    pages.get(key).cloned().ok_or_else(|| SourceError::Request {
        operation,
        source: "no scripted page".into(),
    })
}

#[cfg(test)]
impl CodeStorageSource for DummySource {
    fn list_functions(
        &self,
        _max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<String>, SourceError> {
        self.observe(Operation::ListFunctions, None, marker)?;
        scripted(
            Operation::ListFunctions,
            &self.functions,
            &marker.map(str::to_string),
        )
    }

    fn list_function_versions(
        &self,
        function_name: &str,
        _max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<FunctionVersion>, SourceError> {
        self.observe(Operation::ListVersionsByFunction, Some(function_name), marker)?;
        scripted(
            Operation::ListVersionsByFunction,
            &self.function_versions,
            &(function_name.to_string(), marker.map(str::to_string)),
        )
    }

    fn list_layers(
        &self,
        _max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<String>, SourceError> {
        self.observe(Operation::ListLayers, None, marker)?;
        scripted(
            Operation::ListLayers,
            &self.layers,
            &marker.map(str::to_string),
        )
    }

    fn list_layer_versions(
        &self,
        layer_name: &str,
        _max_items: i32,
        marker: Option<&str>,
    ) -> Result<Page<i64>, SourceError> {
        self.observe(Operation::ListLayerVersions, Some(layer_name), marker)?;
        scripted(
            Operation::ListLayerVersions,
            &self.layer_versions,
            &(layer_name.to_string(), marker.map(str::to_string)),
        )
    }

    fn layer_version_size(&self, layer_name: &str, version: i64) -> Result<u64, SourceError> {
        self.observe(Operation::GetLayerVersion, Some(layer_name), None)?;
        self.layer_sizes
            .get(&(layer_name.to_string(), version))
            .copied()
            .ok_or_else(|| SourceError::ItemRequest {
                operation: Operation::GetLayerVersion,
                name: layer_name.to_string(),
                source: "no scripted layer version".into(),
            })
    }
}


#[cfg(test)]
mod tests {
    use super::replay;
    use super::{
        code_size, CodeStorageSource, DummySource, FunctionVersion, LambdaSource, Operation,
        Page, SourceError,
    };
    use aws_smithy_http_client::test_util::StaticReplayClient;
    use std::error::Error;
    use tokio::runtime::Runtime;

    fn lambda_source(bodies: &[&str]) -> (LambdaSource, StaticReplayClient, Runtime) {
        let http_client = replay::client(
            bodies
                .iter()
                .map(|body| replay::event(200, body))
                .collect(),
        );
        let runtime = replay::runtime();
        let source = LambdaSource::new(&replay::sdk_config(&http_client), runtime.handle().clone());
        (source, http_client, runtime)
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::ListFunctions.to_string(), "ListFunctions");
        assert_eq!(
            Operation::ListVersionsByFunction.to_string(),
            "ListVersionsByFunction"
        );
        assert_eq!(Operation::GetLayerVersion.to_string(), "GetLayerVersion");
    }

    #[test]
    fn test_negative_code_size_rejected() {
        assert_eq!(code_size(Operation::GetLayerVersion, "l1", 50).unwrap(), 50);
        let err = code_size(Operation::GetLayerVersion, "l1", -1).unwrap_err();
        assert!(matches!(err, SourceError::InvalidCodeSize { size: -1, .. }));
        assert_eq!(
            err.to_string(),
            "GetLayerVersion returned a negative code size -1 for l1"
        );
    }

    #[test]
    fn test_item_error_keeps_context() {
        let err = SourceError::ItemRequest {
            operation: Operation::ListLayerVersions,
            name: "l1".to_string(),
            source: "throttled".into(),
        };
        assert_eq!(err.to_string(), "ListLayerVersions failed for l1");
        assert_eq!(err.source().unwrap().to_string(), "throttled");
    }

    #[test]
    fn test_dummy_source() {
        let mut source = DummySource::default().with_layer("l1", &[(1, 50)]);
        source
            .layers
            .insert(None, Page::last(vec!["l1".to_string()]));

        let page = source.list_layers(10, None).unwrap();
        assert_eq!(page.items, vec!["l1".to_string()]);
        assert_eq!(source.layer_version_size("l1", 1).unwrap(), 50);
        assert_eq!(source.calls.borrow().len(), 2);
        assert_eq!(source.count(Operation::ListLayers), 1);
    }

    #[test]
    fn test_dummy_source_failure() {
        let source = DummySource::default().failing_on(Operation::ListFunctions, None);
        let res = source.list_functions(10, None);
        assert!(matches!(
            res,
            Err(SourceError::Request {
                operation: Operation::ListFunctions,
                ..
            })
        ));
    }

    #[test]
    fn test_marker_forwarded_and_next_marker_read() {
        let (source, http_client, _runtime) =
            lambda_source(&[r#"{"Functions":[{"FunctionName":"f2"}],"NextMarker":"tok2"}"#]);

        let page = source.list_functions(5, Some("tok")).unwrap();
        assert_eq!(page, Page::with_marker(vec!["f2".to_string()], "tok2"));

        let uris = replay::uris(&http_client);
        assert_eq!(uris.len(), 1);
        assert!(uris[0].contains("Marker=tok"));
        assert!(uris[0].contains("MaxItems=5"));
    }

    #[test]
    fn test_last_page_has_no_marker() {
        let (source, http_client, _runtime) =
            lambda_source(&[r#"{"Layers":[{"LayerName":"l1"},{"LayerName":"l2"}]}"#]);

        let page = source.list_layers(50, None).unwrap();
        assert_eq!(page, Page::last(vec!["l1".to_string(), "l2".to_string()]));

        let uris = replay::uris(&http_client);
        assert!(uris[0].contains("MaxItems=50"));
        assert!(!uris[0].contains("Marker="));
    }

    #[test]
    fn test_function_versions_from_response() {
        let (source, http_client, _runtime) = lambda_source(&[
            r#"{"Versions":[{"FunctionName":"f1","Version":"$LATEST","CodeSize":300},{"FunctionName":"f1","Version":"1","CodeSize":100}],"NextMarker":"v2"}"#,
        ]);

        let page = source.list_function_versions("f1", 2, None).unwrap();
        assert_eq!(
            page.items,
            vec![
                FunctionVersion {
                    version: "$LATEST".to_string(),
                    code_size: 300,
                },
                FunctionVersion {
                    version: "1".to_string(),
                    code_size: 100,
                },
            ]
        );
        assert_eq!(page.next_marker.as_deref(), Some("v2"));
        assert!(replay::uris(&http_client)[0].contains("f1"));
    }

    #[test]
    fn test_layer_versions_from_response() {
        let (source, _http_client, _runtime) =
            lambda_source(&[r#"{"LayerVersions":[{"Version":2},{"Version":1}]}"#]);

        let page = source.list_layer_versions("l1", 10, None).unwrap();
        assert_eq!(page, Page::last(vec![2, 1]));
    }

    #[test]
    fn test_layer_version_size_from_content() {
        let (source, http_client, _runtime) =
            lambda_source(&[r#"{"Version":1,"Content":{"CodeSize":50}}"#]);

        assert_eq!(source.layer_version_size("l1", 1).unwrap(), 50);
        assert!(replay::uris(&http_client)[0].contains("l1"));
    }

    #[test]
    fn test_missing_content_is_an_error() {
        let (source, _http_client, _runtime) = lambda_source(&[r#"{"Version":1}"#]);

        let err = source.layer_version_size("l1", 1).unwrap_err();
        assert!(matches!(
            err,
            SourceError::MissingContent {
                operation: Operation::GetLayerVersion,
                version: 1,
                ..
            }
        ));
        assert_eq!(err.to_string(), "GetLayerVersion returned no content for l1:1");
    }

    #[test]
    fn test_missing_function_name() {
        let (source, _http_client, _runtime) =
            lambda_source(&[r#"{"Functions":[{"Description":"unnamed"}]}"#]);

        let res = source.list_functions(10, None);
        assert!(matches!(
            res,
            Err(SourceError::MissingName {
                operation: Operation::ListFunctions
            })
        ));
    }

    #[test]
    fn test_missing_version_id() {
        let (source, _http_client, _runtime) =
            lambda_source(&[r#"{"Versions":[{"FunctionName":"f1","CodeSize":10}]}"#]);

        let err = source.list_function_versions("f1", 10, None).unwrap_err();
        assert!(matches!(err, SourceError::MissingVersion { .. }));
        assert_eq!(
            err.to_string(),
            "ListVersionsByFunction returned a version of f1 without a version id"
        );
    }

    #[test]
    fn test_negative_code_size_in_response() {
        let (source, _http_client, _runtime) = lambda_source(&[
            r#"{"Versions":[{"FunctionName":"f1","Version":"1","CodeSize":-5}]}"#,
        ]);

        let res = source.list_function_versions("f1", 10, None);
        assert!(matches!(
            res,
            Err(SourceError::InvalidCodeSize { size: -5, .. })
        ));
    }

    #[test]
    fn test_service_error_names_item() {
        let http_client = replay::client(vec![replay::event(
            404,
            r#"{"Type":"User","Message":"Layer not found"}"#,
        )]);
        let runtime = replay::runtime();
        let source = LambdaSource::new(&replay::sdk_config(&http_client), runtime.handle().clone());

        let err = source.list_layer_versions("l1", 10, None).unwrap_err();
        assert!(matches!(
            err,
            SourceError::ItemRequest {
                operation: Operation::ListLayerVersions,
                ..
            }
        ));
        assert_eq!(err.to_string(), "ListLayerVersions failed for l1");
    }
}
