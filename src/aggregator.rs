//! Walks the paginated listing APIs and sums code sizes.
//!
//! Every traversal is a loop over pages driven by the marker returned
//! with the previous page. Per item traversals return their own
//! `ItemSizes` that the caller merges into the running aggregate.

use crate::accumulator::{ItemSizes, SizeAggregate};
use crate::source::{CodeStorageSource, Operation, Page, SourceError};
use tracing::{event, Level};

pub struct Aggregator<'a> {
    source: &'a dyn CodeStorageSource,
    page_size: i32,
}

/// Requests pages until one comes back without a marker and hands every
/// item to `visit`. Returns the number of pages requested.
fn for_each_page<T, F, V>(
    operation: Operation,
    mut fetch: F,
    mut visit: V,
) -> Result<usize, SourceError>
where
    F: FnMut(Option<&str>) -> Result<Page<T>, SourceError>,
    V: FnMut(T) -> Result<(), SourceError>,
{
    let mut marker: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = fetch(marker.as_deref())?;
        pages += 1;
        for item in page.items {
            visit(item)?;
        }
        match page.next_marker {
            Some(next) if marker.as_deref() == Some(next.as_str()) => {
                return Err(SourceError::RepeatedMarker {
                    operation,
                    marker: next,
                });
            }
            Some(next) => marker = Some(next),
            None => return Ok(pages),
        }
    }
}

impl<'a> Aggregator<'a> {
    pub fn new(source: &'a dyn CodeStorageSource, page_size: i32) -> Aggregator<'a> {
        Aggregator { source, page_size }
    }

    /// Sums the code size of every version of every function.
    pub fn function_sizes(&self) -> Result<SizeAggregate, SourceError> {
        let mut aggregate = SizeAggregate::new();
        let pages = for_each_page(
            Operation::ListFunctions,
            |marker| self.source.list_functions(self.page_size, marker),
            |name| {
                let sizes = self.function_version_sizes(&name)?;
                aggregate.merge(name, sizes);
                Ok(())
            },
        )?;
        event!(
            Level::INFO,
            functions = aggregate.len(),
            pages,
            total = aggregate.total(),
            "Function sizes aggregated."
        );
        Ok(aggregate)
    }

    /// Sums the versions of one function. Sizes are part of the
    /// version listing.
    pub fn function_version_sizes(&self, function_name: &str) -> Result<ItemSizes, SourceError> {
        let mut sizes = ItemSizes::new();
        for_each_page(
            Operation::ListVersionsByFunction,
            |marker| {
                self.source
                    .list_function_versions(function_name, self.page_size, marker)
            },
            |version| {
                event!(
                    Level::DEBUG,
                    "{}:{} = {}",
                    function_name,
                    version.version,
                    version.code_size
                );
                sizes.record(version.version, version.code_size);
                Ok(())
            },
        )?;
        Ok(sizes)
    }

    /// Sums the code size of every version of every layer.
    pub fn layer_sizes(&self) -> Result<SizeAggregate, SourceError> {
        let mut aggregate = SizeAggregate::new();
        let pages = for_each_page(
            Operation::ListLayers,
            |marker| self.source.list_layers(self.page_size, marker),
            |name| {
                let sizes = self.layer_version_sizes(&name)?;
                aggregate.merge(name, sizes);
                Ok(())
            },
        )?;
        event!(
            Level::INFO,
            layers = aggregate.len(),
            pages,
            total = aggregate.total(),
            "Layer sizes aggregated."
        );
        Ok(aggregate)
    }

    /// Sums the versions of one layer. The listing only has version
    /// numbers, each size takes a `GetLayerVersion` call.
    pub fn layer_version_sizes(&self, layer_name: &str) -> Result<ItemSizes, SourceError> {
        let mut sizes = ItemSizes::new();
        for_each_page(
            Operation::ListLayerVersions,
            |marker| {
                self.source
                    .list_layer_versions(layer_name, self.page_size, marker)
            },
            |version| {
                let size = self.source.layer_version_size(layer_name, version)?;
                event!(Level::DEBUG, "{}:{} = {}", layer_name, version, size);
                sizes.record(version.to_string(), size);
                Ok(())
            },
        )?;
        Ok(sizes)
    }
}
