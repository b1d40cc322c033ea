//! Upstream access: the page fetcher abstraction, its HTTP implementation,
//! request pacing, and instrument reference lookups.

pub mod budget;
pub mod polygon;
pub mod provider;
pub mod reference;

pub use budget::RequestBudget;
pub use polygon::PolygonFetcher;
pub use provider::{ErrorKind, FetchError, PageFetcher};
pub use reference::{
    asset_type_for, InstrumentMetadata, MetadataLookup, PolygonReference,
};
