//! Domain types for barvault

pub mod bar;
pub mod request;
pub mod resolution;

pub use bar::Bar;
pub use request::{FetchRequest, Page, PageToken};
pub use resolution::{Resolution, ResolutionError, Timespan};
