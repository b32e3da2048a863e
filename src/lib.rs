//! Census block ("manzana") explorer.
//!
//! [`data::Fetcher`] pulls blocks page by page from a remote table and turns
//! them into a GeoJSON-shaped [`types::FeatureCollection`]. Selections made
//! with the [`spatial`] tools feed [`selection::SelectionStore`], whose
//! subscribers recompute the [`aggregate`] statistics on every change.

pub mod aggregate;
pub mod config;
pub mod data;
pub mod error;
pub mod remote;
pub mod selection;
pub mod server;
pub mod spatial;
pub mod types;
pub mod variables;
