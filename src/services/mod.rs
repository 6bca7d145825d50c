//! Engine services: storage, catalog, query compilation, correlation and
//! the import pipeline that ties them together.

pub mod catalog;
pub mod correlation;
pub mod finding_store;
pub mod fingerprint;
pub mod ingestion;
pub mod project;
pub mod query;
