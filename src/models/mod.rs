pub mod association;
pub mod attack;
pub mod finding;
pub mod host;
pub mod summary;
