//! Incremental openFDA sync: fetch pages in cursor order, normalize them into
//! fixed per-kind rows, upsert them, and checkpoint after every page.

pub mod config;
pub mod connector;
pub mod cursor;
pub mod db;
pub mod error;
pub mod mapper;
pub mod model;
pub mod openfda;
pub mod rate_limit;
pub mod sink;
pub mod store;
pub mod sync;
