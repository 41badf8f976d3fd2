//! texconv - asynchronous texture conversion pipeline
//!
//! Produces thumbnails, decoded originals and GPU-compressed variants of
//! textures described by `.tex` descriptor files, deduplicating work across
//! overlapping requests and caching results under fixed budgets.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod job;
pub mod paths;
pub mod pipeline;
pub mod textures;
