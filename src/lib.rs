//! Product page price parser: fetch, extract and persist product data
//! from shop pages, in batches, on a bounded worker pool.

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod links;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;

#[cfg(test)]
mod testing;
