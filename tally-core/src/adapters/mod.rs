//! Adapter implementations
//!
//! Adapters implement the port traits with concrete technologies:
//! - DuckDB for the LedgerStore port
//! - An in-memory store with fault injection for tests and embedding

pub mod duckdb;
pub mod memory;
