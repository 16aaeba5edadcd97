//! Adapters between the engine and the outside world: the accrual service
//! over HTTP and the CSV files the command-line driver replays and prints.

pub mod csv;
pub mod http;
