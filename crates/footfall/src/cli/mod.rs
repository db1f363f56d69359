//! Subcommands of the footfall binary.

pub mod config;
pub mod error;
pub mod init_db;
pub mod run_etl;
pub mod serve;
