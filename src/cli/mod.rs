//! CLI command handlers
//!
//! Each group of subcommands is implemented in its own module. Every
//! handler prints JSON on stdout.

pub mod cache;
pub mod doctor;
pub mod helpers;
pub mod init;
pub mod learn;
