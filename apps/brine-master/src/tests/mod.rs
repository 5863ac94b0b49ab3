//! Master integration tests.
//!
//! Organized by feature area:
//! - `common` - Shared helpers: in-memory masters, handshakes, requests
//! - `handshake` - Auth requests and session grants through the dispatcher
//! - `admin` - Key administration over the local channel
//! - `publish` - Job submission, targeting and the publish channel
//! - `sealed` - Returns, grains, pillar and files from authenticated minions
//! - `end_to_end` - A real minion link against a served master
//! - `syndic` - Relaying jobs and returns between two masters

pub mod common;

mod admin;
mod sealed;
