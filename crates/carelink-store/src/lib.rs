//! # carelink-store
//!
//! Local persistence for a CareLink client, backed by SQLite.
//!
//! Holds the stable local peer id across restarts and an append-only
//! history of every conversation.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod settings;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
