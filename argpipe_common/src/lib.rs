//! Code shared between the argpipe daemon and tools.

#![warn(missing_docs)]

pub use anyhow;
pub use chrono;
pub use diesel;
pub use serde_json;
pub use uuid;

pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod rest_api;
mod schema;
pub mod tracing_support;

/// Common imports used by many modules.
pub mod prelude {
    pub use anyhow::{anyhow, Context};
    pub use chrono::{NaiveDateTime, Utc};
    pub use diesel::{self, prelude::*, SqliteConnection};
    pub use serde::{Deserialize, Serialize};
    pub use std::{
        collections::HashMap,
        fmt,
        fs::File,
        io::Write,
        path::{Path, PathBuf},
    };
    pub use tracing::{debug, error, info, trace, warn};
    pub use uuid::Uuid;

    pub use crate::config::Config;
    pub use crate::models::*;
    pub use crate::{Error, Result};
}

pub use errors::Error;

/// Result type for this crate's functions.
pub type Result<T> = std::result::Result<T, Error>;
