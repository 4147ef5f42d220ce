//! Copyright 2024 Cosmian Tech SAS

mod log_utils;

pub use log_utils::log_init;
pub use tracing::{debug, error, info, trace, warn};
