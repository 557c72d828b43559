//! Engine configuration
//!
//! This module provides the configuration infrastructure for the render core:
//!
//! - Generic YAML config loading/saving
//! - Default config path resolution
//! - [`EngineConfig`] with its limiter section
//!
//! # Usage
//!
//! ```ignore
//! use cadence_core::config::{load_config, save_config, default_config_path, EngineConfig};
//!
//! let path = default_config_path("engine.yaml");
//! let config: EngineConfig = load_config(&path);
//! save_config(&config, &path)?;
//! ```

mod engine;
mod io;
mod paths;

pub use engine::{EngineConfig, LimiterConfig};
pub use io::{load_config, save_config};
pub use paths::{default_config_dir, default_config_path};
