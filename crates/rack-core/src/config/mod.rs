//! Configuration file helpers
//!
//! ```ignore
//! use rack_core::config::{load_config, save_config};
//!
//! let config: MyConfig = load_config(&path);
//! save_config(&config, &path)?;
//! ```

mod io;

pub use io::{load_config, read_config, save_config};
