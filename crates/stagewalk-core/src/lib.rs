pub mod approval;
pub mod artifact;
pub mod config;
pub mod detector;
pub mod error;
pub mod executor;
pub mod io;
pub mod merge;
pub mod observer;
pub mod orchestrator;
pub mod outputs;
pub mod params;
pub mod paths;
pub mod release;
pub mod resolver;
pub mod source;
pub mod state;
pub mod template;

pub use error::{Result, RolloutError};
