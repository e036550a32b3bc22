pub mod config;
pub mod duration;

pub use config::LrtConfig;
pub use duration::parse_duration;

/// PiCaS API version stamped into every token and design document.
pub const PICAS_API_VERSION: &str = "1.0.2";

/// Oldest `PicasApiVersion` a token configuration may declare.
pub const MIN_CONFIG_API_VERSION: f64 = 0.5;
