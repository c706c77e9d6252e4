pub mod buffer;
pub mod policy;
pub mod relay;
pub mod throttle;
pub mod types;
pub mod url;
