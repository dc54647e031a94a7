mod client;
mod config;
mod constants;
mod detector;
mod errors;
mod publisher;
mod source;
pub(crate) mod utils;

pub use client::*;
pub use detector::*;
pub use errors::*;
pub use publisher::*;
pub use source::*;

pub use self::config::*;

//-----------------------------------------------------------
// Test utils
