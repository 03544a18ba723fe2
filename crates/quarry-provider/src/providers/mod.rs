//! Built-in provider implementations.

pub mod http;
pub mod scripted;

pub use http::HttpJsonProvider;
pub use scripted::ScriptedProvider;
