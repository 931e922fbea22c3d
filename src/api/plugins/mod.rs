// Plugins module - capability traits, the registry and built-in plugins

pub mod error;
pub mod fake;
pub mod http;
pub mod registry;
pub mod traits;

pub use error::PluginError;
pub use fake::FakePlugin;
pub use http::HttpRemotePlugin;
pub use registry::PluginRegistry;
pub use traits::{Plugin, RemoteScopeLister, ScopeConvertible, TaskContext, TaskExecutor};
