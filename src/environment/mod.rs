//! Python environment discovery
//!
//! [`EnvironmentDiscovery`] is the capability the resolver consumes,
//! [`ExtensionRegistry`] is where providers are found, and
//! [`PythonEnvironmentProvider`] is the provider the headless host installs.

pub mod discovery;
pub mod python;
pub mod registry;

pub use discovery::{DiscoveryError, EnvironmentDiscovery, EnvironmentPath};
pub use python::PythonEnvironmentProvider;
pub use registry::{ExtensionRegistry, PYTHON_EXTENSION_ID};
