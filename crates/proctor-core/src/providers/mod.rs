pub mod version;

pub use version::{HttpVersionClient, Invocation, VersionClient, VersionInfo};
