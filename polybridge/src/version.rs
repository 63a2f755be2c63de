//! Version and protocol identity.

/// Crate version from Cargo.toml.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifier carried in every request; the remote side must echo it in `meta`.
pub const PROTOCOL_ID: &str = "polybridge/1";

/// Wire protocol revision. Bumped on incompatible message changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version information for the local runtime.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub polybridge: &'static str,
    pub protocol: &'static str,
    pub protocol_version: u32,
    /// Remote interpreter version, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            polybridge: BRIDGE_VERSION,
            protocol: PROTOCOL_ID,
            protocol_version: PROTOCOL_VERSION,
            interpreter: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interpreter(mut self, version: String) -> Self {
        self.interpreter = Some(version);
        self
    }
}
