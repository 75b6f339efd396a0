//! Platform capability collaborator

/// First API level with secure key import
pub const MIN_SECURE_IMPORT_API_LEVEL: u32 = 28;

/// Reports what the host platform supports
pub trait Platform: Send + Sync {
    fn api_level(&self) -> u32;

    fn supports_secure_import(&self, min_api_level: u32) -> bool {
        self.api_level() >= min_api_level
    }
}

/// Platform with a fixed API level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticPlatform {
    api_level: u32,
}

impl StaticPlatform {
    pub fn new(api_level: u32) -> Self {
        StaticPlatform { api_level }
    }
}

impl Default for StaticPlatform {
    fn default() -> Self {
        StaticPlatform::new(MIN_SECURE_IMPORT_API_LEVEL)
    }
}

impl Platform for StaticPlatform {
    fn api_level(&self) -> u32 {
        self.api_level
    }
}
