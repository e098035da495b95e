//! Defaults and the small set of keys persisted in the index itself.

use clap::ValueEnum;

/// Default database file, created in the working directory.
pub const DEFAULT_DB_FILE: &str = "pinakes.db";

/// Public AppView used when no `appview` config is stored.
pub const DEFAULT_APPVIEW: &str = "https://public.api.bsky.app";

/// PLC directory for `did:plc` resolution.
pub const PLC_DIRECTORY: &str = "https://plc.directory";

/// Posts authored by the first-party service account are reply noise and
/// skipped wholesale.
pub const FIRST_PARTY_SERVICE_DID: &str = "did:plc:z72i7hdynmk6r22z27h6tvur";

/// Keys allowed in the `config` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigKey {
    /// The DID whose view is being indexed.
    Did,
    /// AppView base URL override.
    Appview,
}

impl ConfigKey {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Did => "did",
            Self::Appview => "appview",
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
