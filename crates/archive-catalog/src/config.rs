use std::path::PathBuf;

use clap::Parser;

use crate::assets::AssetCacheConfig;
use crate::guard::ProfileLayout;

/// Configuration for the archive-catalog browser.
#[derive(Parser, Debug, Clone)]
#[command(name = "archive-catalog")]
#[command(about = "Browse the archive catalog of one user profile")]
pub struct Config {
    /// Directory holding the per-user profiles and DefaultConfig.ini
    #[arg(long, env = "ARCHIVE_PROFILE_ROOT")]
    pub profile_root: Option<PathBuf>,

    /// User whose profile is locked for this session
    #[arg(long, env = "ARCHIVE_USER")]
    pub user: String,

    /// JSON catalog dump served as the catalog backend
    #[arg(long, env = "ARCHIVE_CATALOG")]
    pub catalog: PathBuf,

    /// Asset shown for icons the backend cannot resolve
    #[arg(long, env = "ARCHIVE_FALLBACK_ASSET_ID")]
    pub fallback_asset_id: Option<i32>,

    /// Number of tree levels to expand
    #[arg(long, default_value = "2", env = "ARCHIVE_TREE_DEPTH")]
    pub depth: usize,
}

impl Config {
    /// Profile root, defaulting to the platform's local data directory.
    pub fn profile_root(&self) -> PathBuf {
        self.profile_root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("archive-catalog")
                .join("USERS")
        })
    }

    pub fn layout(&self) -> ProfileLayout {
        ProfileLayout::new(self.profile_root(), self.user.clone())
    }

    pub fn asset_config(&self) -> AssetCacheConfig {
        AssetCacheConfig {
            fallback_asset_id: self.fallback_asset_id,
            ..Default::default()
        }
    }
}
