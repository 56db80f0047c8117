//! Command-line catalog browser.
//!
//! Opens a session for one user profile, walks the catalog tree to the
//! configured depth and prints every node with the size of its icon.

use std::sync::Arc;

use archive_catalog::config::Config;
use archive_catalog::{
    CatalogNode, CatalogSession, CatalogSource, GuardError, JsonCatalogSource, NodeKind,
    SessionError,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting archive-catalog v{}", env!("CARGO_PKG_VERSION"));
    info!("  User: {}", config.user);
    info!("  Profile root: {}", config.profile_root().display());
    info!("  Catalog: {}", config.catalog.display());

    let source: Arc<dyn CatalogSource> = Arc::new(JsonCatalogSource::new(&config.catalog));
    let session = match CatalogSession::open(config.layout(), source, config.asset_config()).await
    {
        Ok(session) => session,
        Err(SessionError::Guard(GuardError::AlreadyRunning { path, holder_pid })) => {
            error!(
                "Profile of {} is in use by another session ({}{})",
                config.user,
                path.display(),
                holder_pid.map(|p| format!(", pid {}", p)).unwrap_or_default()
            );
            anyhow::bail!("user {} already has a running session", config.user);
        }
        Err(e) => return Err(e.into()),
    };

    let mut stack: Vec<(CatalogNode, usize)> = session
        .roots()
        .await
        .into_iter()
        .rev()
        .map(|node| (node, 0))
        .collect();

    let mut printed = 0usize;
    while let Some((node, level)) = stack.pop() {
        let icon = session.icon(node.image_id).await?;
        let marker = match node.kind {
            NodeKind::Folder if node.has_children => "+",
            NodeKind::Folder => "-",
            NodeKind::Document => "*",
        };
        println!(
            "{}{} {} ({} byte icon)",
            "  ".repeat(level),
            marker,
            node.name,
            icon.len()
        );
        printed += 1;

        if node.has_children && level + 1 < config.depth {
            let children = session.expand(&node.id).await;
            stack.extend(children.into_iter().rev().map(|child| (child, level + 1)));
        }
    }

    info!(
        "Printed {} node(s), {} icon(s) cached",
        printed,
        session.assets().len()
    );
    session.close();
    Ok(())
}
