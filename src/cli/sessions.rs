use anyhow::{Context, Result};
use clap::Args;

use crate::{app::describe_listing, config::Config, session::SessionStore};

/// List stored sessions, newest first
#[derive(Debug, Args)]
pub struct SessionsCommand {
    /// Delete the record of this session instead of listing
    #[arg(long, value_name = "ID")]
    pub remove: Option<String>,
}

impl SessionsCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let store = SessionStore::new(config.sessions_dir());

        if let Some(ref id) = self.remove {
            store
                .remove(id)
                .with_context(|| format!("Failed to remove session {}", id))?;
            println!("Removed session {}", id);
            return Ok(());
        }

        let listings = store.list();
        if listings.is_empty() {
            println!("No saved sessions in {}", store.sessions_dir().display());
            return Ok(());
        }
        for listing in &listings {
            println!("{}", describe_listing(listing, None));
        }
        Ok(())
    }
}
