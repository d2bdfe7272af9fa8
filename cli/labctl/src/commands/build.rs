//! Build lab images.

use anyhow::Result;
use clap::Args;

use crate::output::print_success;

use super::CommandContext;

/// Build the images named in the compose file.
#[derive(Debug, Args)]
pub struct BuildCommand {}

impl BuildCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let compose = ctx.compose().await;
        compose.build_images().await?;
        print_success(&format!(
            "Built images from {}",
            compose.compose_file().display()
        ));
        Ok(())
    }
}
