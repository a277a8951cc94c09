use std::sync::Arc;

use anyhow::Result;
use tinyclaw_core::config::Paths;

#[tokio::main]
async fn main() -> Result<()> {
    let base_dir = std::env::current_dir()?;
    let paths = Arc::new(Paths::resolve(&base_dir));
    tinyclaw_queue::run(paths).await
}
