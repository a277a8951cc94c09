pub mod chain;
pub mod invoke;
pub mod processor;
pub mod runner;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use tinyclaw_core::config::Paths;

pub async fn run(paths: Arc<Paths>) -> Result<()> {
    println!("Tinyclaw Queue Processor");
    println!("  Home: {}", paths.tinyclaw_home.display());
    println!("  Incoming: {}", paths.queue_incoming.display());

    processor::run_queue_processor(paths).await
}
