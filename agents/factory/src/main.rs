//! Factory entrypoint.

#![forbid(unsafe_code)]

use eyre::Result;

use factory::factory::Factory;
use roomforge_base::agent_main;

#[tokio::main]
async fn main() -> Result<()> {
    agent_main::<Factory>().await
}
