//! Matchmaker entrypoint.

#![forbid(unsafe_code)]

use eyre::Result;

use matchmaker::matchmaker::Matchmaker;
use roomforge_base::agent_main;

#[tokio::main]
async fn main() -> Result<()> {
    agent_main::<Matchmaker>().await
}
