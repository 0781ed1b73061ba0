//! Vireo - Main Entry Point
//!
//! Sets up the shared search state and hands control to the UCI loop.

use anyhow::Result;
use vireo::uci::UciHandler;

fn main() -> Result<()> {
    println!("Vireo 0.1 by the Vireo team");

    let mut handler = UciHandler::new()?;
    handler.run();
    Ok(())
}
