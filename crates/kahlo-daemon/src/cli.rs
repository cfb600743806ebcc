// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `kahlod`'s CLI surface (§5 "SUPPLEMENTED FEATURES"): a minimal `clap`
//! parser for local smoke-testing, not a full client/server protocol.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kahlod", version, about = "Kahlo host control plane daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the facade loop against stdin-framed JSON requests, one per line.
    Serve,
    /// Print the resolved configuration (after defaults/env overrides) as JSON.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    Show,
}
