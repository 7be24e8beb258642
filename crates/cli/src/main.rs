// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::Parser;
use xpg_ctl::Cli;

fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let cli = Cli::parse();
    xpg_ctl::setup_logging();
    match xpg_ctl::run(cli.command, raw) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("xpg_ctl: {}", e);
            std::process::exit(1);
        }
    }
}
