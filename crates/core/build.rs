// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::env::var("OUT_DIR")?;
    let path = std::path::Path::new(&out_dir).join("env_vars.rs");
    let mut f = std::fs::File::create(path)?;

    let vars = [
        ("PGDATA", "PGDATA"),
        ("PGPORT", "PGPORT"),
        ("XPG_BIN_DIR", "XPG_BIN_DIR"),
        ("XPG_OLD_BIN_TEMPLATE", "XPG_OLD_BIN_TEMPLATE"),
        ("XPG_ARCHIVE_DIR", "XPG_ARCHIVE_DIR"),
        ("XPG_LOG_DIR", "XPG_LOG_DIR"),
        ("XPG_SUPERVISOR_BINARY", "XPG_SUPERVISOR_BINARY"),
    ];

    for (const_name, env_name) in &vars {
        writeln!(f, "pub const {const_name}: &str = \"{env_name}\";")?;
    }

    Ok(())
}
