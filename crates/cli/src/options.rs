// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Splitting `-o` strings into engine arguments.

use crate::error::{Error, Result};

/// Split `options` into words the way a POSIX shell would.
pub fn split_options(options: &str) -> Result<Vec<String>> {
    shlex::split(options).ok_or_else(|| Error::Options(options.to_string()))
}

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;
