// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Result rendering shared by the commands

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(&self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON output")?;
    println!("{}", rendered);
    Ok(())
}

/// Shorten a long identifier for table output
pub fn short_id(id: &impl std::fmt::Display) -> String {
    let full = id.to_string();
    full.chars().take(8).collect()
}

/// Fixed-width confidence bar, e.g. `[#####.....]`
pub fn confidence_bar(confidence: f64) -> String {
    let filled = (confidence.clamp(0.0, 1.0) * 10.0).round() as usize;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(10 - filled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bar() {
        assert_eq!(confidence_bar(0.0), "[..........]");
        assert_eq!(confidence_bar(0.55), "[######....]");
        assert_eq!(confidence_bar(3.0), "[##########]");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id(&"0123456789abcdef"), "01234567");
        assert_eq!(short_id(&"abc"), "abc");
    }
}
