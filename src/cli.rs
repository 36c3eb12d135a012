//! # Stage: Command Line
//!
//! ## Responsibility
//! clap definitions for the `landing-experiments` binary and the value
//! parsers for variant, goal, split and status arguments. Dispatch lives in
//! `main.rs`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::model::{Goal, NewVariant, PageId, TestId, TestStatus, VariantId};

#[derive(Parser, Debug)]
#[command(name = "landing-experiments")]
#[command(version)]
#[command(about = "A/B testing engine for landing pages: allocation, conversions, significance")]
pub struct Args {
    /// TOML config file (defaults apply when omitted)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path, overrides storage.path from the config
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a draft test with its variants
    Create {
        #[arg(long)]
        page: PageId,

        #[arg(long)]
        name: String,

        /// NAME:PCT[:control][@TARGET], repeat once per variant
        #[arg(long = "variant", value_parser = parse_variant_spec, required = true)]
        variants: Vec<NewVariant>,

        /// form_submit[:ID], click:SELECTOR, page_view:PATH or custom:EVENT
        #[arg(long = "goal", value_parser = parse_goal_spec)]
        goals: Vec<Goal>,

        /// Significance target in percent
        #[arg(long)]
        confidence: Option<f64>,

        /// Visitors per group required before a winner is declared
        #[arg(long)]
        min_sample: Option<u32>,
    },

    /// Move a test to draft, running, paused or completed
    Status {
        test_id: TestId,
        #[arg(value_parser = parse_status)]
        status: TestStatus,
    },

    /// List running tests on a page
    Active { page: PageId },

    /// Show a test and its variants
    Show { test_id: TestId },

    /// Replace traffic percentages; existing allocations stay put
    Rebalance {
        test_id: TestId,
        /// VARIANT_ID=PCT, repeat once per variant
        #[arg(long = "split", value_parser = parse_split_spec, required = true)]
        split: Vec<(VariantId, u8)>,
    },

    /// Delete a test with its variants, allocations and conversions
    Delete { test_id: TestId },

    /// Allocate a visitor and print the assigned variant
    Allocate { test_id: TestId, visitor: String },

    /// Record a conversion event for an allocated visitor
    Convert {
        test_id: TestId,
        variant_id: VariantId,
        visitor: String,
        #[arg(long = "type", default_value = "conversion")]
        conversion_type: String,
        #[arg(long)]
        value: Option<f64>,
    },

    /// Compute significance results for a test
    Results {
        test_id: TestId,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete allocations and conversions older than the retention window
    Cleanup {
        /// Override retention.days_to_keep
        #[arg(long)]
        days: Option<u32>,
    },

    /// Run retention cleanup periodically until interrupted
    RetentionDaemon,

    /// Drive simulated visitors through a running test
    Simulate {
        test_id: TestId,
        #[arg(long, default_value = "1000")]
        visitors: u32,
        /// Conversion probability per variant in creation order, e.g. 0.10,0.13
        #[arg(long, value_delimiter = ',', required = true)]
        rates: Vec<f64>,
        /// Prefix for generated visitor ids
        #[arg(long, default_value = "sim")]
        prefix: String,
    },
}

/// Parse `NAME:PCT[:control][@TARGET]`. The target defaults to the name.
pub fn parse_variant_spec(raw: &str) -> Result<NewVariant, String> {
    let (head, target) = match raw.split_once('@') {
        Some((head, target)) => (head, Some(target)),
        None => (raw, None),
    };
    let mut parts = head.split(':');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err(format!("variant '{}' has no name", raw));
    }
    let pct = parts
        .next()
        .ok_or_else(|| format!("variant '{}' is missing a traffic percentage", raw))?
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("variant '{}': bad percentage: {}", raw, e))?;
    let is_control = match parts.next().map(str::trim) {
        None => false,
        Some("control") => true,
        Some(other) => return Err(format!("variant '{}': unknown flag '{}'", raw, other)),
    };
    if parts.next().is_some() {
        return Err(format!("variant '{}' has too many fields", raw));
    }
    let target = target.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(name);
    let variant = NewVariant::new(name, target, pct);
    Ok(NewVariant { is_control, ..variant })
}

pub fn parse_goal_spec(raw: &str) -> Result<Goal, String> {
    let (kind, arg) = match raw.split_once(':') {
        Some((kind, arg)) => (kind.trim(), Some(arg.trim().to_string())),
        None => (raw.trim(), None),
    };
    let required = |arg: Option<String>| arg.ok_or_else(|| format!("goal '{}' needs an argument", raw));
    let goal = match kind {
        "form_submit" => Goal::FormSubmit { form_id: arg },
        "click" => Goal::Click { selector: required(arg)? },
        "page_view" => Goal::PageView { path: required(arg)? },
        "custom" => Goal::Custom { event: required(arg)? },
        other => return Err(format!("unknown goal kind '{}'", other)),
    };
    goal.validate().map_err(|e| e.to_string())?;
    Ok(goal)
}

/// Parse `VARIANT_ID=PCT`.
pub fn parse_split_spec(raw: &str) -> Result<(VariantId, u8), String> {
    let (id, pct) = raw
        .split_once('=')
        .ok_or_else(|| format!("split '{}' must look like VARIANT_ID=PCT", raw))?;
    let id = id.trim().parse::<VariantId>().map_err(|e| format!("split '{}': {}", raw, e))?;
    let pct = pct.trim().parse::<u8>().map_err(|e| format!("split '{}': {}", raw, e))?;
    Ok((id, pct))
}

pub fn parse_status(raw: &str) -> Result<TestStatus, String> {
    raw.parse::<TestStatus>().map_err(|e| e.to_string())
}
