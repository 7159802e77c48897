//! Output formatting utilities

use crate::client::ResourceVector;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// `cpu/memory/rx/tx` with trailing zeros trimmed
pub fn format_vector(v: &ResourceVector) -> String {
    format!(
        "{}/{}/{}/{}",
        trim(v.cpu),
        trim(v.memory),
        trim(v.net_rx),
        trim(v.net_tx)
    )
}

fn trim(value: f64) -> String {
    let formatted = format!("{:.2}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Color VM, host, task and system states
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "idle" | "running" | "active" | "finished" | "healthy" => status.green().to_string(),
        "pending" | "initializing" | "paused" | "passive" | "shutdown_pending" | "degraded" => {
            status.yellow().to_string()
        }
        "error" | "failed" | "retired" | "unhealthy" => status.red().to_string(),
        "management" | "reconfiguration" | "relocation" | "energysaver" => {
            status.blue().to_string()
        }
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_vector_trims_zeros() {
        let v = ResourceVector {
            cpu: 2.0,
            memory: 0.5,
            net_rx: 12.25,
            net_tx: 0.0,
        };
        assert_eq!(format_vector(&v), "2/0.5/12.25/0");
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("TABLE".parse::<OutputFormat>(), Ok(OutputFormat::Table));
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
