use crate::input::RunConfig;
use crate::model::{AcceleratorReport, OutputState};
use crate::reference::ReferenceTime;
use crate::state::InputState;
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

/// Sets up `env_logger`. `RUST_LOG` wins over the flags when set.
pub fn init_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        log::LevelFilter::Error
    } else if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp_secs();
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    if let Err(e) = builder.try_init() {
        log::debug!("Logger already initialized: {}", e);
    }
}

pub fn show_greeting(config_path: Option<&Path>) {
    println!("=== AIFS Initial Conditions ===");
    match config_path {
        Some(path) => println!("Loading configuration from: {}", path.display()),
        None => println!("Using built-in configuration"),
    }
}

pub fn config_echo(config: &RunConfig) {
    println!("\nConfiguration:");
    match config.date {
        Some(date) => println!("  Date: {}", date.format("%Y-%m-%dT%H:%M:%SZ")),
        None => println!("  Date: latest available"),
    }
    println!("  Source: {}", config.source.base_url);
    println!(
        "  Grids: {} x {} degrees -> {:?}",
        config.grid.source.dlat, config.grid.source.dlon, config.grid.target
    );
    println!("  Checkpoint: {}", config.runner.checkpoint);
    println!("  Device: {}", config.runner.device);
    println!("  Lead time: {} h", config.runner.lead_time_hours);
    println!("  Field groups: {}", config.catalog.groups.len());
    for group in &config.catalog.groups {
        if group.levels.is_empty() {
            println!("    {}: {}", group.name, group.params.join(" "));
        } else {
            println!(
                "    {}: {} on {} levels",
                group.name,
                group.params.join(" "),
                group.levels.len()
            );
        }
    }
}

pub fn show_reference(reference: &ReferenceTime) {
    let [previous, current] = reference.query_times();
    println!("\nReference time: {}", reference);
    println!(
        "  Inputs at {} and {}",
        previous.format("%Y-%m-%d %HZ"),
        current.format("%Y-%m-%d %HZ")
    );
}

pub fn show_input_summary(state: &InputState) {
    println!(
        "\nInput state: {} fields on {} points",
        state.len(),
        state.grid_size().unwrap_or(0)
    );
}

fn range(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

fn write_range(out: &mut String, label: &str, values: impl Iterator<Item = f64>) {
    match range(values) {
        Some((lo, hi)) => {
            let _ = writeln!(out, "  {:<10} min={:<12.6} max={:.6}", label, lo, hi);
        }
        None => {
            let _ = writeln!(out, "  {:<10} (empty)", label);
        }
    }
}

/// Text rendering of a forecast state: date, coordinate ranges and one line
/// per field with its extremes, at most `max_lines` fields.
pub fn format_state(state: &OutputState, max_lines: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "State {} (+{}h), {} fields",
        state.date.format("%Y-%m-%d %H:%M:%S"),
        state.step_hours(),
        state.fields.len()
    );
    write_range(&mut out, "latitudes", state.latitudes.iter().copied());
    write_range(&mut out, "longitudes", state.longitudes.iter().copied());

    for (name, values) in state.fields.iter().take(max_lines) {
        write_range(&mut out, name, values.iter().copied());
    }
    if state.fields.len() > max_lines {
        let _ = writeln!(out, "  ... {} more", state.fields.len() - max_lines);
    }
    out
}

pub fn print_state(state: &OutputState, max_lines: usize) {
    println!("\n{}", format_state(state, max_lines).trim_end());
}

pub fn show_devices(report: &AcceleratorReport) {
    println!("CUDA devices: {}", report.devices.len());
    if let Some(visible) = &report.visible_devices {
        println!("  CUDA_VISIBLE_DEVICES={}", visible);
    }
    for device in &report.devices {
        match device.memory_mib {
            Some(memory) => println!("  [{}] {} ({} MiB)", device.index, device.name, memory),
            None => println!("  [{}] {}", device.index, device.name),
        }
    }
}

pub fn show_farewell_with_timing(elapsed: Duration) {
    println!("\n=== Run completed in {:.2?} ===", elapsed);
}
