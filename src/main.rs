use aifs_init::cli::{Cli, Commands, ConfigFormat, OutputFormat, RunOverrides, generate_template, render_config};
use aifs_init::info::{
    catalog_info, grid_info, print_catalog_info_human, print_grid_info_csv, print_grid_info_human,
    print_grid_info_json, print_grid_info_yaml,
};
use aifs_init::input::RunConfig;
use aifs_init::log::{
    config_echo, init_logging, show_devices, show_farewell_with_timing, show_greeting,
    show_input_summary, show_reference,
};
use aifs_init::model::{Checkpoint, accelerator_report};
use aifs_init::opendata::OpenDataClient;
use aifs_init::output::{input_file_name, input_state_frame, write_parquet};
use aifs_init::reference::{AnalysisClock, FixedClock, ReferenceTime};
use aifs_init::storage::join_location;
use aifs_init::{build_regridder, prepare_input_state};
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let start_time = Instant::now();
    match cli.command {
        Commands::Run {
            ref overrides,
            lead_time,
            device,
            persistence,
            ref results_dir,
            write_states,
            ref input_state,
            dry_run,
        } => {
            let mut config = load_config(cli.config.as_deref(), overrides, cli.quiet)?;
            if let Some(hours) = lead_time {
                config.runner.lead_time_hours = hours;
            }
            if let Some(device) = device {
                config.runner.device = device;
            }
            if persistence {
                config.runner.checkpoint = Checkpoint::Persistence;
            }
            if let Some(dir) = results_dir {
                config.output.results_dir = dir.clone();
            }
            if write_states {
                config.output.write_states = true;
            }
            if let Some(location) = input_state {
                config.output.input_state = Some(location.clone());
            }
            config.validate().context("Invalid run configuration")?;

            if !cli.quiet {
                config_echo(&config);
            }
            if dry_run {
                println!("\nDry run: configuration is valid, nothing downloaded");
                return Ok(());
            }

            let client = OpenDataClient::new(config.source.clone())
                .context("Failed to create open-data client")?;
            let summary = aifs_init::run(&config, &client, &client, !overrides.no_progress)
                .await
                .context("Forecast run failed")?;
            for artifact in &summary.artifacts {
                println!("Wrote {}", artifact);
            }
        }

        Commands::Fetch {
            ref overrides,
            ref output,
        } => {
            let config = load_config(cli.config.as_deref(), overrides, cli.quiet)?;
            config.validate().context("Invalid run configuration")?;
            let client = OpenDataClient::new(config.source.clone())
                .context("Failed to create open-data client")?;

            let reference = match config.date {
                Some(date) => ReferenceTime::resolve(&FixedClock(date)).await?,
                None => ReferenceTime::resolve(&client).await?,
            };
            show_reference(&reference);

            let (target, regridder) = build_regridder(&config.grid)?;
            let input = prepare_input_state(
                &client,
                &config.catalog,
                &regridder,
                reference,
                !overrides.no_progress,
            )
            .await
            .context("Failed to assemble input state")?;
            show_input_summary(&input);

            if let Some(location) = output.clone().or(config.output.input_state.clone()) {
                let location = if location.ends_with(".parquet") {
                    location
                } else {
                    join_location(&location, &input_file_name(&config.output.experiment, &reference))
                };
                let (latitudes, longitudes) = target.latlons();
                let mut df = input_state_frame(&input, &latitudes, &longitudes)?;
                write_parquet(&mut df, &location)
                    .await
                    .with_context(|| format!("Failed to write input state to {}", location))?;
                println!("Wrote {}", location);
            }
        }

        Commands::Latest { ref base_url } => {
            let mut config = load_config(cli.config.as_deref(), &RunOverrides::default(), true)?;
            if let Some(url) = base_url {
                config.source.base_url = url.clone();
            }
            let client = OpenDataClient::new(config.source)?;
            let latest = client
                .latest()
                .await
                .context("Failed to find the latest analysis")?;
            println!("{}", ReferenceTime::new(latest));
            return Ok(());
        }

        Commands::Grid {
            ref target,
            detailed,
        } => {
            let overrides = RunOverrides {
                target_grid: target.clone(),
                ..RunOverrides::default()
            };
            let config = load_config(cli.config.as_deref(), &overrides, true)?;
            let (grid, _) = build_regridder(&config.grid).context("Failed to build target grid")?;
            let info = grid_info(&config.grid.source, &grid);
            match cli.output_format {
                OutputFormat::Human => print_grid_info_human(&info, detailed),
                OutputFormat::Json => print_grid_info_json(&info)?,
                OutputFormat::Yaml => print_grid_info_yaml(&info)?,
                OutputFormat::Csv => print_grid_info_csv(&info),
            }
            return Ok(());
        }

        Commands::Catalog => {
            let catalog = load_config(cli.config.as_deref(), &RunOverrides::default(), true)?.catalog;
            let info = catalog_info(&catalog)?;
            match cli.output_format {
                OutputFormat::Human | OutputFormat::Csv => print_catalog_info_human(&info),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
                OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&info)?),
            }
            return Ok(());
        }

        Commands::Devices => {
            let report = accelerator_report()
                .await
                .context("Failed to query CUDA devices")?;
            match cli.output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&report)?),
                _ => show_devices(&report),
            }
            return Ok(());
        }

        Commands::Template {
            ref template_type,
            ref output,
            ref format,
        } => {
            let config = generate_template(template_type);
            let text = render_config(&config, format)?;
            write_or_print(output.as_deref(), &text)?;
            if let Some(path) = output {
                let kind = match format {
                    ConfigFormat::Json => "JSON",
                    ConfigFormat::Yaml => "YAML",
                };
                eprintln!("{} template written to {}", kind, path.display());
            }
            return Ok(());
        }

        Commands::Completions { shell, ref output } => {
            let mut command = Cli::command();
            match output {
                Some(path) => {
                    let mut file = fs::File::create(path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    clap_complete::generate(shell, &mut command, "aifs-init", &mut file);
                }
                None => clap_complete::generate(shell, &mut command, "aifs-init", &mut io::stdout()),
            }
            return Ok(());
        }
    }

    if !cli.quiet {
        show_farewell_with_timing(start_time.elapsed());
    }
    Ok(())
}

/// Reads the configuration file (or the defaults) and applies the shared
/// command-line overrides.
fn load_config(path: Option<&Path>, overrides: &RunOverrides, quiet: bool) -> Result<RunConfig> {
    if !quiet {
        show_greeting(path);
    }
    let mut config = match path {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RunConfig::default(),
    };
    overrides.apply(&mut config);
    Ok(config)
}

fn write_or_print(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => println!("{}", text),
    }
    Ok(())
}
