use clap::Parser;
use colored::*;
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use landing_experiments::cli::{Args, Command};
use landing_experiments::{
    EngineConfig, EngineError, ExperimentEngine, NewTest, ResultStatus, Test, TestId, TestResults, TestStatus,
    Variant,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> CliResult<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = &args.db {
        config.storage.path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn status_label(status: TestStatus) -> ColoredString {
    match status {
        TestStatus::Draft => status.as_str().dimmed(),
        TestStatus::Running => status.as_str().green().bold(),
        TestStatus::Paused => status.as_str().yellow(),
        TestStatus::Completed => status.as_str().blue(),
    }
}

fn print_test(test: &Test) {
    println!(
        "{} {} {} [{}] page={} target={:.1}% min_sample={}",
        "test".bold(),
        test.id.to_string().cyan(),
        test.name,
        status_label(test.status),
        test.page_id,
        test.confidence_level,
        test.min_sample_size
    );
}

fn print_variant(variant: &Variant) {
    let control = if variant.is_control { " (control)".dimmed().to_string() } else { String::new() };
    println!(
        "  {:>6}  {:<20} {:>3}%  {}{}",
        variant.id.to_string().cyan(),
        variant.name,
        variant.traffic_percentage,
        variant.target,
        control
    );
}

fn print_results(results: &TestResults) {
    let status = match results.test_status {
        ResultStatus::Significant => results.test_status.to_string().green().bold(),
        ResultStatus::Inconclusive => results.test_status.to_string().yellow(),
        ResultStatus::InsufficientData => results.test_status.to_string().dimmed(),
    };
    println!(
        "{} {}  {}  significance {:.2}% (target {:.1}%)",
        "results".bold(),
        results.test_id.to_string().cyan(),
        status,
        results.statistical_significance,
        results.confidence_interval
    );
    println!(
        "  {:>6}  {:<20} {:>9} {:>9} {:>8}  {:<17}",
        "id", "variant", "visitors", "converts", "rate", "95% ci"
    );
    for v in &results.variants {
        let mut name = v.name.clone();
        if v.is_control {
            name.push_str(" *");
        }
        let line = format!(
            "  {:>6}  {:<20} {:>9} {:>9} {:>7.2}%  [{:.2}, {:.2}]",
            v.variant_id, name, v.visitors, v.conversions, v.conversion_rate, v.ci_lower, v.ci_upper
        );
        if v.is_winner {
            println!("{}  {}", line.green(), "winner".green().bold());
        } else {
            println!("{}", line);
        }
    }
    for c in &results.comparisons {
        println!(
            "  vs control: variant {} z={:.3} p={:.4} adjusted p={:.4}",
            c.variant_id, c.z_score, c.p_value, c.adjusted_p_value
        );
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

fn simulate(engine: &ExperimentEngine, test_id: TestId, visitors: u32, rates: &[f64], prefix: &str) -> CliResult<()> {
    let variants = engine.lifecycle().variants(test_id)?;
    if rates.len() != variants.len() {
        return Err(format!("{} rates given for {} variants", rates.len(), variants.len()).into());
    }
    if let Some(bad) = rates.iter().find(|r| !(0.0..=1.0).contains(*r)) {
        return Err(format!("conversion rate {} is outside [0, 1]", bad).into());
    }

    let mut rng = rand::thread_rng();
    let mut allocated = 0u32;
    let mut converted = 0u32;
    for i in 0..visitors {
        let visitor = format!("{}-{}", prefix, i);
        let Some(variant) = engine.allocate(test_id, &visitor)? else {
            continue;
        };
        allocated += 1;
        let rate = variants
            .iter()
            .position(|v| v.id == variant.id)
            .map(|idx| rates[idx])
            .unwrap_or(0.0);
        if rng.gen_bool(rate) {
            engine.record_conversion(test_id, variant.id, &visitor, "simulated", None)?;
            converted += 1;
        }
    }
    info!(test_id, allocated, converted, "simulation finished");
    if allocated == 0 {
        println!("{}", "test is not running, nothing allocated".yellow());
        return Ok(());
    }
    print_results(&engine.get_results(test_id)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> CliResult<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args)?;
    let engine = ExperimentEngine::open(config)?;

    match args.command {
        Command::Create { page, name, variants, goals, confidence, min_sample } => {
            let new_test = NewTest { name, confidence_level: confidence, min_sample_size: min_sample, goals, variants };
            let created = engine.create_test(page, &new_test)?;
            print_test(&created.test);
            created.variants.iter().for_each(print_variant);
        }
        Command::Status { test_id, status } => {
            print_test(&engine.update_status(test_id, status)?);
        }
        Command::Active { page } => {
            let tests = engine.get_active_tests_for_page(page)?;
            if tests.is_empty() {
                println!("{}", format!("no running tests on page {}", page).dimmed());
            }
            tests.iter().for_each(print_test);
        }
        Command::Show { test_id } => {
            print_test(&engine.lifecycle().get_test(test_id)?);
            engine.lifecycle().variants(test_id)?.iter().for_each(print_variant);
        }
        Command::Rebalance { test_id, split } => {
            engine.lifecycle().rebalance(test_id, &split)?.iter().for_each(print_variant);
        }
        Command::Delete { test_id } => {
            engine.lifecycle().delete_test(test_id)?;
            println!("deleted test {}", test_id.to_string().cyan());
        }
        Command::Allocate { test_id, visitor } => match engine.allocate(test_id, &visitor)? {
            Some(variant) => print_variant(&variant),
            None => println!("{}", "no variant: test is not running".yellow()),
        },
        Command::Convert { test_id, variant_id, visitor, conversion_type, value } => {
            let conversion = engine.record_conversion(test_id, variant_id, &visitor, &conversion_type, value)?;
            println!(
                "recorded conversion {} for {} on variant {}",
                conversion.id.to_string().cyan(),
                conversion.visitor_id,
                conversion.variant_id
            );
        }
        Command::Results { test_id, json } => {
            let results = engine.get_results(test_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results).map_err(EngineError::from)?);
            } else {
                print_results(&results);
            }
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(engine.config().retention.days_to_keep);
            let report = engine.cleanup(days)?;
            println!(
                "removed {} conversions and {} allocations older than {} days",
                report.conversions_deleted.to_string().bold(),
                report.allocations_deleted.to_string().bold(),
                days
            );
        }
        Command::RetentionDaemon => {
            info!(
                days_to_keep = engine.config().retention.days_to_keep,
                interval_hours = engine.config().retention.interval_hours,
                "retention daemon started"
            );
            let handle = engine.spawn_retention();
            tokio::signal::ctrl_c().await?;
            handle.abort();
            info!("retention daemon stopped");
        }
        Command::Simulate { test_id, visitors, rates, prefix } => {
            simulate(&engine, test_id, visitors, &rates, &prefix)?;
        }
    }

    Ok(())
}
