mod config;
mod logging;
mod runner;

use clap::{Args, Parser, Subcommand};

use crate::config::BenchConfig;
use crate::logging::LogFormat;
use crate::runner::{Mode, RunSettings};

#[derive(Parser)]
#[command(
    name = "marlin-moe",
    about = "Run and verify the grouped Marlin MoE GEMM on synthetic workloads"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic workload, verify it against a dense reference and time it
    Run(WorkloadArgs),

    /// Show the effective configuration, optionally saving it to the config file
    Config {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Write the merged configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Workload flags; unset flags fall back to the config file, then defaults.
#[derive(Args, Debug, Default)]
struct WorkloadArgs {
    /// Workload kind
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Number of tokens
    #[arg(long)]
    num_tokens: Option<usize>,

    /// Output features (hidden size in fused mode)
    #[arg(long)]
    size_n: Option<usize>,

    /// Input features
    #[arg(long)]
    size_k: Option<usize>,

    /// Expert FFN width (fused mode)
    #[arg(long)]
    intermediate_size: Option<usize>,

    /// Number of experts
    #[arg(long)]
    num_experts: Option<usize>,

    /// Experts per token
    #[arg(long)]
    topk: Option<usize>,

    /// Weight bits (4 or 8)
    #[arg(long)]
    bits: Option<u32>,

    /// Quantization group size (-1 for per-channel)
    #[arg(long, allow_negative_numbers = true)]
    group_size: Option<i32>,

    /// Token block size (16, 32, 48 or 64); chosen from the batch when unset
    #[arg(long)]
    moe_block_size: Option<usize>,

    /// Timed iterations
    #[arg(long)]
    iterations: Option<usize>,

    /// Untimed warmup iterations
    #[arg(long)]
    warmup: Option<usize>,

    /// Random seed for the synthetic workload
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum relative error tolerated against the dense reference
    #[arg(long)]
    tolerance: Option<f32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MARLIN_MOE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl WorkloadArgs {
    fn to_config(&self) -> BenchConfig {
        BenchConfig {
            mode: self.mode.map(|m| m.as_str().to_string()),
            num_tokens: self.num_tokens,
            size_n: self.size_n,
            size_k: self.size_k,
            intermediate_size: self.intermediate_size,
            num_experts: self.num_experts,
            topk: self.topk,
            bits: self.bits,
            group_size: self.group_size,
            moe_block_size: self.moe_block_size,
            iterations: self.iterations,
            warmup: self.warmup,
            seed: self.seed,
            tolerance: self.tolerance,
            log_level: self.log_level.clone(),
        }
    }
}

/// CLI > config file > defaults.
fn effective_config(file_config: BenchConfig, args: &WorkloadArgs) -> BenchConfig {
    let mut config = file_config;
    config.merge(&args.to_config());
    config
}

fn main() -> anyhow::Result<()> {
    let file_config = BenchConfig::load();
    if let Some(path) = BenchConfig::default_path() {
        if path.exists() {
            eprintln!("Loaded config from: {}", path.display());
        }
    }

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let config = effective_config(file_config, &args);
            let level = config.log_level.as_deref().unwrap_or("info");
            logging::init(level, LogFormat::from_env())?;

            let settings = RunSettings::resolve(&config)?;
            let report = runner::run(&settings)?;
            tracing::info!(
                mode = report.mode.as_str(),
                moe_block_size = report.moe_block_size,
                max_rel_error = report.max_rel_error,
                mean_us = report.mean.as_micros() as u64,
                min_us = report.min.as_micros() as u64,
                gflops = report.gflops(),
                "run complete"
            );
            println!(
                "{} tokens={} experts={} topk={} block={}: mean {:?}, min {:?}, {:.2} GFLOP/s, max rel error {:.2e}",
                report.mode.as_str(),
                settings.num_tokens,
                settings.num_experts,
                settings.topk,
                report.moe_block_size,
                report.mean,
                report.min,
                report.gflops(),
                report.max_rel_error
            );
        }
        Command::Config { workload, save } => {
            let config = effective_config(file_config, &workload);
            // Validate before printing or saving
            RunSettings::resolve(&config)?;
            print!("{}", toml::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                eprintln!("Saved config to: {}", path.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "marlin-moe",
            "run",
            "--mode",
            "fused",
            "--group-size",
            "-1",
            "--topk",
            "4",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode, Some(Mode::Fused));
        assert_eq!(args.group_size, Some(-1));
        assert_eq!(args.topk, Some(4));
    }

    #[test]
    fn test_cli_overrides_file_config() {
        let file_config = BenchConfig {
            topk: Some(2),
            num_experts: Some(16),
            ..Default::default()
        };
        let args = WorkloadArgs {
            topk: Some(4),
            ..Default::default()
        };
        let config = effective_config(file_config, &args);
        assert_eq!(config.topk, Some(4));
        assert_eq!(config.num_experts, Some(16));
    }

    #[test]
    fn test_config_subcommand_save_flag() {
        let cli = Cli::try_parse_from(["marlin-moe", "config", "--save", "--bits", "8"]).unwrap();
        let Command::Config { workload, save } = cli.command else {
            panic!("expected config");
        };
        assert!(save);
        assert_eq!(workload.bits, Some(8));
    }
}
