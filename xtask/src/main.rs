use anyhow::Result;
use clap::{Parser, Subcommand};
use hpm_core::{ComponentSet, FwVersion, ImageBuilder};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the CLI
    Run {
        /// Arguments passed to `hpm`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the test suite
    Test,
    /// Write a two-component sample image for bench testing
    SampleImage { out: PathBuf },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut full = vec!["run", "-p", "hpm-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full, "Run")?;
        }
        Commands::Test => {
            println!("Testing workspace...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::SampleImage { out } => {
            let data = ImageBuilder::new()
                .backup(ComponentSet::from_bits(0x02))
                .upload(0, FwVersion::new(1, 0, [0; 4]), "BOOT", vec![0xA5; 256])
                .upload(1, FwVersion::new(2, 1, [0, 0, 0, 7]), "APP", vec![0x5A; 1024])
                .build();
            std::fs::write(out, &data)?;
            println!("Wrote {} bytes to {}", data.len(), out.display());
        }
    }

    Ok(())
}
