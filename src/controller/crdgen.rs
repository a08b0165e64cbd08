//! # CRD Generator
//!
//! Prints the Qliksense CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/qliksense.yaml
//! cargo run --bin crdgen -- --output config/crd/qliksense.yaml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use qliksense_operator::crd::Qliksense;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "crdgen", about = "Generate the Qliksense CRD")]
struct Cli {
    /// Write the CRD to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let yaml =
        serde_yaml::to_string(&Qliksense::crd()).context("Failed to serialize Qliksense CRD")?;

    match cli.output {
        Some(path) => std::fs::write(&path, yaml)
            .with_context(|| format!("Failed to write CRD to {}", path.display()))?,
        None => print!("{yaml}"),
    }
    Ok(())
}
