#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use persona_survey::gateway::TallyUsageSink;
use persona_survey::persona::Persona;
use persona_survey::questionnaire::Questionnaire;
use persona_survey::report::write_reports;
use persona_survey::store::SampleStore;
use persona_survey::SurveyRunConfig;

#[derive(Parser)]
#[command(name = "survey", version, about = "Persona questionnaire sampler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample every configuration up to its quota (LLM calls)
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Override the configured quota
        #[arg(long)]
        iterations: Option<usize>,
        /// Override the configured export root
        #[arg(long)]
        export_path: Option<PathBuf>,
        /// Write reports into this directory after sampling
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show stored sample counts per configuration (no LLM calls)
    Status {
        #[arg(long)]
        config: PathBuf,
    },
    /// Validate a questionnaire and, optionally, a persona directory
    Validate {
        #[arg(long)]
        questionnaire: PathBuf,
        #[arg(long)]
        personas: Option<PathBuf>,
    },
    /// Aggregate a sample store into tables and a variance report
    Report {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Human reference norms for cross-evaluation
        #[arg(long)]
        reference: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            iterations,
            export_path,
            report,
        } => {
            let mut config = SurveyRunConfig::from_path(&config)?;
            if let Some(n) = iterations {
                config.iterations = n;
            }
            if let Some(path) = export_path {
                config.export_path = path;
            }

            let usage = Arc::new(TallyUsageSink::default());
            let gateway = config.build_gateway(usage.clone())?;
            let pipeline = config.build_pipeline(gateway)?;
            let summary = pipeline.run().await?;

            let tally = usage.snapshot();
            info!(
                calls = tally.calls,
                errors = tally.errors,
                input_tokens = tally.input_tokens,
                output_tokens = tally.output_tokens,
                "provider usage"
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if let Some(out) = report {
                write_reports(pipeline.store(), out, None)?;
            }
        }
        Commands::Status { config } => {
            let config = SurveyRunConfig::from_path(&config)?;
            for status in config.status()? {
                println!(
                    "{}\t{}/{}\t{:?}",
                    status.key, status.counted, config.iterations, status.state
                );
            }
        }
        Commands::Validate {
            questionnaire,
            personas,
        } => {
            let questionnaire = Questionnaire::from_path(&questionnaire)?;
            println!(
                "questionnaire ok: {} segments, {} questions",
                questionnaire.segments().len(),
                questionnaire.len()
            );
            if let Some(dir) = personas {
                let personas = Persona::from_directory(&dir)?;
                println!("personas ok: {}", personas.len());
            }
        }
        Commands::Report {
            store,
            out,
            reference,
        } => {
            let summary = write_reports(&SampleStore::new(store), out, reference.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
