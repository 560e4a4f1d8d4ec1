//! AKI relevance-propagation CLI: explain a batch, inspect rules and columns.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aki_core::{FeatureColumns, InputArrays, InputBatch, Seed};
use aki_explain::{
    default_rules, load_rule_descriptions, ExplainConfig, LrpEngine, OutputRelevance,
    RelevanceSign, RelevanceTable,
};
use aki_models::{AkiNet, AkiNetConfig, ParameterSnapshot};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

/// Backend for explanation: gradients are needed by the ε rule.
type ExplainBackend = Autodiff<NdArray>;

#[derive(Parser)]
#[command(name = "aki")]
#[command(author, version)]
#[command(about = "Layer-wise relevance propagation for the AKI classifier")]
#[command(long_about = "Explain predictions of the multi-branch AKI classifier.

EXAMPLES:
  # Explain a synthetic batch with freshly initialized weights
  aki explain --batch 4 --seed 7

  # Explain stored inputs with trained weights and write the table
  aki explain --config net.json --weights weights.json --inputs batch.json --output relevance.json

  # Print the default rule list for a network
  aki rules --config net.json

  # Print the relevance table's column names
  aki columns --columns features.json")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct NetworkArgs {
    /// Network config (JSON); defaults are used when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Trained parameter snapshot (JSON)
    #[arg(long, value_name = "FILE")]
    weights: Option<PathBuf>,
}

#[derive(Args)]
struct ExplainArgs {
    #[command(flatten)]
    network: NetworkArgs,

    /// Ordered rule list (JSON array, one object per layer)
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Engine config (JSON)
    #[arg(long, value_name = "FILE")]
    engine: Option<PathBuf>,

    /// Feature column names (JSON)
    #[arg(long, value_name = "FILE")]
    columns: Option<PathBuf>,

    /// Input arrays (JSON); a synthetic batch is used when omitted
    #[arg(long, value_name = "FILE")]
    inputs: Option<PathBuf>,

    /// Size of the synthetic batch
    #[arg(long, default_value = "4", value_name = "N")]
    batch: usize,

    /// Seed of the synthetic batch
    #[arg(long, default_value = "42", value_name = "SEED")]
    seed: u64,

    /// Seed the output relevance with predicted probabilities
    #[arg(long)]
    prediction: bool,

    /// Keep the sign of relevance values
    #[arg(long)]
    signed: bool,

    /// Record per-layer conservation totals
    #[arg(long)]
    audit: bool,

    /// Output file; the table is printed when omitted
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Explain a batch and write the relevance table
    Explain(ExplainArgs),
    /// Print the default rule list of a network
    Rules {
        #[command(flatten)]
        network: NetworkArgs,

        /// Output file
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Print the column names of the relevance table
    Columns {
        /// Network config (JSON)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Feature column names (JSON)
        #[arg(long, value_name = "FILE")]
        columns: Option<PathBuf>,
    },
    /// Write the parameters of a network as a snapshot
    ExportWeights {
        #[command(flatten)]
        network: NetworkArgs,

        /// Output file
        #[arg(long, value_name = "FILE")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::Explain(args) => handle_explain(args),
        Commands::Rules { network, output } => handle_rules(network, output),
        Commands::Columns { config, columns } => handle_columns(config, columns),
        Commands::ExportWeights { network, output } => handle_export(network, output),
    }
}

fn load_config(path: Option<&Path>) -> Result<AkiNetConfig> {
    match path {
        Some(path) => AkiNetConfig::from_json_file(path)
            .with_context(|| format!("reading network config {}", path.display())),
        None => Ok(AkiNetConfig::default()),
    }
}

fn load_network(args: &NetworkArgs) -> Result<AkiNet<ExplainBackend>> {
    let device = Default::default();
    let config = load_config(args.config.as_deref())?;
    let mut net = config.init::<ExplainBackend>(&device)?;
    match &args.weights {
        Some(path) => {
            let snapshot = ParameterSnapshot::load_json(path)
                .with_context(|| format!("reading weights {}", path.display()))?;
            snapshot.apply(net.layers_mut(), &device)?;
        }
        None => info!("no weights given, using initialized parameters"),
    }
    Ok(net)
}

fn load_columns(path: Option<&Path>, config: &AkiNetConfig) -> Result<FeatureColumns> {
    let columns = match path {
        Some(path) => FeatureColumns::from_json_file(path)
            .with_context(|| format!("reading feature columns {}", path.display()))?,
        None => FeatureColumns::placeholder(&config.layout),
    };
    columns.validate(&config.layout)?;
    Ok(columns)
}

fn write_or_print(text: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn handle_explain(args: ExplainArgs) -> Result<()> {
    let net = load_network(&args.network)?;
    let config = net.config().clone();
    let columns = load_columns(args.columns.as_deref(), &config)?;

    let rules = match &args.rules {
        Some(path) => load_rule_descriptions(path)
            .with_context(|| format!("reading rules {}", path.display()))?,
        None => default_rules(net.layers()),
    };
    let mut engine_config = match &args.engine {
        Some(path) => ExplainConfig::from_json_file(path)
            .with_context(|| format!("reading engine config {}", path.display()))?,
        None => ExplainConfig::default(),
    };
    if args.prediction {
        engine_config = engine_config.with_output_relevance(OutputRelevance::Prediction);
    }
    if args.audit {
        engine_config = engine_config.with_audit(true);
    }
    let engine = LrpEngine::new(net.layers().clone(), &rules, engine_config)?;

    let arrays = match &args.inputs {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading inputs {}", path.display()))?;
            serde_json::from_str::<InputArrays>(&text)?
        }
        None => InputArrays::synthetic(&config.layout, args.batch, Seed::new(args.seed)),
    };
    let batch = InputBatch::<ExplainBackend>::from_arrays(&arrays, &config.layout, &Default::default())?;
    info!(samples = batch.batch_size(), "loaded inputs");

    let explanation = engine.explain(net.trace(&batch)?)?;
    let totals = explanation.relevance.sample_totals()?;
    info!(?totals, "relevance per sample");
    for entry in &explanation.audit {
        info!(
            branch = %entry.branch,
            layer = %entry.layer,
            before = entry.before,
            after = entry.after,
            "audit"
        );
    }

    let sign = if args.signed {
        RelevanceSign::Signed
    } else {
        RelevanceSign::Absolute
    };
    let table = RelevanceTable::build(&explanation.relevance, &columns, &config.layout, sign)?;
    write_or_print(&table.to_json()?, args.output.as_deref())
}

fn handle_rules(network: NetworkArgs, output: Option<PathBuf>) -> Result<()> {
    let config = load_config(network.config.as_deref())?;
    let net = config.init::<NdArray>(&Default::default())?;
    let rules = default_rules(net.layers());
    write_or_print(&serde_json::to_string_pretty(&rules)?, output.as_deref())
}

fn handle_columns(config: Option<PathBuf>, columns: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let columns = load_columns(columns.as_deref(), &config)?;
    let table = RelevanceTable::unavailable(&columns, &config.layout, 0)?;
    for name in &table.columns {
        println!("{name}");
    }
    Ok(())
}

fn handle_export(network: NetworkArgs, output: PathBuf) -> Result<()> {
    let net = load_network(&network)?;
    let snapshot = ParameterSnapshot::capture(net.layers())?;
    snapshot
        .save_json(&output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!(
        "Wrote {} layers ({} parameters) to {}",
        snapshot.layers.len(),
        net.layers().parameter_count(),
        output.display()
    );
    Ok(())
}
