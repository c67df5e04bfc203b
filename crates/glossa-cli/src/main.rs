//! Glossa CLI - train and evaluate knowledge graph embeddings.
//!
//! Every command reads a dataset directory laid out as:
//!
//! ```text
//! data/
//!   entities.txt      one entity ID per line
//!   relations.txt     one relation ID per line
//!   train.txt         head tail relation, whitespace separated
//!   valid.txt
//!   test.txt
//!   descriptions.txt  "<entity> <title>: <text>" (text models only)
//!   tokenizer.json    HuggingFace tokenizer (text models only)
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Catalog and split sizes
//! glossa stats data/
//!
//! # TransE link prediction
//! glossa link-prediction data/ --model transe --epochs 15 --metrics metrics.jsonl
//!
//! # Description-based TransE
//! glossa link-prediction data/ --model text --tokenizer data/tokenizer.json
//!
//! # Entity-by-entity alignment of descriptions with summaries
//! glossa align data/ --entities 100
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use glossa_core::{GraphDataset, TextStore};
use glossa_kge::{
    AlignmentConfig, AlignmentTrainer, EmbeddingCacheBuilder, EncoderConfig, EntityAligner,
    JsonlSink, LinkPredictionTrainer, MeanPoolEncoder, MetricsSink, ModelConfig, PNorm,
    ParameterStore, RelTransE, RunContext, Splits, TextTransE, TracingSink, TrainingConfig, TransE,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokenizers::Tokenizer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glossa")]
#[command(about = "Text-augmented knowledge graph embeddings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show entity, relation and split counts
    Stats {
        /// Dataset directory
        data: PathBuf,
    },

    /// Train a link prediction model and report MRR / Hits@k
    LinkPrediction {
        /// Dataset directory
        data: PathBuf,

        /// Model variant
        #[arg(long, default_value = "transe")]
        model: ModelKind,

        /// JSON training config; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Tokenizer file (default: <data>/tokenizer.json)
        #[arg(long)]
        tokenizer: Option<PathBuf>,

        /// Number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Training batch size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Evaluation batch size
        #[arg(long)]
        eval_batch_size: Option<usize>,

        /// Prefetch worker threads
        #[arg(long)]
        workers: Option<usize>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Rank with known triples filtered out
        #[arg(long)]
        filtered: bool,

        #[command(flatten)]
        shape: ShapeArgs,

        /// Append metrics as JSON lines to this file
        #[arg(long)]
        metrics: Option<PathBuf>,

        /// Write the final report as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Align description encodings with entity summaries, one entity at a time
    Align {
        /// Dataset directory
        data: PathBuf,

        /// Tokenizer file (default: <data>/tokenizer.json)
        #[arg(long)]
        tokenizer: Option<PathBuf>,

        /// Align only the first N entities
        #[arg(long)]
        entities: Option<u32>,

        /// Triples per inner batch
        #[arg(long, default_value = "256")]
        batch_size: usize,

        /// Learning rate
        #[arg(long, default_value = "1e-5")]
        lr: f64,

        /// Prefetch worker threads
        #[arg(long, default_value = "4")]
        workers: usize,

        #[command(flatten)]
        shape: ShapeArgs,

        /// Append metrics as JSON lines to this file
        #[arg(long)]
        metrics: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct ShapeArgs {
    /// Embedding dimension
    #[arg(long, default_value = "100")]
    dim: usize,

    /// Ranking margin
    #[arg(long, default_value = "5.0")]
    margin: f64,

    /// Residual norm (1 or 2)
    #[arg(long, default_value = "1")]
    p_norm: usize,

    /// Text encoder width
    #[arg(long, default_value = "128")]
    hidden_size: usize,

    /// Maximum description length in tokens
    #[arg(long, default_value = "64")]
    max_len: usize,
}

impl ShapeArgs {
    fn model_config(&self) -> Result<ModelConfig> {
        Ok(ModelConfig::default()
            .with_dim(self.dim)
            .with_margin(self.margin)
            .with_p_norm(PNorm::try_from(self.p_norm)?))
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelKind {
    /// Learned entity table
    Transe,
    /// Entity vectors from descriptions
    Text,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stats { data } => cmd_stats(&data),
        Commands::LinkPrediction {
            data,
            model,
            config,
            tokenizer,
            epochs,
            batch_size,
            eval_batch_size,
            workers,
            seed,
            filtered,
            shape,
            metrics,
            output,
        } => {
            let mut training = match config {
                Some(path) => load_config(&path)?,
                None => TrainingConfig::default(),
            };
            if let Some(epochs) = epochs {
                training = training.with_max_epochs(epochs);
            }
            if let Some(batch_size) = batch_size {
                training = training.with_batch_size(batch_size);
            }
            if let Some(eval_batch_size) = eval_batch_size {
                training = training.with_eval_batch_size(eval_batch_size);
            }
            if let Some(workers) = workers {
                training = training.with_num_workers(workers);
            }
            if let Some(seed) = seed {
                training = training.with_seed(seed);
            }
            if filtered {
                training = training.with_filtered_ranking(true);
            }
            cmd_link_prediction(
                &data,
                model,
                training,
                tokenizer.as_deref(),
                &shape,
                metrics.as_deref(),
                output.as_deref(),
            )
        }
        Commands::Align {
            data,
            tokenizer,
            entities,
            batch_size,
            lr,
            workers,
            shape,
            metrics,
        } => {
            let mut config = AlignmentConfig::default()
                .with_batch_size(batch_size)
                .with_lr(lr)
                .with_num_workers(workers);
            if let Some(n) = entities {
                config = config.with_entities(0..n);
            }
            cmd_align(&data, config, tokenizer.as_deref(), &shape, metrics.as_deref())
        }
    }
}

fn load_config(path: &Path) -> Result<TrainingConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))
}

fn run_context(metrics: Option<&Path>, progress: Option<ProgressBar>) -> Result<RunContext> {
    let inner: Arc<dyn MetricsSink> = match metrics {
        Some(path) => Arc::new(
            JsonlSink::create(path)
                .with_context(|| format!("Failed to open metrics file {}", path.display()))?,
        ),
        None => Arc::new(TracingSink),
    };
    let sink: Arc<dyn MetricsSink> = match progress {
        Some(bar) => Arc::new(ProgressSink { inner, bar }),
        None => inner,
    };
    Ok(RunContext::new(Device::Cpu, sink))
}

/// Advances a progress bar on per-epoch and per-entity metrics.
struct ProgressSink {
    inner: Arc<dyn MetricsSink>,
    bar: ProgressBar,
}

impl MetricsSink for ProgressSink {
    fn log_scalar(&self, name: &str, value: f64, step: Option<usize>) {
        if name == "train_loss" || name == "align_loss" {
            self.bar.inc(1);
            self.bar.set_message(format!("loss {value:.4}"));
        }
        self.inner.log_scalar(name, value, step);
    }
}

fn progress_bar(len: u64, unit: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    let template = format!("{{bar:40}} {{pos}}/{{len}} {unit} {{msg}}");
    if let Ok(style) = ProgressStyle::with_template(&template) {
        bar.set_style(style);
    }
    bar
}

fn load_splits(data: &Path, text: Option<(&Tokenizer, usize)>) -> Result<Splits> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", data.display()));

    let mut train = GraphDataset::load(
        data.join("train.txt"),
        data.join("entities.txt"),
        data.join("relations.txt"),
    )
    .with_context(|| format!("Failed to load training split from {}", data.display()))?;

    if let Some((tokenizer, max_len)) = text {
        let path = data.join("descriptions.txt");
        let store = TextStore::load(&path, train.catalog(), tokenizer, max_len)
            .with_context(|| format!("Failed to load descriptions {}", path.display()))?;
        train = train
            .with_text(Arc::new(store))
            .with_context(|| format!("Descriptions in {} do not match the catalog", path.display()))?;
    }

    let valid = train
        .load_split(data.join("valid.txt"))
        .context("Failed to load validation split")?;
    let test = train
        .load_split(data.join("test.txt"))
        .context("Failed to load test split")?;

    pb.finish_with_message(format!("Loaded in {:.2?}", start.elapsed()));
    Ok(Splits {
        train: Arc::new(train),
        valid: Arc::new(valid),
        test: Arc::new(test),
    })
}

fn load_tokenizer(data: &Path, tokenizer: Option<&Path>) -> Result<Tokenizer> {
    let path = tokenizer
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data.join("tokenizer.json"));
    if !path.exists() {
        bail!(
            "Tokenizer {} not found; pass --tokenizer or add tokenizer.json to the dataset",
            path.display()
        );
    }
    Tokenizer::from_file(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {e}", path.display()))
}

fn cmd_stats(data: &Path) -> Result<()> {
    let splits = load_splits(data, None)?;

    println!("Knowledge Graph Statistics");
    println!("==========================");
    println!("Entities:       {}", splits.train.num_entities());
    println!("Relations:      {}", splits.train.num_relations());
    println!("Train triples:  {}", splits.train.len());
    println!("Valid triples:  {}", splits.valid.len());
    println!("Test triples:   {}", splits.test.len());

    Ok(())
}

fn cmd_link_prediction(
    data: &Path,
    kind: ModelKind,
    config: TrainingConfig,
    tokenizer: Option<&Path>,
    shape: &ShapeArgs,
    metrics: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let model_config = shape.model_config()?;
    let bar = progress_bar(config.max_epochs as u64, "epochs");
    let ctx = run_context(metrics, Some(bar.clone()))?;
    let params = Arc::new(ParameterStore::new(ctx.device.clone()));
    let trainer = LinkPredictionTrainer::new(ctx, config);

    let report = match kind {
        ModelKind::Transe => {
            let splits = load_splits(data, None)?;
            let model = TransE::new(
                splits.train.num_entities(),
                splits.train.num_relations(),
                model_config,
                params,
            )?;
            trainer.fit(&model, &splits)?
        }
        ModelKind::Text => {
            let tokenizer = load_tokenizer(data, tokenizer)?;
            let splits = load_splits(data, Some((&tokenizer, shape.max_len)))?;
            let encoder = MeanPoolEncoder::new(
                EncoderConfig::new(tokenizer.get_vocab_size(true))
                    .with_hidden_size(shape.hidden_size),
                params
                    .var_builder()
                    .pp(TextTransE::<MeanPoolEncoder>::ENCODER_PREFIX),
            )?;
            let model = TextTransE::new(
                encoder,
                splits.train.num_relations(),
                model_config,
                params,
            )?;
            trainer.fit(&model, &splits)?
        }
    };
    bar.finish_and_clear();

    for epoch in &report.epochs {
        println!(
            "Epoch {:>3}  loss {:.4}  valid {}",
            epoch.epoch,
            epoch.train_loss,
            epoch.valid.summary()
        );
    }
    println!("Test {}", report.test.summary());

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote report to {}", path.display());
    }
    Ok(())
}

fn cmd_align(
    data: &Path,
    config: AlignmentConfig,
    tokenizer: Option<&Path>,
    shape: &ShapeArgs,
    metrics: Option<&Path>,
) -> Result<()> {
    let tokenizer = load_tokenizer(data, tokenizer)?;
    let splits = load_splits(data, Some((&tokenizer, shape.max_len)))?;
    let train = &splits.train;
    let Some(text) = train.text() else {
        bail!("Alignment needs descriptions");
    };
    let vocab_size = tokenizer.get_vocab_size(true);
    let encoder_config = EncoderConfig::new(vocab_size).with_hidden_size(shape.hidden_size);

    // The summarizer is frozen: its weights live outside the trained store.
    let frozen = ParameterStore::new(Device::Cpu);
    let summarizer = MeanPoolEncoder::new(encoder_config, frozen.var_builder().pp("summarizer"))?;
    let pb = ProgressBar::new_spinner();
    pb.set_message("Summarizing entities...");
    let summaries = EmbeddingCacheBuilder::new(256).summaries(&summarizer, text, &Device::Cpu)?;
    pb.finish_with_message(format!("Summarized {} entities", train.num_entities()));

    let entities = config
        .entities
        .clone()
        .map_or(train.num_entities() as u64, |r| u64::from(r.end.saturating_sub(r.start)));
    let bar = progress_bar(entities, "entities");
    let ctx = run_context(metrics, Some(bar.clone()))?;

    let params = Arc::new(ParameterStore::new(ctx.device.clone()));
    let encoder = MeanPoolEncoder::new(
        encoder_config,
        params
            .var_builder()
            .pp(EntityAligner::<MeanPoolEncoder>::ENCODER_PREFIX),
    )?;
    let aligner = EntityAligner::new(
        encoder,
        shape.hidden_size,
        shape.dim,
        Arc::clone(&params),
    )?;
    let graph_model =
        RelTransE::new(train.num_relations(), shape.model_config()?, Arc::clone(&params))?;
    tracing::info!(parameters = params.num_parameters(), "aligner ready");

    let report = AlignmentTrainer::new(ctx, config).fit(&aligner, &graph_model, train, &summaries)?;
    bar.finish_and_clear();

    let mean = report.entities.iter().map(|e| e.mean_loss).sum::<f64>()
        / report.entities.len().max(1) as f64;
    println!("Aligned {} entities", report.entities.len());
    println!("Mean loss:      {mean:.4}");
    Ok(())
}
