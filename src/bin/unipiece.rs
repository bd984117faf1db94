use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::ThreadPoolBuilder;

use unipiece::model::{parse_decode_extra_options, parse_extra_options};
use unipiece::piece::PieceKind;
use unipiece::{ModelData, NormalizerConfig, Trainer, TrainerConfig};

const DEFAULT_MODEL: &str = "unipiece.model.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "Unigram subword tokenizer toolkit", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short = 'q', long, global = true, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a new model from text corpora (one sentence per line)
    Train(TrainArgs),
    /// Segment text into pieces or ids
    Encode(EncodeArgs),
    /// Reconstruct text from piece ids
    Decode(DecodeArgs),
    /// Normalize text without segmenting it
    Normalize(NormalizeArgs),
    /// Export the vocabulary as a TSV file
    ExportVocab(ExportVocabArgs),
    /// Inspect model metadata
    Info(InfoArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Files or directories to ingest
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output path for the model container
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_MODEL)]
    output: PathBuf,

    /// Also write the vocabulary TSV to this path
    #[arg(long, value_name = "PATH")]
    vocab: Option<PathBuf>,

    /// Target vocabulary size
    #[arg(long, value_name = "SIZE", default_value_t = 8000)]
    vocab_size: usize,

    /// Seed vocabulary size
    #[arg(long, value_name = "SIZE", default_value_t = 1_000_000)]
    seed_size: usize,

    /// EM sub-iterations per pruning round
    #[arg(long, value_name = "COUNT", default_value_t = 2)]
    sub_iterations: usize,

    /// Pruning retention ratio
    #[arg(long, value_name = "RATIO", default_value_t = 0.75)]
    shrinking_factor: f64,

    /// Maximum piece length in characters
    #[arg(long, value_name = "LEN", default_value_t = 16)]
    max_piece_length: usize,

    /// Limit worker threads
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Append user-defined symbols (repeat flag)
    #[arg(long = "user-defined-symbol", value_name = "SYMBOL")]
    user_defined_symbols: Vec<String>,

    /// Append control symbols (repeat flag)
    #[arg(long = "control-symbol", value_name = "SYMBOL")]
    control_symbols: Vec<String>,

    /// Reserve a PAD piece with this surface
    #[arg(long, value_name = "SURFACE")]
    pad_piece: Option<String>,

    /// Chars map driving normalization
    #[arg(long, value_name = "NAME", default_value = "nmt_nfkc")]
    normalizer: String,

    /// Do not prepend the dummy whitespace prefix
    #[arg(long)]
    no_dummy_prefix: bool,

    /// Keep duplicate and surrounding whitespace
    #[arg(long)]
    keep_extra_whitespaces: bool,

    /// Attach whitespace to the preceding word
    #[arg(long)]
    treat_whitespace_as_suffix: bool,

    /// Allow pieces crossing word boundaries
    #[arg(long)]
    no_split_by_whitespace: bool,

    /// Allow pieces mixing digits and non-digits
    #[arg(long)]
    no_split_by_number: bool,

    /// Allow pieces mixing Unicode scripts
    #[arg(long)]
    no_split_by_unicode_script: bool,

    /// Disable per-iteration logging/progress
    #[arg(long)]
    no_progress: bool,

    /// Emit pretty JSON
    #[arg(long)]
    pretty: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Whitespace-joined piece surfaces
    Pieces,
    /// Whitespace-joined piece ids
    Ids,
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// Model container to load
    #[arg(short = 'm', long, value_name = "PATH", default_value = DEFAULT_MODEL)]
    model: PathBuf,

    /// Input file; stdin when omitted
    input: Option<PathBuf>,

    /// Colon-separated options: reverse, bos, eos
    #[arg(long, value_name = "OPTS", default_value = "")]
    extra_options: String,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Pieces)]
    output_format: OutputFormat,

    /// Emit the n best segmentations per line
    #[arg(long, value_name = "N")]
    nbest: Option<usize>,

    /// Sample a segmentation instead of Viterbi decoding
    #[arg(long)]
    sample: bool,

    /// Smoothing parameter for sampling
    #[arg(long, value_name = "THETA", default_value_t = 1.0)]
    theta: f32,

    /// RNG seed for reproducible sampling
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Model container to load
    #[arg(short = 'm', long, value_name = "PATH", default_value = DEFAULT_MODEL)]
    model: PathBuf,

    /// Input file of whitespace-separated ids; stdin when omitted
    input: Option<PathBuf>,

    /// Colon-separated options: reverse
    #[arg(long, value_name = "OPTS", default_value = "")]
    extra_options: String,
}

#[derive(Args, Debug)]
struct NormalizeArgs {
    /// Model container supplying the normalizer spec
    #[arg(short = 'm', long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Chars map name used when no model is given
    #[arg(long, value_name = "NAME", default_value = "nmt_nfkc")]
    name: String,

    /// Input file; stdin when omitted
    input: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExportVocabArgs {
    /// Model container to load
    #[arg(short = 'm', long, value_name = "PATH", default_value = DEFAULT_MODEL)]
    model: PathBuf,

    /// Output path; stdout when omitted
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InfoArgs {
    /// Model container to load
    #[arg(short = 'm', long, value_name = "PATH", default_value = DEFAULT_MODEL)]
    model: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Encode(args) => run_encode(args),
        Commands::Decode(args) => run_decode(args),
        Commands::Normalize(args) => run_normalize(args),
        Commands::ExportVocab(args) => run_export_vocab(args),
        Commands::Info(args) => run_info(args),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=-2 => "off",
        -1 => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run_train(args: TrainArgs) -> Result<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("configuring the worker pool")?;
    }

    let mut cfg = TrainerConfig {
        vocab_size: args.vocab_size,
        seed_piece_size: args.seed_size,
        num_sub_iterations: args.sub_iterations,
        shrinking_factor: args.shrinking_factor,
        max_piece_length: args.max_piece_length,
        split_by_unicode_script: !args.no_split_by_unicode_script,
        split_by_number: !args.no_split_by_number,
        split_by_whitespace: !args.no_split_by_whitespace,
        user_defined_symbols: args.user_defined_symbols,
        control_symbols: args.control_symbols,
        show_progress: !args.no_progress,
        ..TrainerConfig::default()
    };
    if let Some(threads) = args.threads {
        cfg.num_threads = threads;
    }
    if let Some(pad) = args.pad_piece {
        cfg.pad_piece = pad;
    }
    let normalizer_cfg = NormalizerConfig {
        name: args.normalizer,
        add_dummy_prefix: !args.no_dummy_prefix,
        remove_extra_whitespaces: !args.keep_extra_whitespaces,
        escape_whitespaces: true,
        treat_whitespace_as_suffix: args.treat_whitespace_as_suffix,
    };

    let spinner = (!args.no_progress).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message("training");
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    });

    let trainer = Trainer::new(cfg).with_normalizer(normalizer_cfg);
    let artifacts = trainer.train_from_paths(&args.inputs)?;

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    artifacts.data.save(&args.output, args.pretty)?;
    info!(
        "wrote {} pieces to {}",
        artifacts.model.len(),
        args.output.display()
    );
    if let Some(vocab) = args.vocab {
        artifacts.data.save_vocab(&vocab)?;
        info!("wrote vocabulary to {}", vocab.display());
    }
    Ok(())
}

fn run_encode(args: EncodeArgs) -> Result<()> {
    let data = ModelData::load(&args.model)?;
    let model = data.segmenter()?;
    let normalizer = data.normalizer()?;
    let options = parse_extra_options(&args.extra_options)?;
    let bos_id = model.piece_to_id(&data.trainer_spec.bos_piece);
    let eos_id = model.piece_to_id(&data.trainer_spec.eos_piece);
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    for line in read_lines(args.input.as_ref())? {
        let normalized = normalizer.normalize(&line);
        if let Some(nbest) = args.nbest {
            for (pieces, score) in model.nbest_encode(&normalized, nbest) {
                let mut pieces = pieces;
                model.apply_extra_options(&mut pieces, &options, bos_id, eos_id)?;
                println!("{}\t{score}", render(&pieces, args.output_format));
            }
            continue;
        }
        let mut pieces = if args.sample {
            model.sample_encode(&normalized, args.theta, &mut rng)
        } else {
            model.encode(&normalized)
        };
        model.apply_extra_options(&mut pieces, &options, bos_id, eos_id)?;
        println!("{}", render(&pieces, args.output_format));
    }
    Ok(())
}

fn render(pieces: &[unipiece::SegmentedPiece], format: OutputFormat) -> String {
    match format {
        OutputFormat::Pieces => pieces
            .iter()
            .map(|p| p.surface.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        OutputFormat::Ids => pieces
            .iter()
            .map(|p| p.id.to_string())
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn run_decode(args: DecodeArgs) -> Result<()> {
    let data = ModelData::load(&args.model)?;
    let model = data.segmenter()?;
    let options = parse_decode_extra_options(&args.extra_options)?;

    for line in read_lines(args.input.as_ref())? {
        let mut ids = line
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<u32>()
                    .map_err(|_| anyhow!("`{token}` is not a piece id"))
            })
            .collect::<Result<Vec<u32>>>()?;
        if options
            .iter()
            .any(|o| matches!(o, unipiece::ExtraOption::Reverse))
        {
            ids.reverse();
        }
        println!("{}", model.decode(&ids, &data.trainer_spec.unk_surface));
    }
    Ok(())
}

fn run_normalize(args: NormalizeArgs) -> Result<()> {
    let normalizer = match &args.model {
        Some(path) => ModelData::load(path)?.normalizer()?,
        None => unipiece::Normalizer::new(NormalizerConfig {
            name: args.name.clone(),
            ..NormalizerConfig::default()
        })?,
    };
    for line in read_lines(args.input.as_ref())? {
        println!("{}", normalizer.normalize(&line));
    }
    Ok(())
}

fn run_export_vocab(args: ExportVocabArgs) -> Result<()> {
    let data = ModelData::load(&args.model)?;
    match args.output {
        Some(path) => data.save_vocab(path)?,
        None => print!("{}", data.vocab_tsv()),
    }
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<()> {
    let data = ModelData::load(&args.model)?;
    let count = |kind: PieceKind| data.pieces.iter().filter(|p| p.kind == kind).count();
    println!("pieces: {}", data.pieces.len());
    println!("  normal: {}", count(PieceKind::Normal));
    println!("  user_defined: {}", count(PieceKind::UserDefined));
    println!("  control: {}", count(PieceKind::Control));
    println!("  unused: {}", count(PieceKind::Unused));
    println!("vocab_size: {}", data.trainer_spec.vocab_size);
    println!("seed_piece_size: {}", data.trainer_spec.seed_piece_size);
    println!("num_sub_iterations: {}", data.trainer_spec.num_sub_iterations);
    println!("shrinking_factor: {}", data.trainer_spec.shrinking_factor);
    println!("max_piece_length: {}", data.trainer_spec.max_piece_length);
    println!("normalizer: {}", data.normalizer_spec.name);
    Ok(())
}

fn read_lines(input: Option<&PathBuf>) -> Result<Vec<String>> {
    match input {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(text.lines().map(str::to_owned).collect())
        }
        None => {
            let mut buffer = String::new();
            io::stdin()
                .lock()
                .read_to_string(&mut buffer)
                .context("reading stdin")?;
            Ok(buffer.lines().map(str::to_owned).collect())
        }
    }
}
