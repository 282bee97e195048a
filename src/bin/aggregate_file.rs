use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use time::OffsetDateTime;

use stream_aggregators::event::{CsvExtractor, EventExtractor, JsonExtractor, Record, TimeFormat};
use stream_aggregators::reduce::{Count, Reducer, Sum, Summary};
use stream_aggregators::store::FileStore;
use stream_aggregators::{AggregatorConfig, StreamAggregator, TimeHorizon, Timezone};

#[derive(Parser, Debug)]
#[command(name = "aggregate-file")]
#[command(about = "Replay a JSON-lines or CSV file as one shard into a file-backed aggregate store")]
struct Cli {
    /// Input file, one record per line
    #[arg(long)]
    input: PathBuf,

    /// Store root directory
    #[arg(long)]
    store_root: PathBuf,

    /// JSON aggregator config; flags below override its table and horizons
    #[arg(long)]
    config: Option<PathBuf>,

    /// Table name (default: config value, else "aggregates")
    #[arg(long)]
    table: Option<String>,

    /// Horizon to bucket at, repeatable (e.g. minute, minutes_grouped:15, forever)
    #[arg(long = "horizon")]
    horizons: Vec<TimeHorizon>,

    /// Render buckets in this offset: recorded, UTC or +HHMM
    #[arg(long)]
    timezone: Option<Timezone>,

    #[arg(long, value_enum, default_value_t = InputFormat::Json)]
    format: InputFormat,

    /// Entity field (json) or zero-based column (csv), repeatable
    #[arg(long = "entity", required = true)]
    entity: Vec<String>,

    /// Event time field or column; records without one use the replay time
    #[arg(long)]
    time: Option<String>,

    #[arg(long, value_enum, default_value_t = TimeArg::Rfc3339)]
    time_format: TimeArg,

    /// Numeric value field or column (needed by sum and summary)
    #[arg(long)]
    value: Option<String>,

    #[arg(long, value_enum, default_value_t = ReducerArg::Count)]
    reducer: ReducerArg,

    /// Skip the first line (csv header)
    #[arg(long)]
    skip_header: bool,

    #[arg(long, default_value = "file-0")]
    shard_id: String,

    /// Records per aggregate call
    #[arg(long, default_value_t = 1_000)]
    batch_size: usize,

    /// Checkpoint after this many records
    #[arg(long)]
    checkpoint_records: Option<u64>,

    /// Print folded totals after shutdown
    #[arg(long)]
    print_totals: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputFormat {
    Json,
    Csv,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TimeArg {
    Rfc3339,
    EpochMillis,
    EpochSeconds,
}

impl From<TimeArg> for TimeFormat {
    fn from(arg: TimeArg) -> Self {
        match arg {
            TimeArg::Rfc3339 => TimeFormat::Rfc3339,
            TimeArg::EpochMillis => TimeFormat::EpochMillis,
            TimeArg::EpochSeconds => TimeFormat::EpochSeconds,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReducerArg {
    Count,
    Sum,
    Summary,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AggregatorConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AggregatorConfig::default(),
    };
    if let Some(table) = &cli.table {
        config.table_name = table.clone();
    }
    if !cli.horizons.is_empty() {
        config.horizons = cli.horizons.clone();
    }
    if let Some(timezone) = cli.timezone {
        config.timezone = timezone;
    }
    if let Some(records) = cli.checkpoint_records {
        config.checkpoint.max_records = Some(records);
    }
    config.validate()?;

    match cli.reducer {
        ReducerArg::Count => with_format(&cli, config, Count),
        ReducerArg::Sum => with_format(&cli, config, Sum),
        ReducerArg::Summary => with_format(&cli, config, Summary),
    }
}

fn with_format<R: Reducer + Clone>(cli: &Cli, config: AggregatorConfig, reducer: R) -> Result<()> {
    let time_format = TimeFormat::from(cli.time_format);
    match cli.format {
        InputFormat::Json => {
            let mut extractor = JsonExtractor::new(cli.entity.iter().cloned());
            if let Some(field) = &cli.time {
                extractor = extractor.time_field(field.clone(), time_format);
            }
            if let Some(field) = &cli.value {
                extractor = extractor.value_field(field.clone());
            }
            run(cli, config, reducer, extractor)
        }
        InputFormat::Csv => {
            let columns = cli
                .entity
                .iter()
                .map(|column| parse_column(column.as_str()))
                .collect::<Result<Vec<_>>>()?;
            let mut extractor = CsvExtractor::new(b',', columns);
            if let Some(column) = &cli.time {
                extractor = extractor.time_column(parse_column(column)?, time_format);
            }
            if let Some(column) = &cli.value {
                extractor = extractor.value_column(parse_column(column)?);
            }
            run(cli, config, reducer, extractor)
        }
    }
}

fn parse_column(raw: &str) -> Result<usize> {
    raw.parse()
        .with_context(|| format!("csv columns are zero-based indices, got '{raw}'"))
}

fn run<R, E>(cli: &Cli, config: AggregatorConfig, reducer: R, extractor: E) -> Result<()>
where
    R: Reducer + Clone,
    E: EventExtractor,
{
    if cli.batch_size == 0 {
        bail!("--batch-size must be positive");
    }
    let table = config.table_name.clone();
    let store = FileStore::open(&cli.store_root, reducer.clone())
        .with_context(|| format!("failed to open store {}", cli.store_root.display()))?;
    let aggregator = StreamAggregator::new(config, reducer, store)?.with_extractor(extractor);
    aggregator.initialise(&cli.shard_id)?;

    info!("Replaying {} into table {table}", cli.input.display());
    let file = File::open(&cli.input)
        .with_context(|| format!("failed to open {}", cli.input.display()))?;
    let partition_key = cli.input.display().to_string();

    let mut batch = Vec::with_capacity(cli.batch_size);
    let (mut records, mut rejected, mut checkpoints) = (0usize, 0usize, 0usize);
    let skip = usize::from(cli.skip_header);
    for (line_no, line) in BufReader::new(file).lines().enumerate().skip(skip) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sequence = (line_no + 1).to_string();
        batch.push(Record::new(&partition_key, sequence, OffsetDateTime::now_utc(), line));
        if batch.len() == cli.batch_size {
            let report = aggregator.aggregate(&batch)?;
            records += report.records;
            rejected += report.rejected.len();
            batch.clear();
            if aggregator.checkpoint_if_due()?.is_some() {
                checkpoints += 1;
            }
        }
    }
    if !batch.is_empty() {
        let report = aggregator.aggregate(&batch)?;
        records += report.records;
        rejected += report.rejected.len();
    }

    aggregator.shutdown(true)?;
    println!("records={records} rejected={rejected} checkpoints={checkpoints}");

    if cli.print_totals {
        for (key, value) in aggregator.store().totals(&table)? {
            println!("{key}\t{}", serde_json::to_string(&value)?);
        }
    }
    Ok(())
}
