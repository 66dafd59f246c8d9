use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use log::{error, info};

use flow_features::capture::PcapFileSource;
use flow_features::sink::CsvSink;
use flow_features::{KeyMode, Pipeline, PipelineConfig, Result, Retention};

#[derive(Parser, Debug)]
#[command(author, version, about = "Convert a pcap/pcapng capture into one CSV feature row per flow")]
struct Args {
    /// Capture file to read
    input: PathBuf,

    /// CSV file to write
    #[arg(short, long, default_value = "output_pcap.csv")]
    output: PathBuf,

    /// JSON pipeline configuration; command-line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many packets
    #[arg(long)]
    max_packets: Option<u64>,

    /// Close flows idle for this many seconds
    #[arg(long)]
    idle_timeout: Option<f64>,

    /// Accumulator threads (0 = one per CPU)
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum)]
    key_mode: Option<KeyModeArg>,

    /// Keep running gap totals instead of every timestamp
    #[arg(long, default_value_t = false)]
    streaming: bool,

    /// Count UDP datagrams as flow packets (TCP only by default)
    #[arg(long, default_value_t = false)]
    include_udp: bool,

    /// Value of the Label column
    #[arg(long)]
    label: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KeyModeArg {
    AddressPair,
    FiveTuple,
    SingleFlow,
}

impl From<KeyModeArg> for KeyMode {
    fn from(arg: KeyModeArg) -> Self {
        match arg {
            KeyModeArg::AddressPair => KeyMode::AddressPair,
            KeyModeArg::FiveTuple => KeyMode::FiveTuple,
            KeyModeArg::SingleFlow => KeyMode::SingleFlow,
        }
    }
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(limit) = args.max_packets {
        config.max_packets = Some(limit);
    }
    if let Some(timeout) = args.idle_timeout {
        config.idle_timeout_secs = Some(timeout);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(mode) = args.key_mode {
        config.key_mode = mode.into();
    }
    if args.streaming {
        config.retention = Retention::Streaming;
    }
    if args.include_udp {
        config.include_udp = true;
    }
    if let Some(label) = &args.label {
        config.label = label.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    let pipeline = Pipeline::new(config);

    let stop = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, finishing open flows...");
        stop.store(true, Ordering::SeqCst);
    })?;

    let mut source = PcapFileSource::open(&args.input)?;
    let mut sink = CsvSink::create(&args.output)?;
    pipeline.run(&mut source, &mut sink)?;

    info!("Conversion complete. Output saved to {}", args.output.display());
    Ok(())
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str())).init();

    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
