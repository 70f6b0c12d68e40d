use clap::{Args, Parser, Subcommand};
use deepdesc_pca::{
    load_records, save_features, save_records, ByteOrder, PcaConfig, PcaReducer, RecordLayout, ZeroVariancePolicy,
};
use log::{error, info, LevelFilter};
use ndarray::{Array2, Axis};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "deepdesc-pca")]
#[command(about = "PCA reduction of binary descriptor record files")]
#[command(version)]
struct Cli {
    /// Worker threads for the parallel kernels (defaults to all cores)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reduce a float32 record file to its top principal components
    ComputePca(ComputePcaArgs),
    /// Print the shape and column statistics of a float32 record file
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct LayoutArgs {
    /// Record file to read
    #[arg(long)]
    input: PathBuf,

    /// Number of f32 values per record
    #[arg(long)]
    dimension: usize,

    /// Bytes before the values of each record; the first 4 hold an i32 id
    #[arg(long, default_value_t = 0)]
    header_bytes: usize,

    /// Byte order of the stored values
    #[arg(long, value_parser = parse_byte_order, default_value = "native")]
    byte_order: ByteOrder,
}

#[derive(Args, Debug)]
struct ComputePcaArgs {
    #[command(flatten)]
    layout: LayoutArgs,

    /// Output record file for the D x L principal components (no ids)
    #[arg(long)]
    output: PathBuf,

    /// Number of principal components to keep
    #[arg(long, default_value_t = 64)]
    target_dimension: usize,

    /// Skip dividing centered columns by their standard deviation
    #[arg(long)]
    no_whiten: bool,

    /// Leave zero-variance columns unscaled instead of failing
    #[arg(long)]
    allow_zero_variance: bool,

    /// Also write the N x L projected records here, with ids if the input has them
    #[arg(long)]
    projected: Option<PathBuf>,

    /// Also write the fitted model (bincode) to this path
    #[arg(long)]
    model: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[command(flatten)]
    layout: LayoutArgs,
}

fn parse_byte_order(value: &str) -> Result<ByteOrder, String> {
    match value.to_ascii_lowercase().as_str() {
        "native" => Ok(ByteOrder::Native),
        "little" | "le" => Ok(ByteOrder::Little),
        "big" | "be" => Ok(ByteOrder::Big),
        other => Err(format!("unknown byte order '{}' (native, little, big)", other)),
    }
}

impl LayoutArgs {
    fn record_layout(&self) -> RecordLayout {
        RecordLayout::new(self.dimension)
            .with_header_bytes(self.header_bytes)
            .with_byte_order(self.byte_order)
    }
}

fn compute_pca(args: &ComputePcaArgs) -> Result<(), Box<dyn std::error::Error>> {
    let start_time = Instant::now();
    let (features, ids) = load_records::<f32, _>(&args.layout.input, args.layout.record_layout())?.into_parts();

    let zero_variance = if args.allow_zero_variance {
        ZeroVariancePolicy::Unit
    } else {
        ZeroVariancePolicy::Reject
    };
    let config = PcaConfig::new(args.target_dimension)
        .with_whitening(!args.no_whiten)
        .with_zero_variance_policy(zero_variance);
    let reduction = PcaReducer::new(config).reduce(features)?;

    save_features(&args.output, reduction.components().view())?;
    info!(
        "Wrote {} x {} principal components to {}",
        reduction.components().nrows(),
        reduction.components().ncols(),
        args.output.display()
    );
    if let Some(projected_path) = &args.projected {
        save_records(
            projected_path,
            reduction.projected.view(),
            ids.as_deref(),
            args.layout.byte_order,
        )?;
        info!(
            "Wrote {} projected records to {}",
            reduction.projected.nrows(),
            projected_path.display()
        );
    }
    if let Some(model_path) = &args.model {
        reduction.model.save_model(model_path)?;
        info!("Wrote PCA model to {}", model_path.display());
    }
    info!("compute-pca finished in {:?}", start_time.elapsed());
    Ok(())
}

fn inspect(args: &InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let records = load_records::<f32, _>(&args.layout.input, args.layout.record_layout())?;
    println!("rows: {}", records.num_rows());
    println!("dimension: {}", records.dimension());
    if let Some(ids) = &records.ids {
        if let (Some(first), Some(last)) = (ids.first(), ids.last()) {
            println!("ids: {} .. {}", first, last);
        }
    }
    if records.num_rows() == 0 {
        return Ok(());
    }
    let features: &Array2<f32> = &records.features;
    let mean = deepdesc_pca::stats::column_mean(features.view())?;
    for (j, column) in features.axis_iter(Axis(1)).enumerate() {
        let (min, max) = column
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        println!("column {:>4}: mean {:>12.5} min {:>12.5} max {:>12.5}", j, mean[j], min, max);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    if let Some(threads) = cli.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            error!("Failed to configure {} worker threads: {}", threads, e);
            return ExitCode::FAILURE;
        }
    }

    let result = match &cli.command {
        Command::ComputePca(args) => compute_pca(args),
        Command::Inspect(args) => inspect(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
