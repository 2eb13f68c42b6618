//! `csx` — front-end driver: load a MatrixMarket file, encode it into the
//! CSX representation, and validate or benchmark the parallel SpMV.
//!
//! Exit codes: 0 success, 1 I/O or parse error, 2 validation mismatch
//! against the CSR reference, 3 configuration error.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::anyhow;
use clap::Parser;

use csx_core::config::threads_from_env;
use csx_core::mmf::load_csr_file;
use csx_core::{
    CsrMatrix, CsxError, EncodeOptions, IterationOrder, Placement, SpmMt, SpmMtSym,
};

/// Relative tolerance for `--check` (64-bit values).
const CHECK_TOLERANCE: f64 = 1e-7;

#[derive(Parser, Debug)]
#[command(
    name = "csx",
    about = "Encode a sparse matrix into CSX and run parallel SpMV over it.",
    after_help = "The legacy environment variables (XFORM_CONF, ENCODE_DELTAS, \
                  WINDOW_SIZE, SAMPLES, SAMPLING_PORTION, SPLIT_BLOCKS, MT_CONF) \
                  are honoured; command-line flags win over them.",
    version
)]
struct Args {
    /// MatrixMarket coordinate file.
    mmf_file: PathBuf,

    /// Worker thread count.
    #[arg(long, short = 't')]
    threads: Option<usize>,

    /// Comma-separated iteration orders to consider (horizontal, vertical,
    /// diagonal, anti-diagonal, block-row-N, block-col-N).
    #[arg(long, value_delimiter = ',')]
    iter: Vec<String>,

    /// Statistics sampling window size (0 scans the full matrix).
    #[arg(long)]
    window_size: Option<usize>,

    /// Cap on sampled windows.
    #[arg(long)]
    samples: Option<usize>,

    /// Window inclusion probability in [0, 1].
    #[arg(long)]
    sampling_portion: Option<f64>,

    /// Allow splitting oversize block runs.
    #[arg(long)]
    split_blocks: bool,

    /// Pad the ctl stream so delta bodies are naturally aligned.
    #[arg(long)]
    aligned_ctl: bool,

    /// Place the shared vectors with first-touch NUMA interleaving.
    #[arg(long)]
    numa: bool,

    /// Validate the encoding against the CSR reference multiply.
    #[arg(long)]
    check: bool,

    /// Benchmark this many SpMV iterations.
    #[arg(long, value_name = "LOOPS")]
    bench: Option<usize>,
}

struct Failure {
    code: u8,
    error: anyhow::Error,
}

impl Failure {
    fn new(code: u8, error: anyhow::Error) -> Self {
        Failure { code, error }
    }
}

impl From<CsxError> for Failure {
    fn from(e: CsxError) -> Self {
        let code = match &e {
            CsxError::Config(_) => 3,
            _ => 1,
        };
        Failure::new(code, e.into())
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(f) => {
            eprintln!("csx: error: {:#}", f.error);
            ExitCode::from(f.code)
        }
    }
}

fn run(args: &Args) -> Result<(), Failure> {
    let opts = build_options(args)?;
    let nthreads = match args.threads {
        Some(n) => n,
        None => threads_from_env()?.unwrap_or(1),
    };

    log::info!(
        "orders: {}",
        opts.iteration_orders
            .iter()
            .map(|o| o.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let (header, a) = load_csr_file::<f64>(&args.mmf_file)?;
    log::info!(
        "{}: {}x{}, {} stored entries{}",
        args.mmf_file.display(),
        header.nrows,
        header.ncols,
        header.stored_entries,
        if header.symmetric { " (symmetric)" } else { "" }
    );

    if header.symmetric {
        let m = SpmMtSym::from_csr(&a, nthreads, &opts)?;
        let m = if args.numa {
            SpmMtSym {
                placement: Placement::Interleaved,
                ..m
            }
        } else {
            m
        };
        report_patterns(m.threads.iter().map(|t| &t.encoded.summaries));
        if args.check {
            check(m.check_against(&a, 2)?)?;
        }
        if let Some(loops) = args.bench {
            bench_report(&args.mmf_file, &a, nthreads, loops, m.compressed_size(), {
                m.bench_loop(loops)?
            })?;
        }
    } else {
        let mut m = SpmMt::from_csr(&a, nthreads, &opts)?;
        if args.numa {
            m = m.with_placement(Placement::Interleaved);
        }
        report_patterns(m.threads.iter().map(|t| &t.summaries));
        if args.check {
            check(m.check_against(&a, 2)?)?;
        }
        if let Some(loops) = args.bench {
            bench_report(&args.mmf_file, &a, nthreads, loops, m.compressed_size(), {
                m.bench_loop(loops)?
            })?;
        }
    }

    Ok(())
}

fn build_options(args: &Args) -> Result<EncodeOptions, Failure> {
    let mut opts = EncodeOptions::default().overlay_env()?;
    if !args.iter.is_empty() {
        opts.iteration_orders = args
            .iter
            .iter()
            .map(|s| IterationOrder::parse_name(s))
            .collect::<Result<_, _>>()?;
    }
    if let Some(w) = args.window_size {
        opts.window_size = w;
    }
    if let Some(s) = args.samples {
        opts.samples_max = s;
    }
    if let Some(p) = args.sampling_portion {
        opts.sampling_portion = p;
    }
    if args.split_blocks {
        opts.split_blocks = true;
    }
    if args.aligned_ctl {
        opts.aligned_ctl = true;
    }
    opts.validate()?;
    Ok(opts)
}

fn check(worst: f64) -> Result<(), Failure> {
    if worst > CHECK_TOLERANCE {
        return Err(Failure::new(
            2,
            anyhow!("validation failed: relative error {worst:.3e} exceeds {CHECK_TOLERANCE:.0e}"),
        ));
    }
    println!("check passed (worst relative error {worst:.3e})");
    Ok(())
}

fn report_patterns<'a>(
    per_thread: impl Iterator<Item = &'a Vec<csx_core::assemble::PatternSummary>>,
) {
    for (tid, summaries) in per_thread.enumerate() {
        let mut line = String::new();
        for s in summaries {
            let _ = write!(
                line,
                " id:{} np:{} nnz:{}",
                s.pattern_id, s.npatterns, s.nnz
            );
        }
        log::info!("thread {tid} units:{line}");
    }
}

fn bench_report(
    mmf: &Path,
    a: &CsrMatrix<f64>,
    threads: usize,
    loops: usize,
    size_bytes: usize,
    secs: f64,
) -> Result<(), Failure> {
    let mflops = (loops as f64 * a.nnz() as f64 * 2.0) / (1e6 * secs.max(1e-12));
    let report = serde_json::json!({
        "timestamp": chrono::Local::now().to_rfc3339(),
        "matrix": mmf.file_name().map(|s| s.to_string_lossy().to_string()),
        "format": "csx",
        "threads": threads,
        "loops": loops,
        "size_bytes": size_bytes,
        "seconds": secs,
        "mflops": mflops,
    });
    println!("{report}");
    Ok(())
}
