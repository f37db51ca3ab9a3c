use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use clap::Parser;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use flate2::read::MultiGzDecoder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use chainresolve::{
    fit::ParameterType, ChainResolver, NonNegativeLeastSquares, ResolutionError, ResolverParams,
    DEFAULT_RELATIVE_CHAIN_CUTOFF,
};

use crate::args::{unit_interval_float, BoxedFitter, ResolverConfig, SolverChoice};
use crate::progress::ProgressRecord;
use crate::types::{GroupOutput, GroupRecord, InputDocument, BUFFER_SIZE};
use crate::write::{collate_results, write_output, OutputSink};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const CONFIG_FILE_NAME: &str = "chainresolver.toml";
pub const ENV_PREFIX: &str = "CHAINRESOLVER_";

#[derive(Debug, Error)]
pub enum ChainResolverError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to parse the input document: {0}")]
    InputFormatError(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Failed to read the configuration: {0}")]
    ConfigurationError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("Invalid resolution parameters: {0}")]
    ParameterError(
        #[source]
        #[from]
        ResolutionError,
    ),
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPoolError(
        #[source]
        #[from]
        rayon::ThreadPoolBuildError,
    ),
}

fn default_output_file() -> PathBuf {
    PathBuf::from("-")
}

/// Resolve the relative intensity of each candidate chain combination of a lipid
/// from the fragment peaks detected for its chains.
///
/// Read a JSON document of resolution groups from a file or stream, resolve each group
/// in parallel, and write one JSON line per group in input order.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
pub struct ChainResolverApp {
    /// The path to read the input document from, or if '-' is passed, read from STDIN.
    ///
    /// Gzip compressed input is detected automatically.
    #[arg()]
    pub input_file: String,

    /// The path to write the output to, or if '-' is passed, write to STDOUT.
    ///
    /// If the path ends with `.gz`, the output is gzip compressed.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `chainresolver.toml` in the working directory.
    /// Environment variables prefixed with `CHAINRESOLVER_` will be read too.
    #[arg(long = "config-file")]
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// The fraction of the strongest combination's fitted value below which a combination
    /// is pruned, in (0, 1] [default: 0.2]
    #[arg(short = 'c', long = "relative-chain-cutoff", value_parser = unit_interval_float)]
    #[serde(default)]
    pub relative_chain_cutoff: Option<ParameterType>,

    /// Include the trace of pruned combinations in the output. Pass `--debug=false` to
    /// turn off a configured trace
    #[arg(
        short = 'd',
        long = "debug",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    #[serde(default)]
    pub debug: Option<bool>,

    /// Fail a group that has not stabilized after this many fitting rounds
    #[arg(long = "max-rounds")]
    #[serde(default)]
    pub max_rounds: Option<usize>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(short = 't', long = "threads", allow_negative_numbers = true)]
    #[serde(default)]
    pub threads: Option<i32>,

    /// The size of the buffer for queueing writing of results to the output stream
    #[arg(short = 'w', long = "write-buffer-size")]
    #[serde(default)]
    pub write_buffer_size: Option<usize>,

    /// The least squares solver to fit combinations with [default: nnls]
    #[arg(long = "solver")]
    #[serde(default)]
    pub solver: Option<SolverChoice>,

    #[arg(skip)]
    #[serde(default)]
    pub nnls: NonNegativeLeastSquares,
}

impl ChainResolverApp {
    /// The configuration sources in increasing order of precedence
    pub fn configuration(&self) -> Figment {
        let mut config = Figment::new().merge(Toml::file(CONFIG_FILE_NAME));
        if let Some(path) = self.config_file.as_ref() {
            config = config.merge(Toml::file_exact(path));
        }
        config.merge(Env::prefixed(ENV_PREFIX))
    }

    /// Fill in anything not given on the command line from the configuration sources
    pub fn with_configuration(self) -> Result<Self, ChainResolverError> {
        let config: ResolverConfig = self.configuration().extract()?;
        Ok(self.apply_config(config))
    }

    pub fn apply_config(mut self, config: ResolverConfig) -> Self {
        self.relative_chain_cutoff = self.relative_chain_cutoff.or(config.relative_chain_cutoff);
        self.debug = self.debug.or(config.debug);
        self.max_rounds = self.max_rounds.or(config.max_rounds);
        self.threads = self.threads.or(config.threads);
        self.write_buffer_size = self.write_buffer_size.or(config.write_buffer_size);
        self.solver = self.solver.or(config.solver);
        if let Some(nnls) = config.nnls {
            self.nnls = nnls;
        }
        self
    }

    pub fn resolver_params(&self) -> ResolverParams {
        ResolverParams::new(
            self.relative_chain_cutoff
                .unwrap_or(DEFAULT_RELATIVE_CHAIN_CUTOFF),
            self.debug.unwrap_or_default(),
            self.max_rounds,
        )
    }

    fn make_resolver(&self) -> Result<ChainResolver<BoxedFitter>, ChainResolverError> {
        let params = self.resolver_params();
        params.validate()?;
        let solver = self.solver.unwrap_or_default();
        debug!("Using {solver} with {params:?}");
        Ok(ChainResolver::new(params, solver.make_fitter(self.nnls)))
    }

    fn create_threadpool(&self) -> Result<rayon::ThreadPool, ChainResolverError> {
        let num_threads = match self.threads {
            Some(threads) if threads > 0 => threads as usize,
            _ => thread::available_parallelism()?.into(),
        };
        debug!("Using {} cores", num_threads);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?)
    }

    fn read_input(&self) -> Result<InputDocument, ChainResolverError> {
        let mut buffer = Vec::new();
        if self.input_file == "-" {
            io::stdin().lock().read_to_end(&mut buffer)?;
        } else {
            fs::File::open(&self.input_file)?.read_to_end(&mut buffer)?;
        }
        let compressed = buffer.starts_with(&GZIP_MAGIC);
        debug!(
            "Read {} bytes from {} (compressed? {compressed})",
            buffer.len(),
            self.input_file
        );
        let document = if compressed {
            let mut decompressed = Vec::new();
            MultiGzDecoder::new(buffer.as_slice()).read_to_end(&mut decompressed)?;
            serde_json::from_slice(&decompressed)?
        } else {
            serde_json::from_slice(&buffer)?
        };
        Ok(document)
    }

    pub fn main(&self) -> Result<ProgressRecord, ChainResolverError> {
        info!(
            "chainresolver v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());
        let resolver = self.make_resolver()?;
        let document = self.read_input()?;
        info!("Read {} groups", document.groups.len());
        let writer = OutputSink::create(&self.output_file)?;
        let pool = self.create_threadpool()?;
        let prog = self.run_workflow(&pool, resolver, document.groups, writer)?;
        Ok(prog)
    }

    fn run_workflow(
        &self,
        pool: &rayon::ThreadPool,
        resolver: ChainResolver<BoxedFitter>,
        groups: Vec<GroupRecord>,
        writer: OutputSink,
    ) -> io::Result<ProgressRecord> {
        let buffer_size = self.write_buffer_size.unwrap_or(BUFFER_SIZE).max(1);
        let (send_solved, recv_solved) = crossbeam_channel::bounded(buffer_size);
        let (send_collated, recv_collated) = crossbeam_channel::bounded(buffer_size);
        let debug = resolver.params.debug;

        let start = Instant::now();
        let collate_task = thread::spawn(move || collate_results(recv_solved, send_collated));
        let write_task = thread::spawn(move || write_output(writer, recv_collated));

        let prog = pool.install(|| {
            groups
                .into_par_iter()
                .enumerate()
                .map(|(group_idx, record)| {
                    let group = record.into_group();
                    let output = GroupOutput::from_resolution(resolver.resolve_group(&group), debug);
                    if let Some(e) = output.error.as_ref() {
                        warn!("Failed to resolve {}: {e}", output.name);
                    }
                    let prog = ProgressRecord::from(&output);
                    if let Err(e) = send_solved.send((group_idx, output)) {
                        warn!("Failed to send group: {}", e);
                    }
                    prog
                })
                .reduce(ProgressRecord::default, |a, b| a + b)
        });
        drop(send_solved);
        let processing_elapsed = start.elapsed();

        info!("Groups: {}", prog.groups);
        info!("Resolved: {} | Failed: {}", prog.resolved, prog.failed);
        info!(
            "Surviving Combinations: {} | Rounds: {}",
            prog.surviving_combinations, prog.rounds
        );
        info!("Elapsed Time: {:0.3?}", processing_elapsed);

        if let Err(e) = collate_task.join() {
            warn!("Failed to join collator task: {e:?}")
        }

        match write_task.join() {
            Ok(o) => {
                let (writer, written) = o?;
                writer.finish()?;
                debug!("Wrote {written} groups");
            }
            Err(e) => {
                warn!("Failed to join writer task: {e:?}");
            }
        }

        let elapsed = start.elapsed();
        if (elapsed.as_secs_f64() - processing_elapsed.as_secs_f64()) > 2.0 {
            info!("Total Elapsed Time: {:0.3?}", elapsed);
        }
        Ok(prog)
    }
}
