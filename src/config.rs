//! CLI parsing and validation.
//!
//! Grounded on `original_source/main/main.cc`: parse the port, `stat` the
//! served path and require a directory, canonicalise it. Expanded with
//! `clap` derive (grounded on `agucova-oxidized-cryptolib`'s
//! `#[derive(Parser)]` CLI) for the worker-thread count, cache size, and
//! verbosity flags the original wired through a bare global int
//! (`gVerboseLogLevel`).

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

const DEFAULT_CACHE_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "thttpd", about = "A static-content HTTP/1.1 server")]
struct Cli {
    /// Port to listen on.
    port: u16,

    /// Directory to serve files from.
    path_to_serve: PathBuf,

    /// Number of worker threads. 0 picks a default.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Compression cache capacity, in bytes.
    #[arg(long, default_value_t = DEFAULT_CACHE_BYTES)]
    cache_bytes: u64,

    /// Increase log verbosity. May be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Validated, canonicalised server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub path_to_serve: PathBuf,
    pub num_worker_threads: usize,
    pub cache_bytes: u64,
    pub verbosity: u8,
}

impl Config {
    /// Parses `argv`-style arguments and validates `path_to_serve`,
    /// mirroring `main.cc`'s `stat` + `S_ISDIR` + `realpath` sequence.
    pub fn from_args<I, T>(args: I) -> Result<Config>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| Error::Other(e.to_string()))?;

        let metadata = std::fs::metadata(&cli.path_to_serve).map_err(|e| {
            Error::posix(format!("failed to stat {}", cli.path_to_serve.display()), e)
        })?;
        if !metadata.is_dir() {
            return Err(Error::Other(format!(
                "not a directory: {}",
                cli.path_to_serve.display()
            )));
        }

        let canonical = cli.path_to_serve.canonicalize().map_err(|_| {
            Error::Canonicalisation(cli.path_to_serve.display().to_string())
        })?;

        Ok(Config {
            port: cli.port,
            path_to_serve: canonical,
            num_worker_threads: cli.threads,
            cache_bytes: cli.cache_bytes,
            verbosity: cli.verbose,
        })
    }
}
