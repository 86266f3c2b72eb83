//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Resumable, chunked, priority-scheduled downloads.
///
/// Accepts URLs as arguments or on stdin, downloads them concurrently with
/// byte-range chunking, and resumes interrupted transfers when a state
/// database is provided.
#[derive(Parser, Debug)]
#[command(name = "download-center")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download
    pub urls: Vec<String>,

    /// Directory downloaded files are written to
    #[arg(short, long, default_value = "./downloads")]
    pub destination: PathBuf,

    /// Maximum concurrent downloads (1-10)
    #[arg(short = 'c', long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub concurrency: u8,

    /// Chunk size in MiB (1-64)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub chunk_size_mib: u8,

    /// State database path (omit for a one-shot in-memory run)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Allow downloads whose size the server cannot report
    /// (falls back to a single-stream, non-resumable transfer)
    #[arg(long)]
    pub allow_unknown_size: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["download-center"]).unwrap();
        assert!(args.urls.is_empty());
        assert_eq!(args.destination, PathBuf::from("./downloads"));
        assert_eq!(args.concurrency, 4);
        assert_eq!(args.chunk_size_mib, 1);
        assert!(args.db.is_none());
        assert!(!args.allow_unknown_size);
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
    }

    #[test]
    fn test_cli_positional_urls() {
        let args = Args::try_parse_from([
            "download-center",
            "https://example.com/a.bin",
            "https://example.com/b.bin",
        ])
        .unwrap();
        assert_eq!(args.urls.len(), 2);
    }

    #[test]
    fn test_cli_concurrency_range_enforced() {
        let result = Args::try_parse_from(["download-center", "-c", "0"]);
        assert!(result.is_err());
        let result = Args::try_parse_from(["download-center", "-c", "11"]);
        assert!(result.is_err());
        let args = Args::try_parse_from(["download-center", "-c", "8"]).unwrap();
        assert_eq!(args.concurrency, 8);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["download-center", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        // --help causes early exit, so we check it returns an error with Help kind
        let result = Args::try_parse_from(["download-center", "--help"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
