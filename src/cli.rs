//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download chapters through pluggable parsers and pack them into archives.
///
/// Each URL names a chapter manifest (JSON with `title`, `chapter` and
/// `images`). Pages are fetched concurrently and packed into a CBZ archive
/// next to them.
#[derive(Parser, Debug)]
#[command(name = "chapterdl")]
#[command(author, version, about)]
pub struct Args {
    /// Chapter URLs (read from stdin when omitted)
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Directory that receives one folder per chapter
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Chapters downloaded at once (1-10)
    #[arg(short = 'j', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub jobs: Option<u8>,

    /// Page fetches per chapter (1-32)
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub page_workers: Option<u8>,

    /// Page fetches across all chapters (1-128)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=128))]
    pub global_workers: Option<u8>,

    /// Attempts per request, including the first (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_attempts: Option<u8>,

    /// Requests per second across all hosts (0 to disable, max 1000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u32).range(0..=1000))]
    pub rate_limit: Option<u32>,

    /// Requests allowed in a burst before the rate limit applies (1-1000)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub burst: Option<u32>,

    /// Whole-request timeout in seconds (1-3600)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: Option<u64>,

    /// Keep loose pages only, do not build CBZ archives
    #[arg(long)]
    pub no_convert: bool,

    /// Queue a URL again even if it is already queued
    #[arg(long)]
    pub allow_duplicates: bool,

    /// Seconds running chapters get to finish after Ctrl-C (0-600)
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(0..=600))]
    pub drain_timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["chapterdl"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.urls.is_empty());
        assert!(args.jobs.is_none());
        assert!(args.rate_limit.is_none());
        assert!(!args.no_convert);
        assert_eq!(args.drain_timeout, 10);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["chapterdl", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["chapterdl", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["chapterdl", "--quiet"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["chapterdl", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_urls_are_positional() {
        let args =
            Args::try_parse_from(["chapterdl", "https://a.test/1.json", "https://a.test/2.json"])
                .unwrap();
        assert_eq!(args.urls.len(), 2);
    }

    #[test]
    fn test_cli_jobs_range() {
        let args = Args::try_parse_from(["chapterdl", "-j", "10"]).unwrap();
        assert_eq!(args.jobs, Some(10));

        let err = Args::try_parse_from(["chapterdl", "-j", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let err = Args::try_parse_from(["chapterdl", "--jobs", "11"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_page_worker_ranges() {
        let args =
            Args::try_parse_from(["chapterdl", "-p", "32", "--global-workers", "128"]).unwrap();
        assert_eq!(args.page_workers, Some(32));
        assert_eq!(args.global_workers, Some(128));

        let err = Args::try_parse_from(["chapterdl", "-p", "33"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let err = Args::try_parse_from(["chapterdl", "--global-workers", "129"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_max_attempts_zero_rejected() {
        let err = Args::try_parse_from(["chapterdl", "-r", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_rate_limit_zero_disables() {
        let args = Args::try_parse_from(["chapterdl", "-l", "0"]).unwrap();
        assert_eq!(args.rate_limit, Some(0));
    }

    #[test]
    fn test_cli_rate_limit_over_max_rejected() {
        let err = Args::try_parse_from(["chapterdl", "--rate-limit", "1001"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_flags_combine() {
        let args = Args::try_parse_from([
            "chapterdl",
            "-o",
            "/tmp/out",
            "--no-convert",
            "--allow-duplicates",
            "-t",
            "5",
            "--drain-timeout",
            "0",
            "https://a.test/1.json",
        ])
        .unwrap();
        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/out")));
        assert!(args.no_convert);
        assert!(args.allow_duplicates);
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.drain_timeout, 0);
        assert_eq!(args.urls, vec!["https://a.test/1.json".to_string()]);
    }
}
