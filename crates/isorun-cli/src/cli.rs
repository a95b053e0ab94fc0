use std::path::PathBuf;

use clap::{ArgAction, Args, Parser};
use isorun_core::{Digest, DEFAULT_MAX_CACHE_SIZE, DEFAULT_MAX_ITEMS, DEFAULT_MIN_FREE_SPACE};

pub const ISORUN_BEFORE_HELP: &str = concat!(
    "isorun ",
    env!("CARGO_PKG_VERSION"),
    " – stage a content-addressed manifest tree into a sandbox and run it\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "isorun",
    author,
    version,
    before_help = ISORUN_BEFORE_HELP
)]
#[allow(clippy::struct_excessive_bools)]
pub struct IsorunCli {
    #[arg(short, long, help = "Only log errors")]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q")]
    pub trace: bool,
    #[arg(long, help = "Disable colored error output")]
    pub no_color: bool,
    #[arg(
        long,
        env = "ISORUN_LOG_FILE",
        value_name = "PATH",
        help = "Also append debug logs to this file"
    )]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(
        long,
        env = "ISORUN_REMOTE",
        value_name = "LOCATION",
        help = "Base URL or directory holding the content-addressed items"
    )]
    pub remote: String,
    #[arg(
        long,
        env = "ISORUN_CACHE_PATH",
        value_name = "DIR",
        help = "Cache directory (defaults to $XDG_CACHE_HOME/isorun)"
    )]
    pub cache: Option<PathBuf>,
    #[arg(
        long,
        env = "ISORUN_MAX_CACHE_SIZE",
        value_name = "BYTES",
        default_value_t = DEFAULT_MAX_CACHE_SIZE,
        help = "Trim the cache to this many bytes (0 disables)"
    )]
    pub max_cache_size: u64,
    #[arg(
        long,
        env = "ISORUN_MIN_FREE_SPACE",
        value_name = "BYTES",
        default_value_t = DEFAULT_MIN_FREE_SPACE,
        help = "Trim the cache until this much disk stays free (0 disables)"
    )]
    pub min_free_space: u64,
    #[arg(
        long,
        env = "ISORUN_MAX_ITEMS",
        value_name = "COUNT",
        default_value_t = DEFAULT_MAX_ITEMS,
        help = "Trim the cache to this many items (0 disables)"
    )]
    pub max_items: usize,
    #[arg(long, help = "Stage the tree and tear it down without running the command")]
    pub no_run: bool,
    #[arg(
        long = "env",
        value_name = "KEY=VALUE",
        value_parser = parse_env_pair,
        help = "Default environment variable for the command, kept only when unset"
    )]
    pub env: Vec<(String, String)>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct SourceArgs {
    #[arg(long, value_name = "FILE", help = "Local manifest to use as the root")]
    pub isolated: Option<PathBuf>,
    #[arg(
        long,
        value_name = "DIGEST",
        value_parser = parse_digest,
        help = "Digest of the root manifest on the remote"
    )]
    pub hash: Option<Digest>,
}

fn parse_digest(raw: &str) -> Result<Digest, String> {
    Digest::parse(raw).map_err(|err| err.to_string())
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        IsorunCli::command().debug_assert();
    }

    #[test]
    fn isolated_and_hash_are_exclusive() {
        let digest = "a".repeat(40);
        let err = IsorunCli::try_parse_from([
            "isorun",
            "--remote",
            "/srv",
            "--isolated",
            "m.json",
            "--hash",
            digest.as_str(),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);

        let err = IsorunCli::try_parse_from(["isorun", "--remote", "/srv"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_limits_and_env_pairs() {
        let cli = IsorunCli::try_parse_from([
            "isorun",
            "--remote",
            "/srv",
            "--isolated",
            "m.json",
            "--max-items",
            "0",
            "--env",
            "A=1=2",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.max_items, 0);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.env, [("A".to_string(), "1=2".to_string())]);
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_digest("short").is_err());
    }
}
