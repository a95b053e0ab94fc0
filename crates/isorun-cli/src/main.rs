use atty::Stream;
use clap::Parser;
use color_eyre::Result;
use isorun_core::{
    resolve_cache_dir, CachePolicies, ManifestSource, RunRequest, EXIT_CONFIG, EXIT_IO,
};

mod cli;
mod logging;
mod style;

use cli::IsorunCli;
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = IsorunCli::parse();
    logging::init_tracing(
        logging::console_level(cli.trace, cli.verbose, cli.quiet),
        cli.log_file.as_deref(),
    );
    let style = Style::new(cli.no_color, atty::is(Stream::Stderr));

    let request = match build_request(&cli) {
        Ok(request) => request,
        Err((code, message)) => {
            eprintln!("{}", style.error(&message));
            std::process::exit(code);
        }
    };

    match isorun_core::run(&request) {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::debug!(error = ?err, "run failed");
            eprintln!("{}", style.error(&err.to_string()));
            std::process::exit(err.exit_code());
        }
    }
}

fn build_request(cli: &IsorunCli) -> Result<RunRequest, (i32, String)> {
    let source = match (&cli.source.isolated, &cli.source.hash) {
        (Some(path), _) => ManifestSource::File(path.clone()),
        (None, Some(digest)) => ManifestSource::Digest(digest.clone()),
        (None, None) => {
            return Err((EXIT_CONFIG, "one of --isolated or --hash is required".into()));
        }
    };
    let cache_dir = match &cli.cache {
        Some(dir) if dir.is_relative() => std::env::current_dir()
            .map_err(|err| (EXIT_IO, format!("unable to resolve {}: {err}", dir.display())))?
            .join(dir),
        Some(dir) => dir.clone(),
        None => {
            resolve_cache_dir()
                .map_err(|err| (EXIT_IO, format!("unable to resolve cache directory: {err}")))?
                .path
        }
    };
    Ok(RunRequest {
        source,
        cache_dir,
        remote: cli.remote.clone(),
        policies: CachePolicies {
            max_cache_size: cli.max_cache_size,
            min_free_space: cli.min_free_space,
            max_items: cli.max_items,
        },
        no_run: cli.no_run,
        env: cli.env.clone(),
    })
}
