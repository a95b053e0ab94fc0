use std::{
    fs,
    path::{Path, PathBuf},
};

use isorun_domain::{platform_flavor, Digest};
use isorun_store::{transport_for, CachePolicies, ContentAddressedCache, ContentFetcher};
use tracing::{debug, info};

use crate::core::{
    config::{missing_env_defaults, Config, EnvSnapshot},
    errors::RunError,
    runtime::{
        process::run_command_passthrough,
        sandbox::{make_read_only_recursive, materialize, sandbox_path, Sandbox},
    },
    tooling::timings::{Phase, TimingGuard},
    tree,
};

/// Where the root manifest comes from.
#[derive(Clone, Debug)]
pub enum ManifestSource {
    /// Already on the remote (or in the cache) under this digest.
    Digest(Digest),
    /// A local file, hashed and added to the cache before resolving.
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub source: ManifestSource,
    pub cache_dir: PathBuf,
    pub remote: String,
    pub policies: CachePolicies,
    /// Stage and tear down the tree without running the command.
    pub no_run: bool,
    /// Child environment defaults, applied only when the key is unset.
    pub env: Vec<(String, String)>,
}

/// Resolve, stage and run the manifest tree described by `request`.
///
/// Returns the child's exit code, or 0 when `no_run` is set.
///
/// # Errors
/// Returns a [`RunError`] whose [`RunError::exit_code`] classifies the failure.
pub fn run(request: &RunRequest) -> Result<i32, RunError> {
    run_with_config(request, &Config::from_env())
}

pub fn run_with_config(request: &RunRequest, config: &Config) -> Result<i32, RunError> {
    let setup = TimingGuard::start(config.timings(), Phase::Setup);
    let transport = transport_for(&request.remote)?;
    let fetcher = ContentFetcher::with_options(transport, config.fetch());
    let mut cache = ContentAddressedCache::open(&request.cache_dir, request.policies, fetcher)?;
    let root = root_digest(&mut cache, &request.source)?;
    drop(setup);

    let settings = {
        let mut timing = TimingGuard::start(config.timings(), Phase::Manifests);
        let settings = tree::resolve(&mut cache, &root, platform_flavor())?;
        if let Some(timing) = timing.as_mut() {
            timing.items(settings.files.len());
        }
        settings
    };
    debug!(
        %root,
        files = settings.files.len(),
        read_only = settings.read_only,
        "resolved manifest tree"
    );
    let command = match (&settings.command, request.no_run) {
        (Some(command), _) if !command.is_empty() => Some(command.clone()),
        (_, true) => None,
        _ => return Err(RunError::MissingCommand),
    };

    let sandbox = Sandbox::create(cache.dir())?;
    let cwd = {
        let mut timing = TimingGuard::start(config.timings(), Phase::Files);
        materialize(&mut cache, &settings, sandbox.root())?;
        let cwd = working_dir(sandbox.root(), &settings.relative_cwd)?;
        if settings.read_only {
            make_read_only_recursive(sandbox.root())?;
        }
        if let Some(timing) = timing.as_mut() {
            timing.items(settings.files.len());
        }
        cwd
    };

    let Some(command) = command else {
        info!(sandbox = %sandbox.root().display(), "staged tree, skipping command");
        return Ok(0);
    };
    let _timing = TimingGuard::start(config.timings(), Phase::Run);
    execute(&command, &cwd, &request.env)
}

fn root_digest(
    cache: &mut ContentAddressedCache,
    source: &ManifestSource,
) -> Result<Digest, RunError> {
    match source {
        ManifestSource::Digest(digest) => Ok(digest.clone()),
        ManifestSource::File(path) => {
            let bytes = fs::read(path)
                .map_err(|err| RunError::io(format!("reading {}", path.display()), err))?;
            let digest = Digest::of_bytes(&bytes);
            cache.add(path, &digest)?;
            debug!(%digest, path = %path.display(), "added local manifest");
            Ok(digest)
        }
    }
}

/// The child's working directory, created when no staged file implied it.
fn working_dir(root: &Path, relative_cwd: &str) -> Result<PathBuf, RunError> {
    if relative_cwd.is_empty() {
        return Ok(root.to_path_buf());
    }
    let cwd = sandbox_path(root, relative_cwd)?;
    fs::create_dir_all(&cwd).map_err(|err| RunError::mapping(&cwd, err))?;
    Ok(cwd)
}

fn execute(
    command: &[String],
    cwd: &Path,
    env_defaults: &[(String, String)],
) -> Result<i32, RunError> {
    let (program, args) = command.split_first().ok_or(RunError::MissingCommand)?;
    let program = resolve_program(program, cwd);
    let envs = missing_env_defaults(&EnvSnapshot::capture(), env_defaults);
    run_command_passthrough(&program, args, &envs, cwd)
}

/// Relative programs with a directory part are looked up from the working
/// directory; bare names go through `PATH`.
fn resolve_program(program: &str, cwd: &Path) -> String {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        cwd.join(path).to_string_lossy().into_owned()
    } else {
        program.to_string()
    }
}
