use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kestrel_cache::{versioned_cache_dir, CacheService, DiskShadow};
use kestrel_config::{init_tracing, KestrelConfig};
use kestrel_core::Candidate;
use kestrel_dispatch::{Completion, Dispatcher, DispatcherOptions, RequestContext};
use kestrel_keys::{KeyDeriver, SysPathResolver};
use kestrel_process::{
    interpreter_sys_path, interpreter_version, resolve_interpreter, sibling_executable,
    BackendClient, BackendCommand, ClientOptions,
};
use kestrel_worker::{CompletionBackend, PoolOptions, WorkerPool};

#[derive(Parser)]
#[command(name = "kestrel", version, about = "Kestrel completion cache (complete, key, cache)")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Complete at a position in a file
    Complete(PositionArgs),
    /// Print the cache key and dependency files derived for a position
    Key(PositionArgs),
    /// Inspect or clear the on-disk cache
    Cache(CacheArgs),
}

#[derive(Args)]
struct PositionArgs {
    file: PathBuf,
    /// 1-based line
    #[arg(long)]
    line: usize,
    /// Byte column of the cursor (defaults to the end of the line)
    #[arg(long)]
    column: Option<usize>,
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print the cache directory for the active interpreter
    Path,
    /// Delete persisted entries for every interpreter version
    Clear,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => KestrelConfig::load_from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => KestrelConfig::default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Command::Complete(args) => complete(&config, &args),
        Command::Key(args) => key(&config, &args),
        Command::Cache(args) => match args.command {
            CacheCommand::Path => {
                let root = cache_root(&config)?;
                let env = Environment::probe(&config);
                match env.version {
                    Some(version) => println!("{}", versioned_cache_dir(&root, &version).display()),
                    None => println!("{}", root.display()),
                }
                Ok(0)
            }
            CacheCommand::Clear => {
                let root = cache_root(&config)?;
                let removed = clear_cache(&root)?;
                println!("cache: removed {removed} entries from {}", root.display());
                Ok(0)
            }
        },
    }
}

/// What the analysed interpreter reports about itself. Probe failures leave fields empty.
struct Environment {
    python: PathBuf,
    version: Option<String>,
    sys_path: Vec<PathBuf>,
}

impl Environment {
    fn probe(config: &KestrelConfig) -> Self {
        let python = resolve_interpreter(config.backend.python_path.as_deref());
        let timeout = config.backend.probe_timeout();
        let version = match interpreter_version(&python, timeout) {
            Ok(version) => Some(version),
            Err(err) => {
                tracing::warn!(target: "kestrel.cli", error = %err, "interpreter version probe failed");
                None
            }
        };
        let sys_path = match interpreter_sys_path(&python, timeout) {
            Ok(paths) => paths,
            Err(err) => {
                tracing::warn!(target: "kestrel.cli", error = %err, "interpreter sys.path probe failed");
                Vec::new()
            }
        };
        Self {
            python,
            version,
            sys_path,
        }
    }
}

fn cache_root(config: &KestrelConfig) -> Result<PathBuf> {
    config
        .cache
        .resolved_root()
        .context("no cache directory: set cache.root or KESTREL_CACHE_DIR")
}

fn clear_cache(root: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", root.display())),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            removed += DiskShadow::new(&path)
                .clear()
                .with_context(|| format!("failed to clear {}", path.display()))?;
        }
    }
    Ok(removed)
}

fn request_context(args: &PositionArgs) -> Result<RequestContext> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let lines: Vec<String> = text.lines().map(str::to_owned).collect();
    let column = args.column.unwrap_or_else(|| {
        args.line
            .checked_sub(1)
            .and_then(|idx| lines.get(idx))
            .map_or(0, String::len)
    });
    let filename = std::path::absolute(&args.file)
        .with_context(|| format!("failed to resolve {}", args.file.display()))?;
    Ok(RequestContext::at(filename, lines, args.line, column))
}

fn key(config: &KestrelConfig, args: &PositionArgs) -> Result<i32> {
    let ctx = request_context(args)?;
    let env = Environment::probe(config);
    let resolver = SysPathResolver::new(env.sys_path);
    let derived = KeyDeriver::new(&resolver, &config.dispatch.extra_path).derive(
        &ctx.filename,
        &ctx.cursor,
        &ctx.source,
    );

    if args.json {
        let value = serde_json::json!({
            "key": derived.key.as_ref().map(ToString::to_string),
            "category": derived.key.as_ref().map(|key| key.tag()),
            "dependencies": derived.dependencies,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match &derived.key {
            Some(key) => println!("key: {key}"),
            None => println!("key: (none)"),
        }
        for dependency in &derived.dependencies {
            println!("  depends on: {}", dependency.display());
        }
    }
    Ok(if derived.key.is_some() { 0 } else { 1 })
}

fn start_dispatcher(config: &KestrelConfig, env: Environment) -> Result<Dispatcher> {
    let disk = match (&env.version, config.cache.persist) {
        (Some(version), true) => config
            .cache
            .resolved_root()
            .map(|root| DiskShadow::new(versioned_cache_dir(&root, version))),
        _ => None,
    };
    let cache = Arc::new(CacheService::new(disk));

    let program = match &config.backend.program {
        Some(program) => program.clone(),
        None => sibling_executable("kestrel-backend")
            .context("could not find the kestrel-backend executable; set backend.program")?,
    };
    let mut python_path = config.backend.engine_path.clone();
    python_path.extend(config.dispatch.extra_path.iter().cloned());
    let mut command = BackendCommand::new(program)
        .interpreter(&env.python)
        .python_path(python_path);
    if let Some(file) = &config.logging.file {
        command = command.log_file(file);
    }
    let client_options = ClientOptions {
        max_completions: config.backend.max_completions,
        handshake_timeout: config.backend.handshake_timeout(),
        ..ClientOptions::default()
    };

    let pool = WorkerPool::start(
        PoolOptions {
            workers: config.workers.count,
            job_timeout: config.workers.job_timeout(),
        },
        |_| {
            let client = BackendClient::spawn(command.clone(), client_options.clone())?;
            Ok(Arc::new(client) as Arc<dyn CompletionBackend>)
        },
    )
    .context("failed to start backend workers")?;

    Dispatcher::start(
        cache,
        pool,
        Box::new(SysPathResolver::new(env.sys_path)),
        DispatcherOptions {
            wait: config.dispatch.wait(),
            direct_wait: config.workers.job_timeout(),
            extra_path: config.dispatch.extra_path.clone(),
        },
    )
    .context("failed to start dispatcher")
}

fn complete(config: &KestrelConfig, args: &PositionArgs) -> Result<i32> {
    let ctx = request_context(args)?.require_direct();
    let env = Environment::probe(config);
    let mut dispatcher = start_dispatcher(config, env)?;
    let reaper = dispatcher
        .cache()
        .start_reaper(config.cache.reap_interval(), config.cache.max_age());

    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    dispatcher.set_on_ready(move |key| {
        let _ = ready_tx.try_send(key.clone());
    });

    let candidates = match dispatcher.request(&ctx) {
        Completion::Ready(candidates) => candidates,
        Completion::Deferred { key, stale } => {
            tracing::debug!(target: "kestrel.cli", key = %key, "waiting for deferred result");
            let budget = config.workers.job_timeout() + Duration::from_millis(100);
            let _ = ready_rx.recv_timeout(budget);
            dispatcher.poll(&key).unwrap_or(stale)
        }
    };

    print_candidates(&candidates, args.json)?;
    dispatcher.shutdown();
    reaper.stop();
    Ok(0)
}

fn print_candidates(candidates: &[Candidate], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(candidates)?);
        return Ok(());
    }
    for candidate in candidates {
        if candidate.description.is_empty() {
            println!("{}\t{}", candidate.name, candidate.kind);
        } else {
            println!("{}\t{}\t{}", candidate.name, candidate.kind, candidate.description);
        }
    }
    Ok(())
}
