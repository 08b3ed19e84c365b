//! action-cache - inspect and exercise a tiered action cache
//!
//! Opens the local snapshot, attaches the remote tier when one is
//! configured, and runs a single command against the result.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tiered_action_cache::{
    CacheConfig, CacheEntry, FileActionCache, FileDigest, HttpMethod, RemoteActionCache,
};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Print every local entry
    Dump,
    /// Look an entry up (local, then remote)
    Get { key: String },
    /// Record an entry for files that already exist under the execution root
    Put {
        key: String,
        action_key: String,
        outputs: Vec<String>,
    },
    /// Print a signed URL for a blob
    Sign { digest: String, method: HttpMethod },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"action-cache - Build action cache with a shared remote tier

USAGE:
    action-cache dump
    action-cache get <key>
    action-cache put <key> <action_key> <output>...
    action-cache sign <digest_hex> [get|put]
    action-cache help

COMMANDS:
    dump    List the entries of the local cache
    get     Look up an entry, restoring it from the remote tier on a local miss
    put     Record an entry whose outputs are the given paths (relative to
            the execution root) and publish it to the remote tier
    sign    Print a time-limited URL for the blob with the given digest
    help    Show this help message

ENVIRONMENT:
    ACTION_CACHE_CONFIG       JSON configuration file (overrides the variables below)
    ACTION_CACHE_BUCKET       Bucket for the remote tier (unset = local only)
    ACTION_CACHE_REGION       Signing region (default us-east-1)
    ACTION_CACHE_ENDPOINT     S3-compatible endpoint URL
    ACTION_CACHE_PREFIX       Key prefix inside the bucket (default action-cache)
    ACTION_CACHE_SHARED       Restore local misses from the remote tier (default true)
    ACTION_CACHE_STRICT       Report remote failures instead of treating them as misses
    ACTION_CACHE_EXEC_ROOT    Directory output paths are relative to
    ACTION_CACHE_LOCAL_PATH   Local snapshot file
    AWS_ACCESS_KEY_ID         Object store access key
    AWS_SECRET_ACCESS_KEY     Object store secret key
    AWS_SESSION_TOKEN         Optional session token
    RUST_LOG                  Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "dump" => Ok(Command::Dump),
        "get" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: action-cache get <key>"));
            }
            Ok(Command::Get {
                key: args[2].clone(),
            })
        }
        "put" => {
            if args.len() < 5 {
                return Err(anyhow!(
                    "Usage: action-cache put <key> <action_key> <output>..."
                ));
            }
            Ok(Command::Put {
                key: args[2].clone(),
                action_key: args[3].clone(),
                outputs: args[4..].to_vec(),
            })
        }
        "sign" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: action-cache sign <digest_hex> [get|put]"));
            }
            let method = match args.get(3) {
                Some(m) => m.parse()?,
                None => HttpMethod::Get,
            };
            Ok(Command::Sign {
                digest: args[2].clone(),
                method,
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

/// Load configuration from `ACTION_CACHE_CONFIG` or the environment
fn load_config() -> Result<CacheConfig> {
    match env::var("ACTION_CACHE_CONFIG") {
        Ok(path) => CacheConfig::from_file(Path::new(&path))
            .with_context(|| format!("Failed to load configuration from {}", path)),
        Err(_) => CacheConfig::from_env().context("Invalid ACTION_CACHE_* environment"),
    }
}

/// Build an entry for outputs that already exist under `exec_root`
async fn describe_outputs(
    cache: &RemoteActionCache,
    exec_root: &Path,
    action_key: &str,
    outputs: &[String],
) -> Result<CacheEntry> {
    let mut entry = cache.create_entry(action_key, false);
    for output in outputs {
        let digest = FileDigest::of_file(&exec_root.join(output))
            .await
            .with_context(|| format!("Failed to hash output {}", output))?;
        entry = entry.with_output(output.as_str(), digest);
    }

    let combined = FileDigest::combine(entry.outputs().iter().map(|o| (o.path.as_str(), &o.digest)));
    Ok(entry.with_digest(combined))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = load_config()?;
    let local_path = config
        .local_path
        .clone()
        .unwrap_or_else(FileActionCache::default_path);
    let exec_root: PathBuf = config
        .remote
        .as_ref()
        .map(|r| r.exec_root.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    let local = Arc::new(
        FileActionCache::open(&local_path)
            .with_context(|| format!("Failed to open local cache {}", local_path.display()))?,
    );
    let cache = match RemoteActionCache::new(local, &config) {
        Ok(cache) => cache,
        Err(e) => {
            error!(error = %e, "Failed to set up action cache");
            return Err(e.into());
        }
    };

    let outcome = run(&cache, &exec_root, command).await;
    cache.shutdown().await;
    outcome
}

async fn run(cache: &RemoteActionCache, exec_root: &Path, command: Command) -> Result<()> {
    match command {
        Command::Dump => {
            cache.dump(&mut io::stdout().lock())?;
        }
        Command::Get { key } => match cache.get(&key).await? {
            Some(entry) => {
                println!("{}", serde_json::to_string_pretty(&entry)?);
                // a remote hit is now recorded locally
                cache.save()?;
            }
            None => {
                println!("No entry for {}", key);
            }
        },
        Command::Put {
            key,
            action_key,
            outputs,
        } => {
            let entry = describe_outputs(cache, exec_root, &action_key, &outputs).await?;
            let digest = entry.digest().clone();

            let published = cache.put(&key, entry).await;
            let size = cache.save().context("Failed to save local cache")?;
            info!(key = %key, digest = %digest, snapshot_bytes = size, "Stored entry");

            match published {
                Ok(()) => println!("Stored {} ({})", key, digest),
                Err(e) if e.is_remote() => {
                    error!(error = %e, "Remote publish failed; entry kept locally");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Sign { digest, method } => {
            let digest = FileDigest::from_hex(&digest)?;
            let url = cache.signed_url(&digest, method)?;
            println!("{}", url.url);
        }
        Command::Help => print_help(),
    }

    Ok(())
}
