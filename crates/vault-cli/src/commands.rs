use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use vault_ledger::{BlobLedger, LedgerStats, WalBlobLedger, WalConfig};
use vault_store::{BlobStore, PutReceipt, StagingReport, SweepPolicy, SweepReport, VerifyOutcome};
use vault_types::{BlobRecord, BlobState, Digest, MediaType};

use crate::cli::*;
use crate::config::{LedgerBackend, VaultConfig};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = VaultConfig::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.store.root = root.clone();
    }
    let format = cli.format;

    match config.ledger.clone() {
        LedgerBackend::Wal { sync, .. } => {
            let path = config
                .wal_path()
                .context("WAL backend without a log path")?;
            let ledger = Arc::new(
                WalBlobLedger::open(&path, WalConfig { sync_mode: sync })
                    .with_context(|| format!("failed to open ledger {}", path.display()))?,
            );
            if let Command::Compact = cli.command {
                return cmd_compact(&ledger, format);
            }
            let store = BlobStore::new(config.store, ledger);
            dispatch(&store, cli.command, format).await
        }
        #[cfg(feature = "postgres")]
        LedgerBackend::Postgres {
            url,
            max_connections,
        } => {
            if let Command::Compact = cli.command {
                bail!("compact only applies to the WAL ledger");
            }
            let ledger = Arc::new(
                vault_ledger::PgBlobLedger::connect(&url, max_connections)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            );
            let store = BlobStore::new(config.store, ledger);
            dispatch(&store, cli.command, format).await
        }
        #[cfg(not(feature = "postgres"))]
        LedgerBackend::Postgres { .. } => {
            bail!("this build has no PostgreSQL support; rebuild with `--features postgres`")
        }
    }
}

async fn dispatch<L: BlobLedger>(
    store: &BlobStore<L>,
    command: Command,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        Command::Put(args) => cmd_put(store, args, format).await,
        Command::Cat(args) => cmd_cat(store, &args.digest).await,
        Command::Resolve(args) => cmd_resolve(store, &args.digest, format).await,
        Command::Stat(args) => cmd_stat(store, &args.digest, format).await,
        Command::Ref(args) => cmd_adjust(store, &args.digest, true, format).await,
        Command::Unref(args) => cmd_adjust(store, &args.digest, false, format).await,
        Command::Sweep(args) => cmd_sweep(store, args, format).await,
        Command::Verify(args) => cmd_verify(store, &args.digests, format).await,
        Command::Stats => cmd_stats(store, format).await,
        Command::Compact => bail!("compact only applies to the WAL ledger"),
    }
}

fn parse_digest(s: &str) -> anyhow::Result<Digest> {
    Digest::from_hex(s.trim()).with_context(|| format!("invalid digest `{s}`"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct PutOutput {
    #[serde(flatten)]
    receipt: PutReceipt,
    reference_count: Option<u64>,
}

async fn cmd_put<L: BlobLedger>(
    store: &BlobStore<L>,
    args: PutArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let media_type = args
        .media_type
        .as_deref()
        .map(MediaType::parse)
        .transpose()
        .context("invalid media type")?;

    let receipt = match args.path.as_deref() {
        None => store.put(tokio::io::stdin(), media_type).await?,
        Some(p) if p == Path::new("-") => store.put(tokio::io::stdin(), media_type).await?,
        Some(p) => {
            let file = tokio::fs::File::open(p)
                .await
                .with_context(|| format!("failed to open {}", p.display()))?;
            store.put(file, media_type).await?
        }
    };
    let reference_count = if args.acquire {
        Some(store.acquire_new(&receipt).await?)
    } else {
        None
    };

    match format {
        OutputFormat::Json => print_json(&PutOutput {
            receipt,
            reference_count,
        }),
        OutputFormat::Text => {
            let status = if receipt.already_existed {
                "deduplicated".yellow()
            } else {
                "stored".green()
            };
            println!("{} {} ({} bytes, {})", "✓".green().bold(), receipt.digest.to_string().cyan(), receipt.size_bytes, status);
            if let Some(count) = reference_count {
                println!("  References: {}", count.to_string().bold());
            }
            Ok(())
        }
    }
}

async fn cmd_cat<L: BlobLedger>(store: &BlobStore<L>, digest: &str) -> anyhow::Result<()> {
    let digest = parse_digest(digest)?;
    let Some(mut file) = store.open(&digest).await? else {
        bail!("blob {digest} not found");
    };
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut file, &mut stdout).await?;
    stdout.flush().await?;
    Ok(())
}

async fn cmd_resolve<L: BlobLedger>(
    store: &BlobStore<L>,
    digest: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let digest = parse_digest(digest)?;
    let Some(path) = store.resolve(&digest).await? else {
        bail!("blob {digest} not found");
    };
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "digest": digest, "path": path })),
        OutputFormat::Text => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn cmd_stat<L: BlobLedger>(
    store: &BlobStore<L>,
    digest: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let digest = parse_digest(digest)?;
    let Some(record) = store.lookup(&digest).await? else {
        bail!("blob {digest} not found");
    };
    match format {
        OutputFormat::Json => print_json(&record),
        OutputFormat::Text => {
            print_record(&record);
            Ok(())
        }
    }
}

fn print_record(record: &BlobRecord) {
    let state = match record.state() {
        BlobState::Referenced => "referenced".green(),
        BlobState::Unreferenced => "unreferenced".yellow(),
    };
    println!("Blob {}", record.digest.to_string().cyan().bold());
    println!("  State: {state}");
    println!("  References: {}", record.reference_count);
    println!("  Size: {} bytes", record.size_bytes);
    if let Some(media) = &record.declared_media_type {
        println!("  Media type: {media}");
    }
    println!("  Path: {}", record.physical_path.display());
    println!("  Created: {}", record.created_at.to_rfc3339());
    if let Some(at) = record.released_at {
        println!("  Unreferenced since: {}", at.to_rfc3339());
    }
}

async fn cmd_adjust<L: BlobLedger>(
    store: &BlobStore<L>,
    digest: &str,
    acquire: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let digest = parse_digest(digest)?;
    let count = if acquire {
        store.increment_reference(&digest).await?
    } else {
        store.decrement_reference(&digest).await?
    };
    match format {
        OutputFormat::Json => {
            print_json(&serde_json::json!({ "digest": digest, "reference_count": count }))
        }
        OutputFormat::Text => {
            println!("{} {} now has {} reference(s)", "✓".green().bold(), digest.short_hex().cyan(), count.to_string().bold());
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct SweepOutput {
    blobs: SweepReport,
    staging: Option<StagingReport>,
}

async fn cmd_sweep<L: BlobLedger>(
    store: &BlobStore<L>,
    args: SweepArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut policy = SweepPolicy::from_config(store.config());
    if let Some(secs) = args.grace_secs {
        policy.grace = Duration::from_secs(secs);
    }
    if let Some(limit) = args.limit {
        policy.limit = limit;
    }
    policy.reclaim_orphans = !args.no_orphans;

    let blobs = store.sweep(&policy).await?;
    let staging = if args.staging {
        Some(store.sweep_staging(store.config().staging_max_age()).await?)
    } else {
        None
    };

    match format {
        OutputFormat::Json => print_json(&SweepOutput { blobs, staging }),
        OutputFormat::Text => {
            println!(
                "{} Sweep: {} reclaimed ({} bytes), {} skipped, {} orphan(s) removed",
                "✓".green().bold(),
                blobs.reclaimed.to_string().bold(),
                blobs.reclaimed_bytes,
                blobs.skipped,
                blobs.orphans_reclaimed,
            );
            if blobs.missing_files > 0 {
                println!("  {} {} blob file(s) were already missing", "!".yellow(), blobs.missing_files);
            }
            if blobs.failed > 0 {
                println!("  {} {} blob file(s) could not be deleted", "✗".red(), blobs.failed);
            }
            if let Some(staging) = staging {
                println!("  Staging: {} stale file(s) removed", staging.removed);
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct VerifyLine {
    digest: Digest,
    #[serde(flatten)]
    outcome: VerifyOutcome,
}

async fn cmd_verify<L: BlobLedger>(
    store: &BlobStore<L>,
    digests: &[String],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut lines = Vec::with_capacity(digests.len());
    for raw in digests {
        let digest = parse_digest(raw)?;
        let outcome = store.verify(&digest).await?;
        lines.push(VerifyLine { digest, outcome });
    }

    match format {
        OutputFormat::Json => print_json(&lines)?,
        OutputFormat::Text => {
            for line in &lines {
                let short = line.digest.short_hex();
                match &line.outcome {
                    VerifyOutcome::Intact => println!("{} {}", "✓".green(), short),
                    VerifyOutcome::Corrupt { actual } => {
                        println!("{} {} corrupt (hashes to {})", "✗".red().bold(), short, actual.short_hex())
                    }
                    VerifyOutcome::SizeMismatch { expected, actual } => println!(
                        "{} {} size mismatch (expected {expected}, found {actual})",
                        "✗".red().bold(),
                        short
                    ),
                    VerifyOutcome::Missing => println!("{} {} missing", "✗".red().bold(), short),
                }
            }
        }
    }

    let failed = lines.iter().filter(|l| !l.outcome.is_intact()).count();
    if failed > 0 {
        bail!("{failed} blob(s) failed verification");
    }
    Ok(())
}

async fn cmd_stats<L: BlobLedger>(store: &BlobStore<L>, format: OutputFormat) -> anyhow::Result<()> {
    let stats = store.stats().await?;
    match format {
        OutputFormat::Json => print_json(&stats),
        OutputFormat::Text => {
            print_stats(&stats);
            Ok(())
        }
    }
}

fn print_stats(stats: &LedgerStats) {
    println!("Blobs: {} ({} bytes)", stats.blobs.to_string().bold(), stats.bytes);
    println!("References: {}", stats.references);
    println!(
        "Unreferenced: {} ({} bytes)",
        stats.unreferenced_blobs.to_string().yellow(),
        stats.unreferenced_bytes
    );
}

fn cmd_compact(ledger: &WalBlobLedger, format: OutputFormat) -> anyhow::Result<()> {
    let (before, after) = ledger.compact().context("ledger compaction failed")?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "path": ledger.wal_path(),
            "bytes_before": before,
            "bytes_after": after,
        })),
        OutputFormat::Text => {
            println!("{} Compacted {}: {} -> {} bytes", "✓".green().bold(), ledger.wal_path().display(), before, after);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn digest_parsing() {
        let hello = HELLO;
        assert_eq!(parse_digest(hello).unwrap().to_hex(), hello);
        assert_eq!(parse_digest(&format!(" {hello}\n")).unwrap().to_hex(), hello);
        let err = parse_digest("xyz").unwrap_err();
        assert!(err.to_string().contains("invalid digest"));
    }

    #[test]
    fn verify_line_flattens_outcome() {
        let line = VerifyLine {
            digest: Digest::from_hash([0; 32]),
            outcome: VerifyOutcome::Missing,
        };
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["status"], "missing");
        assert_eq!(json["digest"], "0".repeat(64));
    }

    #[tokio::test]
    async fn dispatch_against_wal_store() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(
            WalBlobLedger::open(&dir.path().join("ledger.wal"), WalConfig::default()).unwrap(),
        );
        let input = dir.path().join("input.txt");
        std::fs::write(&input, b"hello").unwrap();
        let store = BlobStore::new(vault_store::StoreConfig::with_root(dir.path()), ledger.clone());

        let put = Command::Put(PutArgs {
            path: Some(input),
            media_type: Some("text/plain".into()),
            acquire: true,
        });
        dispatch(&store, put, OutputFormat::Json).await.unwrap();

        let hello = parse_digest(HELLO).unwrap();
        let record = store.lookup(&hello).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 1);

        let unref = Command::Unref(DigestArg {
            digest: hello.to_hex(),
        });
        dispatch(&store, unref, OutputFormat::Text).await.unwrap();
        let again = Command::Unref(DigestArg {
            digest: hello.to_hex(),
        });
        assert!(dispatch(&store, again, OutputFormat::Text).await.is_err());

        let verify = Command::Verify(VerifyArgs {
            digests: vec![hello.to_hex()],
        });
        dispatch(&store, verify, OutputFormat::Text).await.unwrap();

        assert!(dispatch(&store, Command::Compact, OutputFormat::Text).await.is_err());
        cmd_compact(&ledger, OutputFormat::Json).unwrap();
    }
}
