use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "vault",
    about = "Vault: content-addressed, deduplicating blob store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage root (overrides the configuration file and VAULT_STORAGE_DIR)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a file (or stdin) and print its digest
    Put(PutArgs),
    /// Write a blob's bytes to stdout
    Cat(DigestArg),
    /// Print the physical path of a blob
    Resolve(DigestArg),
    /// Show a blob's ledger record
    Stat(DigestArg),
    /// Add a reference to a blob
    Ref(DigestArg),
    /// Drop a reference from a blob
    Unref(DigestArg),
    /// Reclaim unreferenced blobs past the grace period
    Sweep(SweepArgs),
    /// Re-hash blobs and compare against their digests
    Verify(VerifyArgs),
    /// Show ledger totals
    Stats,
    /// Rewrite the ledger log to one entry per live blob
    Compact,
}

#[derive(Args)]
pub struct PutArgs {
    /// File to store; reads stdin when omitted or "-"
    pub path: Option<PathBuf>,
    /// Declared media type, e.g. text/plain
    #[arg(short, long)]
    pub media_type: Option<String>,
    /// Take the first reference right away
    #[arg(short, long)]
    pub acquire: bool,
}

#[derive(Args)]
pub struct DigestArg {
    /// SHA-256 digest, 64 hex characters
    pub digest: String,
}

#[derive(Args)]
pub struct SweepArgs {
    /// Override the configured grace period
    #[arg(long)]
    pub grace_secs: Option<u64>,
    /// Override the configured batch limit
    #[arg(long)]
    pub limit: Option<usize>,
    /// Leave shard files without a ledger row alone
    #[arg(long)]
    pub no_orphans: bool,
    /// Also delete stale staging files
    #[arg(long)]
    pub staging: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    #[arg(required = true)]
    pub digests: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn parse_put_stdin() {
        let cli = Cli::try_parse_from(["vault", "put"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert!(args.path.is_none());
            assert!(!args.acquire);
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_put_file_with_media_type() {
        let cli =
            Cli::try_parse_from(["vault", "put", "a.txt", "-m", "text/plain", "--acquire"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.path, Some(PathBuf::from("a.txt")));
            assert_eq!(args.media_type.as_deref(), Some("text/plain"));
            assert!(args.acquire);
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_ref_and_unref() {
        let cli = Cli::try_parse_from(["vault", "ref", HELLO]).unwrap();
        assert!(matches!(cli.command, Command::Ref(ref a) if a.digest == HELLO));
        let cli = Cli::try_parse_from(["vault", "unref", HELLO]).unwrap();
        assert!(matches!(cli.command, Command::Unref(_)));
    }

    #[test]
    fn parse_sweep_overrides() {
        let cli = Cli::try_parse_from([
            "vault", "sweep", "--grace-secs", "0", "--limit", "10", "--no-orphans", "--staging",
        ])
        .unwrap();
        if let Command::Sweep(args) = cli.command {
            assert_eq!(args.grace_secs, Some(0));
            assert_eq!(args.limit, Some(10));
            assert!(args.no_orphans);
            assert!(args.staging);
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn verify_requires_a_digest() {
        assert!(Cli::try_parse_from(["vault", "verify"]).is_err());
        let cli = Cli::try_parse_from(["vault", "verify", HELLO, HELLO]).unwrap();
        if let Command::Verify(args) = cli.command {
            assert_eq!(args.digests.len(), 2);
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from([
            "vault", "--verbose", "--format", "json", "--root", "/srv/vault", "stats",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.root, Some(PathBuf::from("/srv/vault")));
        assert!(matches!(cli.command, Command::Stats));
    }

    #[test]
    fn parse_config_after_subcommand() {
        let cli = Cli::try_parse_from(["vault", "compact", "--config", "vault.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("vault.toml")));
    }
}
