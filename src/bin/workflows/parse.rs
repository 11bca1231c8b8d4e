use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Build OS variant images and manage atomic deployments
#[derive(Parser, Debug)]
#[command(name = "atomic-builder")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Project root holding variants/, templates/ and overlay/
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Settings file (default: $ATOMIC_BUILDER_CONFIG or <root>/atomic-builder.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Build one or more variants
    Build {
        /// Push each variant after it is built
        #[arg(long)]
        push: bool,

        /// Rebuild every layer
        #[arg(long)]
        no_cache: bool,

        #[arg(value_name = "VARIANT", required = true)]
        variants: Vec<String>,
    },

    /// Print variant fingerprints
    Hash {
        /// Show every piece of the fingerprint
        #[arg(long)]
        debug: bool,

        #[arg(value_name = "VARIANT", required = true)]
        variants: Vec<String>,
    },

    /// Output the JSON representation of the build config
    Config {
        /// Indent the output
        #[arg(short, long)]
        pretty: bool,
    },

    /// List every buildable variant
    Variants,

    /// Push built variants with their version tags
    Push {
        #[arg(value_name = "TAG", required = true)]
        tags: Vec<String>,
    },

    /// Fingerprint of the builder sources, base62 encoded
    HashBuilder {
        #[arg(long)]
        no_newline: bool,
    },

    /// Show every deployment
    Status,

    /// Disk usage per deployment
    Du,

    /// Show what an upgrade would change
    Check,

    /// Rebuild the local Systemfile and deploy it
    Upgrade,

    /// Remove old commits and unused images
    Prune,

    /// Remove a deployment
    Undeploy {
        /// Deployment index; negative values count from the end
        #[arg(allow_negative_numbers = true)]
        index: isize,
    },
}

impl Command {
    pub(crate) fn needs_root(&self) -> bool {
        matches!(
            self,
            Command::Build { .. }
                | Command::Push { .. }
                | Command::Du
                | Command::Check
                | Command::Upgrade
                | Command::Prune
                | Command::Undeploy { .. }
        )
    }
}
