use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kmsfs_core::kms::KeyReference;

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "kmsfs",
    about = "Browse and read files sealed with KMS keys",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Directory to serve; overrides `root` from the config file.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List a directory, showing subdirectories and decryptable files only.
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Write the decrypted content of an encrypted file to stdout.
    Cat { path: String },
    /// Show the key an encrypted file is sealed with.
    Key { path: String },
    /// Report ciphertext without key name files and unparseable key name files.
    Check {
        #[arg(default_value = "")]
        path: String,
        /// Descend into subdirectories.
        #[arg(short, long)]
        recursive: bool,
    },
    /// Encrypt a plaintext file and write the `.encrypted`/`.keyname` pair.
    Seal {
        /// Plaintext file to encrypt.
        source: PathBuf,
        /// Key to encrypt with, e.g. projects/p/locations/global/keyRings/r/cryptoKeys/k.
        #[arg(long)]
        key: KeyReference,
        /// Output directory (defaults to the served root).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Base name of the pair (defaults to the source file name).
        #[arg(long)]
        name: Option<String>,
    },
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
