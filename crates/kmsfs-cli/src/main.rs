mod cli;
mod config;
mod files;
mod storage;

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::{eyre::bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point wiring the CLI to the decrypting file store.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let mut stdout = io::stdout().lock();
    run(cli, &config, &mut stdout).await
}

async fn run(cli: cli::Cli, config: &config::Config, out: &mut impl Write) -> Result<()> {
    match cli.command {
        Command::Version => print_version(out)?,
        Command::Config(ConfigCommand::Init) => init_config(config, out)?,
        command => {
            let root = storage::resolve_root(cli.root.as_deref(), config)?;
            let service = storage::key_service(config)?;
            run_with_store(command, root, service, out).await?
        }
    }
    Ok(())
}

async fn run_with_store(
    command: Command,
    root: PathBuf,
    service: Arc<dyn storage::KeyService>,
    out: &mut impl Write,
) -> Result<()> {
    if let Command::Seal {
        source,
        key,
        out: dir,
        name,
    } = command
    {
        let dir = files::seal_dir(dir, &root);
        let pair = files::seal(service.as_ref(), &source, &key, &dir, name.as_deref()).await?;
        writeln!(out, "{}", pair.ciphertext.display())?;
        writeln!(out, "{}", pair.keyname.display())?;
        return Ok(());
    }

    let store = storage::encrypted_store(root, service);
    match command {
        Command::Ls { path } => files::list(&store, &path, out).await?,
        Command::Cat { path } => files::cat(&store, &path, out).await?,
        Command::Key { path } => files::key(&store, &path, out).await?,
        Command::Check { path, recursive } => {
            let problems = files::check(store.inner(), &path, recursive).await?;
            for problem in &problems {
                writeln!(out, "{problem}")?;
            }
            if !problems.is_empty() {
                bail!("{} problem(s) found", problems.len());
            }
            writeln!(out, "ok")?;
        }
        other => bail!("{other:?} does not read from the store"),
    }
    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters; logs go to stderr so `cat` output stays clean.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version(out: &mut impl Write) -> Result<()> {
    writeln!(out, "kmsfs {}", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}

fn init_config(config: &config::Config, out: &mut impl Write) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    writeln!(out, "Config initialized at {}", path.display())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kmsfs_core::kms::KeyReference;

    use super::*;

    fn key() -> KeyReference {
        KeyReference::new("p", "global", "ring", "k")
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).expect("utf8")
    }

    #[tokio::test]
    async fn version_prints_package_version() {
        let cli = cli::Cli::try_parse_from(["kmsfs", "version"]).expect("parse");
        let mut buf = Vec::new();
        run(cli, &config::Config::default(), &mut buf).await.expect("run");
        assert_eq!(output(buf), format!("kmsfs {}\n", env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn sealed_files_list_and_cat_from_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("db.env");
        fs::write(&source, b"PASSWORD=hunter2\n").expect("write");
        let service = storage::test_service();

        let seal = Command::Seal {
            source,
            key: key(),
            out: None,
            name: None,
        };
        let mut buf = Vec::new();
        run_with_store(seal, dir.path().join("vault"), service.clone(), &mut buf)
            .await
            .expect("seal");
        assert!(output(buf).contains("db.env.encrypted"));

        let mut buf = Vec::new();
        let ls = Command::Ls { path: String::new() };
        run_with_store(ls, dir.path().join("vault"), service.clone(), &mut buf)
            .await
            .expect("ls");
        assert_eq!(output(buf), "db.env.encrypted\n");

        let mut buf = Vec::new();
        let cat = Command::Cat {
            path: "db.env.encrypted".into(),
        };
        run_with_store(cat, dir.path().join("vault"), service.clone(), &mut buf)
            .await
            .expect("cat");
        assert_eq!(buf, b"PASSWORD=hunter2\n");

        let mut buf = Vec::new();
        let check = Command::Check {
            path: String::new(),
            recursive: true,
        };
        run_with_store(check, dir.path().join("vault"), service, &mut buf)
            .await
            .expect("check");
        assert_eq!(output(buf), "ok\n");
    }

    #[tokio::test]
    async fn check_fails_on_unpaired_ciphertext() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("orphan.encrypted"), b"x").expect("write");

        let mut buf = Vec::new();
        let check = Command::Check {
            path: String::new(),
            recursive: false,
        };
        let err = run_with_store(check, dir.path().to_path_buf(), storage::test_service(), &mut buf)
            .await
            .expect_err("problems");
        assert!(err.to_string().contains("1 problem"));
        assert!(output(buf).contains("orphan.encrypted"));
    }
}
