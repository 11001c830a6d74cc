//! Implementation of the `foreman init` command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::adapters::sqlite::{initialize_database, PoolConfig};
use crate::cli::output::{output, CommandOutput};
use crate::infrastructure::config::{ConfigLoader, CONFIG_DIR};

/// Arguments for `foreman init`.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config.yaml with the defaults
    #[arg(long, short)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

/// Result of `foreman init`.
#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    /// Always `true`; failures take the error path.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Absolute project directory.
    pub initialized_path: PathBuf,
    /// Path of `config.yaml`.
    pub config_path: PathBuf,
    /// Whether `config.yaml` was (re)written.
    pub config_written: bool,
    /// Path of the SQLite database.
    pub database_path: PathBuf,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        if self.config_written {
            lines.push(format!("\nWrote default configuration to {}", self.config_path.display()));
        } else {
            lines.push(format!("\nKept existing configuration at {}", self.config_path.display()));
        }
        lines.push(format!("Database ready at {}", self.database_path.display()));
        lines.join("\n")
    }
}

/// Create the project directory, default config and database.
pub async fn execute(args: InitArgs, json_mode: bool) -> Result<()> {
    let target_path = if args.path.is_absolute() {
        args.path.clone()
    } else {
        std::env::current_dir().context("Failed to get current directory")?.join(&args.path)
    };

    let config_dir = target_path.join(CONFIG_DIR);
    fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let config_path = ConfigLoader::config_path(&config_dir);
    let already_initialized = config_path.exists();
    let config_written = args.force || !already_initialized;
    if config_written {
        fs::write(&config_path, ConfigLoader::default_yaml()?)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    let config = ConfigLoader::load_from_dir(&config_dir)?;
    let database_path = resolve_database_path(&target_path, &config.database.path);
    let db_url = format!("sqlite:{}", database_path.display());
    let pool = initialize_database(&db_url, Some(PoolConfig::with_max_connections(1)))
        .await
        .context("Failed to initialize database")?;
    pool.close().await;

    let message = match (already_initialized, args.force) {
        (false, _) => "Project initialized successfully.",
        (true, true) => "Project reinitialized with default configuration.",
        (true, false) => "Project already initialized; database migrations are up to date.",
    };

    output(
        &InitOutput {
            success: true,
            message: message.to_string(),
            initialized_path: target_path,
            config_path,
            config_written,
            database_path,
        },
        json_mode,
    );
    Ok(())
}

fn resolve_database_path(root: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_database_path() {
        let root = Path::new("/srv/project");
        assert_eq!(
            resolve_database_path(root, ".foreman/foreman.db"),
            PathBuf::from("/srv/project/.foreman/foreman.db")
        );
        assert_eq!(resolve_database_path(root, "/var/lib/foreman.db"), PathBuf::from("/var/lib/foreman.db"));
    }

    #[tokio::test]
    async fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let unset = [
            ("FOREMAN_DATABASE__PATH", None::<&str>),
            ("FOREMAN_LOGGING__LEVEL", None),
            ("FOREMAN_LOGGING__FORMAT", None),
        ];

        temp_env::async_with_vars(unset, async {
            execute(InitArgs { force: false, path: root.clone() }, true).await.unwrap();
            assert!(root.join(".foreman/config.yaml").exists());
            assert!(root.join(".foreman/foreman.db").exists());

            // A second run keeps the existing file.
            std::fs::write(root.join(".foreman/config.yaml"), "retry:\n  max_retries: 7\n").unwrap();
            execute(InitArgs { force: false, path: root.clone() }, true).await.unwrap();
            let kept = std::fs::read_to_string(root.join(".foreman/config.yaml")).unwrap();
            assert!(kept.contains("max_retries: 7"));
        })
        .await;
    }
}
