use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use convsync_core::{DEFAULT_CONFIG_FILE, DEFAULT_REGISTRY_PATH, DEFAULT_TARGET_URL};

pub mod commands;

use commands::config::ConfigCommands;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] convsync_core::ConfigError),
    #[error("browser error: {0}")]
    Browser(#[from] convsync_core::BrowserError),
    #[error("stats probe error: {0}")]
    Probe(#[from] convsync_core::ProbeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Sincroniza conversas de annonces.nc com a API de armazenamento",
    long_about = None
)]
pub struct Cli {
    /// Caminho do arquivo de configuração (JSON ou TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    pub config: PathBuf,
    /// Abre o navegador visível e aguarda Enter antes de fechá-lo
    #[arg(long)]
    pub headful: bool,
    /// Usa o Firefox em vez do Chromium
    #[arg(long)]
    pub firefox: bool,
    /// Força o modo completo, sem consultar o armazenamento
    #[arg(long, conflicts_with = "smart")]
    pub full: bool,
    /// Força o modo inteligente, mesmo com armazenamento vazio
    #[arg(long)]
    pub smart: bool,
    /// Página de conversas aberta no início da execução
    #[arg(long, default_value = DEFAULT_TARGET_URL)]
    pub target_url: String,
    /// Diretório contendo login.js e scraper.js
    #[arg(long, default_value = "scripts")]
    pub scripts_dir: PathBuf,
    /// Diretório onde capturas de erro são gravadas
    #[arg(long, default_value = "artifacts")]
    pub artifacts_dir: PathBuf,
    /// Diretório base dos perfis de navegador por execução
    #[arg(long, default_value = ".profiles")]
    pub profiles_dir: PathBuf,
    /// Registro de usuários usado para notificações Telegram
    #[arg(long, default_value = DEFAULT_REGISTRY_PATH)]
    pub registry: PathBuf,
    /// Executável do navegador (padrão: CONVSYNC_CHROME / CONVSYNC_FIREFOX)
    #[arg(long, env = "CONVSYNC_BROWSER")]
    pub browser_path: Option<PathBuf>,
    /// Formato de saída
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Edita o arquivo de configuração
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Runs the selected command and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Some(Commands::Config(command)) => {
            commands::config::execute(&cli.config, command, cli.format)?;
            Ok(0)
        }
        None => {
            let outcome = commands::harvest::execute(&cli).await;
            cleanup_temporary_config(&cli.config);
            let report = outcome?;
            render(&report, cli.format)?;
            Ok(if report.result.success { 0 } else { 1 })
        }
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Per-run configs written by the web front-end carry `temp` in their name.
pub fn is_temporary_config(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_lowercase().contains("temp"))
        .unwrap_or(false)
}

fn cleanup_temporary_config(path: &Path) {
    if !is_temporary_config(path) || !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "temporary config removed"),
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temporary config"),
    }
}

pub(crate) fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub(crate) trait DisplayFallback {
    fn display(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse_with_defaults() {
        let cli = Cli::try_parse_from(["convsync", "--config=config/temp_jean.json", "--headful"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("config/temp_jean.json"));
        assert!(cli.headful);
        assert!(!cli.firefox);
        assert_eq!(cli.target_url, DEFAULT_TARGET_URL);
        assert_eq!(cli.registry, PathBuf::from(DEFAULT_REGISTRY_PATH));
        assert!(cli.command.is_none());
    }

    #[test]
    fn full_and_smart_conflict() {
        assert!(Cli::try_parse_from(["convsync", "--full", "--smart"]).is_err());
        assert!(Cli::try_parse_from(["convsync", "--full", "--firefox"]).is_ok());
    }

    #[test]
    fn config_subcommand_takes_global_config() {
        let cli = Cli::try_parse_from([
            "convsync",
            "config",
            "set-timeout",
            "modal",
            "2500",
            "--config",
            "other.json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.json"));
        assert!(matches!(
            cli.command,
            Some(Commands::Config(ConfigCommands::SetTimeout { ref name, millis: 2500 })) if name == "modal"
        ));
    }

    #[test]
    fn temporary_configs_are_detected_by_name() {
        assert!(is_temporary_config(Path::new("config/temp_jean.json")));
        assert!(is_temporary_config(Path::new("/tmp/run-TEMP.toml")));
        assert!(!is_temporary_config(Path::new("scraper-config.json")));
        assert!(!is_temporary_config(Path::new("temp/scraper-config.json")));
    }

    #[test]
    fn temporary_config_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_run.json");
        let kept = dir.path().join("scraper-config.json");
        std::fs::write(&temp, "{}").unwrap();
        std::fs::write(&kept, "{}").unwrap();
        cleanup_temporary_config(&temp);
        cleanup_temporary_config(&kept);
        assert!(!temp.exists());
        assert!(kept.exists());
    }
}
