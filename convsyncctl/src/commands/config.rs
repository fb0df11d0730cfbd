use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

use convsync_core::{
    load_or_create_run_config, load_run_config, save_run_config, RunConfiguration,
};

use crate::{render, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Mostra a configuração atual (senha mascarada)
    Show,
    /// Define o email e a senha de login
    SetCreds { email: String, password: String },
    /// Define a URL da API de armazenamento
    SetApi { url: String },
    /// Define o número máximo de conversas por execução
    SetMaxConvs { value: u32 },
    /// Define o número máximo de páginas no modo inteligente
    SetMaxPages { value: u32 },
    /// Altera um timeout pelo nome (milissegundos)
    SetTimeout { name: String, millis: u64 },
    /// Altera um seletor CSS pelo nome
    SetSelector { name: String, selector: String },
    /// Lista todos os timeouts
    ListTimeouts,
    /// Lista todos os seletores
    ListSelectors,
    /// Restaura a configuração padrão
    Reset,
    /// Imprime a configuração sem máscara, pronta para importação
    Export,
    /// Substitui a configuração pelo conteúdo de outro arquivo
    Import { path: PathBuf },
}

/// Editor output. `message` says what changed; `config` is always masked.
#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub path: PathBuf,
    pub created: bool,
    pub message: Option<String>,
    pub config: serde_json::Value,
    #[serde(skip)]
    listing: Option<Listing>,
}

#[derive(Debug)]
enum Listing {
    Timeouts(Vec<(String, u64)>),
    Selectors(Vec<(String, String)>),
}

impl ConfigReport {
    fn new(path: &Path, created: bool, config: &RunConfiguration, message: Option<String>) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            created,
            message,
            config: masked(config)?,
            listing: None,
        })
    }
}

impl DisplayFallback for ConfigReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        if self.created {
            lines.push(format!("Configuração criada em {}", self.path.display()));
        }
        if let Some(message) = &self.message {
            lines.push(message.clone());
        }
        match &self.listing {
            Some(Listing::Timeouts(entries)) => {
                lines.push("Timeouts:".to_string());
                for (name, millis) in entries {
                    lines.push(format!("  {name}: {millis}ms"));
                }
            }
            Some(Listing::Selectors(entries)) => {
                lines.push("Seletores:".to_string());
                for (name, selector) in entries {
                    lines.push(format!("  {name}:"));
                    lines.push(format!("    {selector}"));
                }
            }
            None => {
                let rendered = serde_json::to_string_pretty(&self.config)
                    .unwrap_or_else(|_| self.config.to_string());
                lines.push(rendered);
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ExportReport(RunConfiguration);

impl DisplayFallback for ExportReport {
    fn display(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_default()
    }
}

fn masked(config: &RunConfiguration) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(password) = value.get_mut("password") {
        if let Some(raw) = password.as_str() {
            *password = serde_json::Value::String(mask(raw));
        }
    }
    Ok(value)
}

pub fn mask(secret: &str) -> String {
    "*".repeat(secret.chars().count())
}

pub fn execute(path: &Path, command: &ConfigCommands, format: OutputFormat) -> Result<()> {
    if let ConfigCommands::Export = command {
        let (config, _) = load_or_create_run_config(path)?;
        return render(&ExportReport(config), format);
    }
    let report = apply(path, command)?;
    render(&report, format)
}

/// Applies one editor command to the file at `path`, creating it with the
/// defaults first when missing.
pub fn apply(path: &Path, command: &ConfigCommands) -> Result<ConfigReport> {
    let (mut config, created) = load_or_create_run_config(path)?;
    let message = match command {
        ConfigCommands::Show | ConfigCommands::Export => None,
        ConfigCommands::SetCreds { email, password } => {
            config.email = email.clone();
            config.password = password.clone();
            save_run_config(path, &config)?;
            Some(format!(
                "Credenciais atualizadas (email: {email}, senha: {})",
                mask(password)
            ))
        }
        ConfigCommands::SetApi { url } => {
            url::Url::parse(url).map_err(|err| {
                convsync_core::ConfigError::Invalid(format!("`{url}` is not a valid URL: {err}"))
            })?;
            config.api_url = url.clone();
            save_run_config(path, &config)?;
            Some(format!("API URL: {url}"))
        }
        ConfigCommands::SetMaxConvs { value } => {
            if *value == 0 {
                return Err(AppError::Config(convsync_core::ConfigError::Invalid(
                    "maxConversations must be at least 1".to_string(),
                )));
            }
            config.max_conversations = *value;
            save_run_config(path, &config)?;
            Some(format!("Máximo de conversas: {value}"))
        }
        ConfigCommands::SetMaxPages { value } => {
            if *value == 0 {
                return Err(AppError::Config(convsync_core::ConfigError::Invalid(
                    "maxPages must be at least 1".to_string(),
                )));
            }
            config.max_pages = Some(*value);
            save_run_config(path, &config)?;
            Some(format!("Máximo de páginas: {value}"))
        }
        ConfigCommands::SetTimeout { name, millis } => {
            config.timeouts.set(name, *millis)?;
            save_run_config(path, &config)?;
            Some(format!("Timeout '{name}': {millis}ms"))
        }
        ConfigCommands::SetSelector { name, selector } => {
            config.selectors.set(name, selector.clone())?;
            save_run_config(path, &config)?;
            Some(format!("Seletor '{name}': {selector}"))
        }
        ConfigCommands::ListTimeouts => {
            let mut report = ConfigReport::new(path, created, &config, None)?;
            report.listing = Some(Listing::Timeouts(
                config
                    .timeouts
                    .iter()
                    .map(|(name, millis)| (name.to_string(), millis))
                    .collect(),
            ));
            return Ok(report);
        }
        ConfigCommands::ListSelectors => {
            let mut report = ConfigReport::new(path, created, &config, None)?;
            report.listing = Some(Listing::Selectors(
                config
                    .selectors
                    .iter()
                    .map(|(name, selector)| (name.to_string(), selector.to_string()))
                    .collect(),
            ));
            return Ok(report);
        }
        ConfigCommands::Reset => {
            config = RunConfiguration::default();
            save_run_config(path, &config)?;
            Some("Configuração restaurada para os valores padrão".to_string())
        }
        ConfigCommands::Import { path: source } => {
            if !source.exists() {
                return Err(AppError::MissingResource(format!(
                    "arquivo inexistente: {}",
                    source.display()
                )));
            }
            config = load_run_config(source)?;
            save_run_config(path, &config)?;
            Some(format!("Configuração importada de {}", source.display()))
        }
    };
    ConfigReport::new(path, created, &config, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scraper-config.json");
        let report = apply(&path, &ConfigCommands::Show).unwrap();
        assert!(report.created);
        assert!(path.exists());
        assert_eq!(report.config["maxConversations"], 600);
    }

    #[test]
    fn credentials_are_saved_and_masked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scraper-config.json");
        let report = apply(
            &path,
            &ConfigCommands::SetCreds {
                email: "jean@example.nc".into(),
                password: "hunter2".into(),
            },
        )
        .unwrap();
        assert_eq!(report.config["password"], "*******");
        assert!(report.message.unwrap().contains("*******"));
        let stored = load_run_config(&path).unwrap();
        assert_eq!(stored.password, "hunter2");
        assert_eq!(stored.email, "jean@example.nc");
    }

    #[test]
    fn unknown_timeout_lists_known_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scraper-config.json");
        let err = apply(
            &path,
            &ConfigCommands::SetTimeout {
                name: "nope".into(),
                millis: 10,
            },
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("nope"));
        assert!(text.contains("modal"));
    }

    #[test]
    fn timeout_changes_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scraper-config.json");
        apply(
            &path,
            &ConfigCommands::SetTimeout {
                name: "loadMore".into(),
                millis: 2500,
            },
        )
        .unwrap();
        let stored = load_run_config(&path).unwrap();
        assert_eq!(stored.timeouts.get("loadMore"), Some(2500));
    }

    #[test]
    fn import_replaces_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scraper-config.json");
        let source = dir.path().join("other.json");
        std::fs::write(
            &source,
            r#"{"email": "marie@example.nc", "password": "x", "maxConversations": 40}"#,
        )
        .unwrap();
        apply(&path, &ConfigCommands::Import { path: source }).unwrap();
        let stored = load_run_config(&path).unwrap();
        assert_eq!(stored.email, "marie@example.nc");
        assert_eq!(stored.max_conversations, 40);
        assert!(stored.timeouts.get("modal").is_some());
    }

    #[test]
    fn subcommand_help_is_in_portuguese() {
        use clap::CommandFactory;
        let command = crate::Cli::command();
        let help = command
            .find_subcommand("config")
            .unwrap()
            .find_subcommand("set-timeout")
            .unwrap()
            .get_about()
            .unwrap()
            .to_string();
        assert_eq!(help, "Altera um timeout pelo nome (milissegundos)");
    }

    #[test]
    fn listing_renders_every_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scraper-config.json");
        let report = apply(&path, &ConfigCommands::ListTimeouts).unwrap();
        let text = report.display();
        assert!(text.contains("modal: 1500ms"));
        assert!(text.contains("navigation: 30000ms"));
    }
}
