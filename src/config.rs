//! Configuração do jobsite carregada a partir de `jobsite.toml`.
//!
//! A struct [`JobsiteConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis `JOBSITE_JOB_DIR`, `JOBSITE_DATA_DIR` e `JOBSITE_IDENTITY`
//! têm precedência sobre o arquivo.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::approval::ApprovalStore;
use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::job::check_label;

/// Nome do arquivo procurado no diretório atual quando `--config` não é passado.
pub const DEFAULT_CONFIG_FILE: &str = "jobsite.toml";

/// Configuração de nível superior carregada de `jobsite.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsiteConfig {
    /// Diretório onde cada job recebe seu workspace isolado.
    #[serde(default = "default_job_dir")]
    pub job_dir: PathBuf,

    /// Número máximo de jobs executando em paralelo.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Remove o workspace depois que o resultado é registrado.
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,

    /// Timeout em segundos para jobs que não declaram o seu.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Espera entre SIGTERM e SIGKILL ao cancelar, em milissegundos.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Limite opcional de jobs aguardando um worker.
    #[serde(default)]
    pub max_pending: Option<usize>,

    /// Raiz dos diretórios de aprovação dos participantes.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Identidade registrada como autora dos jobs submetidos.
    #[serde(default = "default_identity")]
    pub identity: String,

    /// Intervalo de varredura da inbox em segundos.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_job_dir() -> PathBuf {
    PathBuf::from("./jobs")
}

fn default_max_workers() -> usize {
    4
}

fn default_cleanup() -> bool {
    true
}

// 5 minutos.
fn default_timeout_secs() -> u64 {
    300
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_identity() -> String {
    "local".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for JobsiteConfig {
    fn default() -> Self {
        Self {
            job_dir: default_job_dir(),
            max_workers: default_max_workers(),
            cleanup: default_cleanup(),
            default_timeout_secs: default_timeout_secs(),
            grace_period_ms: default_grace_period_ms(),
            max_pending: None,
            data_dir: default_data_dir(),
            identity: default_identity(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl JobsiteConfig {
    /// Carrega a configuração.
    ///
    /// Sem `explicit`, lê `jobsite.toml` do diretório atual e usa os valores
    /// padrão se o arquivo não existir. Um caminho explícito inexistente é erro.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(dir) = set("JOBSITE_JOB_DIR") {
            self.job_dir = PathBuf::from(dir);
        }
        if let Some(dir) = set("JOBSITE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(identity) = set("JOBSITE_IDENTITY") {
            self.identity = identity;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        check_label(&self.identity)
            .map_err(|_| ConfigError::Invalid(format!("identity {:?} is not a valid name", self.identity)))
    }

    /// Parâmetros do motor de execução derivados desta configuração.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            job_dir: self.job_dir.clone(),
            max_workers: self.max_workers,
            cleanup: self.cleanup,
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            grace_period: Duration::from_millis(self.grace_period_ms),
            max_pending: self.max_pending,
        }
    }

    /// Store de aprovação enraizado em `data_dir`, agindo como `identity`.
    pub fn approval_store(&self) -> ApprovalStore {
        ApprovalStore::new(&self.data_dir, &self.identity)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
