//! Configuração do docpipe carregada a partir de `docpipe.toml`.
//!
//! A struct [`PipelineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::GatewayConfig;
use crate::orchestrator::OrchestratorSettings;
use crate::scoring::ScoringConfig;
use crate::state_machine::{RetryConfig, StageSequence};

/// Arquivo lido quando nenhum caminho é informado.
pub const DEFAULT_CONFIG_FILE: &str = "docpipe.toml";

/// Configuração de nível superior carregada de `docpipe.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// Diretório com os registros de jobs e os artefatos.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Jobs executados em paralelo.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Tempo máximo de uma execução de estágio, em segundos.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Por quanto tempo os artefatos de jobs terminados são mantidos.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Sequência de estágios fixada em cada job novo.
    #[serde(default)]
    pub stages: StageSequence,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,
}

// Valor padrão para o diretório de dados: ".docpipe".
fn default_data_dir() -> PathBuf {
    PathBuf::from(".docpipe")
}

// Valor padrão para jobs paralelos: 4.
fn default_max_concurrent_jobs() -> usize {
    4
}

// Valor padrão para o timeout de estágio: 300s.
fn default_stage_timeout_secs() -> u64 {
    300
}

// Valor padrão para retenção: 7 dias.
fn default_retention_hours() -> u64 {
    168
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            data_dir: default_data_dir(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            stage_timeout_secs: default_stage_timeout_secs(),
            retention_hours: default_retention_hours(),
            stages: StageSequence::default(),
            retry: RetryConfig::default(),
            gateway: GatewayConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Carrega a configuração de `path`, ou de `docpipe.toml` no diretório
    /// atual. Usa valores padrão se o arquivo padrão não existir; um caminho
    /// explícito que não existe é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))?
        } else if explicit {
            bail!("config file {} not found", path.display());
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    /// Interpreta e valida o conteúdo TOML.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que o orquestrador não consegue executar.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if self.stage_timeout_secs == 0 {
            bail!("stage_timeout_secs must be at least 1");
        }
        if let Some(name) = self.scoring.weights.first_negative() {
            bail!("scoring weight `{name}` must not be negative");
        }
        if self.scoring.weights.sum() <= 0.0 {
            bail!("scoring weights must add up to more than zero");
        }
        if !(0.0..=1.0).contains(&self.gateway.min_confidence) {
            bail!("gateway.min_confidence must be between 0 and 1");
        }
        if let Some(name) = self.gateway.duplicate_provider_name() {
            bail!("gateway provider name `{name}` is used more than once");
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(i64::MAX as u64) as i64)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    /// Parâmetros de execução do orquestrador.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            retry: self.retry.clone(),
            stage_timeout: self.stage_timeout(),
            pipeline: self.stages.clone(),
            scoring: self.scoring.clone(),
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ProviderConfig;
    use crate::state_machine::Stage;

    #[test]
    fn default_config_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.data_dir, PathBuf::from(".docpipe"));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.stage_timeout(), Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.stages.stages(), &Stage::ALL);
        assert!(config.api_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "sk-test-123"
            max_concurrent_jobs = 2

            [retry]
            max_attempts = 5
        "#;
        let config = PipelineConfig::parse(toml_str).unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.stage_timeout_secs, 300);
        assert_eq!(config.gateway.providers.len(), 2);
    }

    #[test]
    fn deserialize_stages_and_providers() {
        let toml_str = r#"
            stages = ["convert", "extract", "structure", "generate"]

            [gateway]
            call_timeout_secs = 5

            [[gateway.providers]]
            kind = "heuristic"
            name = "local"
        "#;
        let config = PipelineConfig::parse(toml_str).unwrap();
        assert_eq!(config.stages.len(), 4);
        assert_eq!(config.stages.deliverable_stage(), Stage::Generate);
        assert_eq!(config.gateway.call_timeout_secs, 5);
        assert!(matches!(
            &config.gateway.providers[..],
            [ProviderConfig::Heuristic { name }] if name == "local"
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(PipelineConfig::parse("[retry]\nmax_attempts = 0").is_err());
        assert!(PipelineConfig::parse("max_concurrent_jobs = 0").is_err());
        assert!(PipelineConfig::parse(r#"stages = ["score", "convert"]"#).is_err());
        assert!(PipelineConfig::parse(r#"stages = []"#).is_err());
        assert!(PipelineConfig::parse("[gateway]\nmin_confidence = 1.5").is_err());
        assert!(PipelineConfig::parse("[scoring.weights]\nstructural_fidelity = -0.5\n").is_err());
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let toml_str = r#"
            [[gateway.providers]]
            kind = "anthropic"

            [[gateway.providers]]
            kind = "anthropic"
            model = "claude-haiku-4-5"
        "#;
        let err = PipelineConfig::parse(toml_str).unwrap_err();
        assert!(err.to_string().contains("anthropic"), "{err}");

        let renamed = r#"
            [[gateway.providers]]
            kind = "anthropic"

            [[gateway.providers]]
            kind = "anthropic"
            name = "anthropic-haiku"
        "#;
        assert!(PipelineConfig::parse(renamed).is_ok());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "data_dir = \"/tmp/docpipe-test\"\nretention_hours = 1\n").unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/docpipe-test"));
        assert_eq!(config.retention(), chrono::Duration::hours(1));
        assert_eq!(config.jobs_dir(), PathBuf::from("/tmp/docpipe-test/jobs"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        // No ambiente de teste, tipicamente não há docpipe.toml no diretório de trabalho.
        let config = PipelineConfig::load(None).unwrap();
        assert_eq!(config.max_concurrent_jobs, 4);
    }
}
