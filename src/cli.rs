//! Interface de linha de comando do docpipe baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (submit, status,
//! cancel, resume, list, purge, providers) e flags globais
//! (--config, --data-dir, --max-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// docpipe: converte documentos em HTML estruturado com relatório de qualidade.
#[derive(Debug, Parser)]
#[command(name = "docpipe", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./docpipe.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Sobrescreve o diretório de dados da configuração.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Número máximo de tentativas por estágio.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete um documento e acompanha a conversão.
    Submit {
        /// Arquivo a converter (Markdown ou texto).
        file: PathBuf,

        /// Chave de idempotência; por padrão o digest do conteúdo.
        #[arg(long)]
        key: Option<String>,

        /// Identificador opaco de quem submeteu.
        #[arg(long)]
        owner: Option<String>,

        /// Apenas enfileira o job, sem executá-lo.
        #[arg(long, default_value_t = false)]
        detach: bool,
    },

    /// Mostra o status e o registro de auditoria de um job.
    Status {
        job_id: String,
    },

    /// Solicita o cancelamento de um job.
    Cancel {
        job_id: String,
    },

    /// Retoma todos os jobs não terminados.
    Resume,

    /// Lista os jobs conhecidos.
    List,

    /// Remove artefatos de jobs terminados mais antigos que a retenção.
    Purge {
        /// Retenção em horas; por padrão a da configuração.
        #[arg(long)]
        older_than_hours: Option<u64>,
    },

    /// Mostra os provedores de análise configurados.
    Providers,
}
