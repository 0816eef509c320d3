//! Interface de linha de comando do jobsite baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, batch, submit,
//! list, approve, accept, complete, watch, purge) e flags globais
//! (--config, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::job::{JobSubmission, Script};

/// jobsite: workspaces isolados, execução supervisionada e inbox de aprovação.
#[derive(Debug, Parser)]
#[command(name = "jobsite", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./jobsite.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um job de forma síncrona e mostra o resultado.
    Run(RunArgs),

    /// Executa um lote de jobs descrito em um arquivo JSON.
    Batch {
        /// Arquivo com um array JSON de submissões.
        file: PathBuf,
    },

    /// Deposita um job na inbox de um participante.
    Submit {
        /// Participante que vai revisar o job.
        #[arg(long)]
        to: String,

        /// Nome do job (único na inbox).
        #[arg(long)]
        name: String,

        /// Script a ser depositado como `run.sh`.
        #[arg(long)]
        script_file: PathBuf,
    },

    /// Lista os jobs de aprovação da identidade configurada.
    List,

    /// Libera um job da inbox para execução.
    Approve {
        name: String,
    },

    /// Aceita um job da inbox depositando o arquivo de resultado.
    Accept {
        name: String,
        result: PathBuf,
    },

    /// Conclui um job aprovado depositando o arquivo de resultado.
    Complete {
        name: String,
        result: PathBuf,
    },

    /// Monitora a inbox até Ctrl-C.
    Watch {
        /// Intervalo de varredura em segundos.
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Limpa todos os estágios antes de começar.
        #[arg(long, default_value_t = false)]
        reset: bool,
    },

    /// Remove todos os workspaces do diretório de jobs.
    Purge,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Nome do job.
    #[arg(long)]
    pub name: String,

    /// Referência ao código (caminho local, file:// ou http(s)://).
    #[arg(long)]
    pub code: String,

    /// Script inline.
    #[arg(long, conflicts_with = "script_file", required_unless_present = "script_file")]
    pub script: Option<String>,

    /// Caminho do script (relativo ao diretório de código se não existir como dado).
    #[arg(long)]
    pub script_file: Option<PathBuf>,

    /// Entrada no formato NOME=REFERÊNCIA (repetível).
    #[arg(long = "input", value_parser = parse_key_val)]
    pub inputs: Vec<(String, String)>,

    /// Variável de ambiente extra no formato NOME=VALOR (repetível).
    #[arg(long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Local onde os artefatos são publicados.
    #[arg(long)]
    pub output: Option<String>,

    /// Timeout em segundos.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Tag livre (repetível).
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Descrição do job.
    #[arg(long)]
    pub description: Option<String>,

    /// Mantém o workspace após a execução.
    #[arg(long, default_value_t = false)]
    pub keep: bool,
}

impl RunArgs {
    /// Converte os argumentos em uma submissão.
    pub fn into_submission(self) -> JobSubmission {
        let script = match (self.script, self.script_file) {
            (Some(text), _) => Script::Inline(text),
            (None, Some(path)) => Script::File(path),
            // clap garante um dos dois.
            (None, None) => Script::Inline(String::new()),
        };
        let mut submission = JobSubmission::new(self.name, self.code, script);
        submission.description = self.description;
        submission.inputs = self.inputs.into_iter().collect();
        submission.env = self.env.into_iter().collect();
        submission.output_ref = self.output;
        submission.timeout_secs = self.timeout;
        submission.tags = self.tags;
        submission
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {raw:?}")),
    }
}
