//! Interface de terminal do jobsite: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::approval::{ApprovalEntry, NewJob, Stage};
use crate::job::{JobResult, JobStatus};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner animado enquanto o job roda e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e cancelamento (amarelo).
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com o nome do job.
    pub fn start(name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("RUNNING: {name}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Finaliza o spinner e exibe o resultado final do job.
    pub fn complete(&self, result: &JobResult) {
        self.pb.finish_and_clear();
        print_summary(result, &self.green, &self.red, &self.yellow);
    }
}

fn status_style<'a>(status: JobStatus, green: &'a Style, red: &'a Style, yellow: &'a Style) -> &'a Style {
    match status {
        JobStatus::Completed => green,
        JobStatus::Failed => red,
        _ => yellow,
    }
}

fn print_summary(result: &JobResult, green: &Style, red: &Style, yellow: &Style) {
    let style = status_style(result.status, green, red, yellow);
    let mark = match result.status {
        JobStatus::Completed => "✓",
        JobStatus::Failed => "✗",
        _ => "■",
    };
    let duration = result
        .duration_ms
        .map(|ms| format!(" in {:.1}s", ms as f64 / 1000.0))
        .unwrap_or_default();
    println!(
        "  {} {} {}{duration}",
        style.apply_to(mark),
        result.name,
        style.apply_to(result.status)
    );
    if let Some(error) = &result.error {
        println!("    {}", red.apply_to(error));
    }
    for artifact in &result.artifacts {
        println!("    → {}", artifact.display());
    }
}

/// Imprime a saída capturada e o registro completo em JSON.
pub fn print_result(result: &JobResult, verbose: bool) {
    if !result.stdout.is_empty() {
        println!("{}", Style::new().dim().apply_to("─── stdout ───"));
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        println!("{}", Style::new().dim().apply_to("─── stderr ───"));
        print!("{}", result.stderr);
    }
    if verbose {
        println!();
        println!("{}", Style::new().cyan().apply_to("─── Job Result ───"));
        println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
    }
}

/// Resumo de um lote, na ordem de submissão.
pub fn print_batch(results: &[Result<JobResult, String>]) {
    let (green, red, yellow) = (Style::new().green().bold(), Style::new().red().bold(), Style::new().yellow());
    for (index, result) in results.iter().enumerate() {
        print!("{:>3}. ", index + 1);
        match result {
            Ok(result) => print_summary(result, &green, &red, &yellow),
            Err(err) => println!("{} {err}", red.apply_to("rejected:")),
        }
    }
}

/// Lista as entradas de aprovação agrupadas por estágio.
pub fn print_entries(owner: &str, entries: &[ApprovalEntry]) {
    println!("{}", Style::new().bold().apply_to(format!("Jobs for {owner}")));
    if entries.is_empty() {
        println!("  (no jobs)");
        return;
    }
    for entry in entries {
        let style = match entry.stage {
            Stage::Inbox => Style::new().yellow(),
            Stage::Approved => Style::new().cyan(),
            Stage::Done => Style::new().green(),
        };
        println!(
            "  {:<10} {:<32} submitted by {}",
            style.apply_to(entry.stage),
            entry.name,
            entry.submitted_by
        );
    }
}

/// Anuncia um job novo detectado na inbox com a prévia do script.
pub fn print_new_job(job: &NewJob) {
    println!();
    println!("{} {}", Style::new().yellow().bold().apply_to("NEW JOB:"), job.name);
    println!("  location: {}", job.location.display());
    if !job.preview.is_empty() {
        println!("  script preview:");
        for (i, line) in job.preview.iter().enumerate() {
            println!("    {}: {line}", i + 1);
        }
        if job.truncated {
            println!("    ...");
        }
    }
    println!("{}", "-".repeat(50));
}
