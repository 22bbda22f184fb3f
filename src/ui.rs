//! Interface de terminal do docpipe: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal recebendo os eventos do orquestrador.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::gateway::ProviderHealth;
use crate::observer::JobObserver;
use crate::state_machine::{AuditRecord, FailureRecord, Job, JobOutcome, JobStatus, Stage};

/// Indicador visual de progresso para a execução de jobs no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e retentativa (amarelo).
pub struct JobProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com a descrição do job.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("QUEUED: {description}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl JobObserver for JobProgress {
    fn on_stage_started(&self, job_id: &str, stage: Stage, attempt: u32) {
        let suffix = if attempt > 1 { format!(" (attempt {attempt})") } else { String::new() };
        self.pb.set_message(format!("{}: {}{suffix}", stage.status(), short_id(job_id)));
    }

    fn on_stage_advanced(&self, _job_id: &str, completed: Stage, _next: Stage, progress: u8) {
        self.pb.println(format!(
            "  {} {completed} done ({progress}%)",
            self.green.apply_to("✓")
        ));
    }

    fn on_retry_scheduled(&self, _job_id: &str, stage: Stage, next_attempt: u32, delay: Duration, reason: &str) {
        self.pb.println(format!(
            "  {} Retry {stage} #{next_attempt} in {}ms: {reason}",
            self.yellow.apply_to("↻"),
            delay.as_millis()
        ));
    }

    fn on_job_completed(&self, job: &Job) {
        self.pb.finish_and_clear();
        let quality = job
            .quality
            .as_ref()
            .map(|q| format!(", quality {:.1}", q.overall))
            .unwrap_or_default();
        println!("  {} Job {} completed{quality}", self.green.apply_to("✓"), job.id);
        if let Some(JobOutcome::Succeeded {
            degraded: Some(reason),
            ..
        }) = &job.outcome
        {
            println!("  {} {reason}", self.yellow.apply_to("!"));
        }
    }

    fn on_job_failed(&self, job: &Job, failure: &FailureRecord) {
        self.pb.finish_and_clear();
        println!("  {} Job {} failed: {failure}", self.red.apply_to("✗"), job.id);
    }
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

/// Imprime o registro de auditoria formatado em JSON com estilo colorido.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!("{}", status_style(record.status).apply_to("─── Audit Record ───"));
    println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
}

/// Uma linha por job: id, status, progresso e origem.
pub fn print_job_line(job: &Job) {
    println!(
        "{}  {:<12} {:>3}%  {}",
        job.id,
        status_style(job.status).apply_to(job.status.to_string()),
        job.progress,
        job.source_name
    );
}

pub fn print_providers(providers: &[ProviderHealth]) {
    for p in providers {
        let state = if !p.available {
            Style::new().dim().apply_to("unavailable")
        } else if p.down {
            Style::new().red().apply_to("down")
        } else {
            Style::new().green().apply_to("ok")
        };
        println!(
            "{:<16} {state}  calls={} failures={}",
            p.name, p.total_calls, p.total_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates_long_ids() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
