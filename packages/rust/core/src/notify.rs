//! Email summary of a run.

use std::fmt::Write as _;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use papermonitor_shared::{AssessedPaper, EmailSettings, PaperMonitorError, Result, RunStats};
use tracing::{debug, info};

/// Post-run notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, relevant: &[AssessedPaper], stats: &RunStats) -> Result<()>;
}

/// Sends a plain-text summary over SMTP.
#[derive(Debug, Clone)]
pub struct EmailNotifier {
    server: String,
    port: u16,
    use_tls: bool,
    credentials: Option<(String, String)>,
    sender: Mailbox,
    recipients: Vec<Mailbox>,
    subject_prefix: String,
}

impl EmailNotifier {
    /// Validate `notifications.email`; any missing address is a config error.
    pub fn from_settings(settings: &EmailSettings) -> Result<Self> {
        let server = settings
            .smtp_server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PaperMonitorError::config("`notifications.email.smtp_server` is required")
            })?;
        let sender = settings
            .sender
            .as_deref()
            .ok_or_else(|| PaperMonitorError::config("`notifications.email.sender` is required"))
            .and_then(|s| parse_mailbox("sender", s))?;
        if settings.recipients.is_empty() {
            return Err(PaperMonitorError::config(
                "`notifications.email.recipients` must list at least one address",
            ));
        }
        let recipients = settings
            .recipients
            .iter()
            .map(|r| parse_mailbox("recipients", r))
            .collect::<Result<Vec<_>>>()?;

        let credentials = match (&settings.username, &settings.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Ok(Self {
            server: server.to_string(),
            port: settings.smtp_port,
            use_tls: settings.use_tls,
            credentials,
            sender,
            recipients,
            subject_prefix: settings.subject_prefix.clone(),
        })
    }

    pub fn subject(&self, relevant: &[AssessedPaper], stats: &RunStats) -> String {
        let date = stats.started_at.format("%Y-%m-%d");
        let noun = if relevant.len() == 1 { "paper" } else { "papers" };
        format!(
            "{} {} relevant {noun} ({date})",
            self.subject_prefix,
            relevant.len()
        )
    }

    /// Build the message without sending it.
    pub fn compose(&self, relevant: &[AssessedPaper], stats: &RunStats) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(self.subject(relevant, stats))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        builder
            .body(summary_text(relevant, stats))
            .map_err(|e| PaperMonitorError::Delivery(format!("failed to build email: {e}")))
    }

    fn transport(&self) -> Result<SmtpTransport> {
        let builder = if self.use_tls {
            SmtpTransport::starttls_relay(&self.server).map_err(|e| {
                PaperMonitorError::Delivery(format!("invalid SMTP relay {}: {e}", self.server))
            })?
        } else {
            SmtpTransport::builder_dangerous(&self.server)
        };
        let builder = builder.port(self.port);
        let builder = match &self.credentials {
            Some((user, pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            None => builder,
        };
        Ok(builder.build())
    }
}

fn parse_mailbox(field: &str, raw: &str) -> Result<Mailbox> {
    raw.trim().parse::<Mailbox>().map_err(|e| {
        PaperMonitorError::config(format!(
            "invalid address {raw:?} in `notifications.email.{field}`: {e}"
        ))
    })
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, relevant: &[AssessedPaper], stats: &RunStats) -> Result<()> {
        let message = self.compose(relevant, stats)?;
        let transport = self.transport()?;
        debug!(server = %self.server, port = self.port, "sending email summary");

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| PaperMonitorError::Delivery(format!("email task failed: {e}")))?
            .map_err(|e| PaperMonitorError::Delivery(format!("SMTP send failed: {e}")))?;

        info!(recipients = self.recipients.len(), "email summary sent");
        Ok(())
    }
}

/// Plain-text body: run statistics followed by the relevant papers.
pub fn summary_text(relevant: &[AssessedPaper], stats: &RunStats) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "papermonitor run {} ({} method)",
        stats.run_id, stats.method
    );
    let _ = writeln!(
        out,
        "Started {}",
        stats.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "{} fetched, {} relevant\n",
        stats.total_fetched,
        relevant.len()
    );

    let _ = writeln!(out, "Sources:");
    for source in &stats.sources {
        match &source.error {
            Some(error) => {
                let _ = writeln!(out, "  {}: FAILED ({error})", source.name);
            }
            None => {
                let _ = writeln!(
                    out,
                    "  {}: {} papers in the last {} day(s)",
                    source.name, source.fetched, source.window.days
                );
            }
        }
    }
    if stats.degraded_assessments > 0 {
        let _ = writeln!(
            out,
            "\nWarning: {} paper(s) could not be assessed and were treated as not relevant.",
            stats.degraded_assessments
        );
    }

    if relevant.is_empty() {
        let _ = writeln!(out, "\nNo relevant papers this run.");
        return out;
    }

    let _ = writeln!(out, "\nRelevant papers:");
    for (i, item) in relevant.iter().enumerate() {
        let paper = &item.paper;
        let _ = writeln!(out, "\n{}. {}", i + 1, paper.title);
        let _ = writeln!(out, "   {} | {}", paper.source, paper.id);
        let _ = writeln!(out, "   {}", paper.link);
        if let Some(explanation) = &item.assessment.explanation {
            let _ = writeln!(out, "   {explanation}");
        }
    }
    out
}
