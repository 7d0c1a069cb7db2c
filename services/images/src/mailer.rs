use crate::config::MailConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{info, instrument, warn};

/// One outgoing email, built per message and never shared between
/// invocations
#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub subject: String,
    pub html_body: String,
    pub to: Vec<String>,
    pub from: String,
}

/// Fixed sender and recipients of service mail
#[derive(Debug, Clone, PartialEq)]
pub struct Recipients {
    pub from: String,
    pub to: Vec<String>,
}

impl Recipients {
    pub fn new(from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            from: from.into(),
            to,
        }
    }

    pub fn from_config(config: &MailConfig) -> Self {
        Self::new(config.from.clone(), config.to.clone())
    }

    /// Build an email whose body is a single paragraph of text
    pub fn email(&self, subject: impl Into<String>, text: &str) -> Email {
        Email {
            subject: subject.into(),
            html_body: html_paragraph(text),
            to: self.to.clone(),
            from: self.from.clone(),
        }
    }
}

/// Outgoing mail
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}

/// SMTP mailer. Without an SMTP host it only logs what it would send.
pub struct SmtpMailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let transport = if config.smtp_host.trim().is_empty() {
            warn!("SMTP host not configured; mailer will only log messages");
            None
        } else {
            let builder = if config.use_starttls {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            }
            .context("Failed to configure SMTP transport")?
            .port(config.smtp_port);

            let builder = if let (Some(username), Some(password)) =
                (&config.smtp_username, &config.smtp_password)
            {
                builder.credentials(Credentials::new(username.to_string(), password.to_string()))
            } else {
                builder
            };

            Some(builder.build())
        };

        Ok(Self { transport })
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[instrument(skip_all, fields(subject = %email.subject))]
    async fn send(&self, email: &Email) -> Result<()> {
        let Some(transport) = &self.transport else {
            info!(to = ?email.to, "Mailer in log-only mode; skipping actual send");
            return Ok(());
        };

        let from = email
            .from
            .parse::<Mailbox>()
            .context("Invalid sender address")?;
        let mut builder = Message::builder().from(from).subject(email.subject.as_str());
        for recipient in &email.to {
            builder = builder.to(recipient
                .parse::<Mailbox>()
                .with_context(|| format!("Invalid recipient address '{}'", recipient))?);
        }

        let message = builder
            .header(header::ContentType::TEXT_HTML)
            .body(email.html_body.clone())
            .context("Failed to build email message")?;

        transport
            .send(message)
            .await
            .context("Failed to send email")?;

        info!("Email sent");
        Ok(())
    }
}

/// Wrap text in the HTML body used by every service mail
pub fn html_paragraph(text: &str) -> String {
    format!(
        "<html>\n  <body>\n    <p style=\"font-size:18px\">{}</p>\n  </body>\n</html>\n",
        escape_html(text)
    )
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_is_built_per_call() {
        let recipients = Recipients::new("images@example.com", vec!["ops@example.com".to_string()]);
        let first = recipients.email("Image Inserted", "Your image: a.jpg has been inserted.");
        let second = recipients.email("Image Deleted", "Your image: b.jpg has been deleted.");

        assert_eq!(first.subject, "Image Inserted");
        assert!(first.html_body.contains("a.jpg"));
        assert_eq!(second.subject, "Image Deleted");
        assert!(second.html_body.contains("b.jpg"));
        assert_eq!(first.to, vec!["ops@example.com"]);
    }

    #[test]
    fn test_keys_are_escaped() {
        let body = html_paragraph("<script>&\"x\"");
        assert!(body.contains("&lt;script&gt;&amp;&quot;x&quot;"));
        assert!(!body.contains("<script>"));
    }

    #[tokio::test]
    async fn test_log_only_mode() {
        let mailer = SmtpMailer::new(&MailConfig::default()).unwrap();
        assert!(!mailer.is_enabled());

        let email = Recipients::new("images@localhost", vec![]).email("Image Rejected", "x");
        tokio_test::assert_ok!(mailer.send(&email).await);
    }
}
