use crate::config::EmailConfig;
use crate::types::{BodyFormat, DigestError, NotificationChannel, RenderedDigest, Result, SmtpTls};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

const CHANNEL: &str = "email";

/// Sends the digest as a multipart (plain text + HTML) message over SMTP.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    recipient: Mailbox,
}

impl EmailChannel {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let sender: Mailbox = config
            .sender
            .parse()
            .map_err(|e| DigestError::config(format!("EMAIL_SENDER is not a valid address: {}", e)))?;
        let recipient: Mailbox = config
            .recipient
            .parse()
            .map_err(|e| DigestError::config(format!("EMAIL_RECIPIENT is not a valid address: {}", e)))?;

        let builder = match config.tls {
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| DigestError::config(format!("invalid SMTP relay {}: {}", config.smtp_host, e)))?,
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| DigestError::config(format!("invalid SMTP relay {}: {}", config.smtp_host, e)))?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host),
        };

        let mut builder = builder.port(config.smtp_port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            sender,
            recipient,
        })
    }

    pub fn build_message(&self, rendered: &RenderedDigest) -> Result<Message> {
        let text = body(rendered, BodyFormat::PlainText)?;
        let html = body(rendered, BodyFormat::Html)?;

        Message::builder()
            .from(self.sender.clone())
            .to(self.recipient.clone())
            .subject(rendered.subject.as_str())
            .multipart(MultiPart::alternative_plain_html(text.to_string(), html.to_string()))
            .map_err(|e| DigestError::delivery(CHANNEL, format!("failed to build message: {}", e)))
    }
}

fn body(rendered: &RenderedDigest, format: BodyFormat) -> Result<&str> {
    rendered
        .body(format)
        .ok_or_else(|| DigestError::delivery(CHANNEL, format!("digest was not rendered as {:?}", format)))
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel_name(&self) -> String {
        CHANNEL.to_string()
    }

    fn body_formats(&self) -> Vec<BodyFormat> {
        vec![BodyFormat::PlainText, BodyFormat::Html]
    }

    async fn send(&self, rendered: &RenderedDigest) -> Result<()> {
        let message = self.build_message(rendered)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| DigestError::delivery(CHANNEL, e.to_string()))?;
        info!("Sent digest email to {}", self.recipient);
        Ok(())
    }
}
