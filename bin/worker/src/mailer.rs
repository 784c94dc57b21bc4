//! SMTP delivery for `send_email` steps without an email integration.

use crate::config::SmtpSettings;
use async_trait::async_trait;
use autoflow_workflow::action::{EmailMessage, MailError, Mailer};
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, instrument};

fn mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .parse()
        .map_err(|e| MailError::new(format!("invalid address '{address}': {e}")))
}

/// Builds the MIME message; `default_from` fills a missing sender.
fn build_message(message: &EmailMessage, default_from: &Mailbox) -> Result<Message, MailError> {
    let from = match &message.from {
        Some(address) => mailbox(address)?,
        None => default_from.clone(),
    };
    let mut builder = Message::builder().from(from).subject(&message.subject);
    for address in &message.to {
        builder = builder.to(mailbox(address)?);
    }
    for address in &message.cc {
        builder = builder.cc(mailbox(address)?);
    }

    let built = match &message.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            message.body.clone(),
            html.clone(),
        )),
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone()),
    };
    built.map_err(|e| MailError::new(e.to_string()))
}

/// Sends through an SMTP relay with a pooled async transport.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    default_from: Mailbox,
}

impl SmtpMailer {
    /// Creates a mailer for the configured relay. Connections open lazily.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay host or sender address is invalid.
    pub fn new(settings: &SmtpSettings) -> Result<Self, MailError> {
        let builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        }
        .map_err(|e| MailError::new(format!("invalid relay '{}': {e}", settings.host)))?;

        let mut builder = builder.port(settings.port);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            default_from: mailbox(&settings.from_address)?,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &'static str {
        "smtp"
    }

    #[instrument(skip_all, fields(recipients = message.to.len()))]
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let email = build_message(message, &self.default_from)?;
        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| MailError::new(e.to_string()))?;
        debug!(code = %response.code(), "Mail accepted by relay");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> EmailMessage {
        EmailMessage {
            from: None,
            to: vec!["lead@example.com".to_string()],
            cc: vec!["sales@example.com".to_string()],
            subject: "Welcome".to_string(),
            body: "Hello there".to_string(),
            html: None,
        }
    }

    fn default_from() -> Mailbox {
        mailbox("Autoflow <robot@example.com>").expect("mailbox")
    }

    #[test]
    fn missing_sender_uses_the_configured_address() {
        let built = build_message(&message(), &default_from()).expect("message");
        let raw = String::from_utf8(built.formatted()).expect("utf8");
        assert!(raw.contains("From: Autoflow <robot@example.com>"));
        assert!(raw.contains("To: lead@example.com"));
        assert!(raw.contains("Cc: sales@example.com"));
        assert!(raw.contains("Subject: Welcome"));
    }

    #[test]
    fn html_bodies_are_sent_as_alternatives() {
        let mut msg = message();
        msg.html = Some("<p>Hello there</p>".to_string());
        let built = build_message(&msg, &default_from()).expect("message");
        let raw = String::from_utf8(built.formatted()).expect("utf8");
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn invalid_recipients_are_rejected() {
        let mut msg = message();
        msg.to = vec!["not an address".to_string()];
        let err = build_message(&msg, &default_from()).expect_err("invalid");
        assert!(err.reason.contains("invalid address 'not an address'"));
    }

    #[tokio::test]
    async fn relay_settings_are_validated_up_front() {
        let settings = SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 2525,
            username: Some("robot".to_string()),
            password: Some("secret".to_string()),
            from_address: "robot".to_string(),
            starttls: true,
        };
        let err = SmtpMailer::new(&settings).err().expect("bad sender");
        assert!(err.reason.contains("invalid address 'robot'"));
    }
}
