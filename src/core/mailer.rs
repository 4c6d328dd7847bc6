//! Post-call transcript delivery over SMTP.
//!
//! Invoked from the tail of cleanup for calls that ended naturally (never
//! after a queue handoff). This adapter must not throw back into the
//! teardown path: every failure is logged at warn and swallowed.

use std::path::Path;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

use crate::config::EmailSettings;
use crate::core::error::{BridgeError, BridgeResult};

/// Expand `{{callerId}}`, `{{channelId}}` and `{{reason}}` placeholders.
fn expand_template(template: &str, caller_id: &str, channel_id: &str, reason: &str) -> String {
    template
        .replace("{{callerId}}", caller_id)
        .replace("{{channelId}}", channel_id)
        .replace("{{reason}}", reason)
}

/// SMTP transcript mailer.
pub struct TranscriptMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject_template: String,
    body_template: String,
}

impl TranscriptMailer {
    pub fn new(settings: &EmailSettings) -> BridgeResult<Self> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| BridgeError::InvalidConfiguration(format!("bad EMAIL_FROM: {e}")))?;
        let to: Vec<Mailbox> = settings
            .to
            .iter()
            .map(|addr| {
                addr.parse().map_err(|e| {
                    BridgeError::InvalidConfiguration(format!("bad EMAIL_TO entry {addr:?}: {e}"))
                })
            })
            .collect::<BridgeResult<_>>()?;

        let tls_parameters = TlsParameters::new(settings.smtp_host.clone())
            .map_err(|e| BridgeError::InvalidConfiguration(format!("SMTP TLS setup: {e}")))?;
        let tls = if settings.smtp_secure {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Opportunistic(tls_parameters)
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host)
            .map_err(|e| BridgeError::InvalidConfiguration(format!("SMTP transport: {e}")))?
            .port(settings.smtp_port)
            .tls(tls);
        if let (Some(user), Some(pass)) = (&settings.smtp_user, &settings.smtp_pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
            subject_template: settings.subject_template.clone(),
            body_template: settings.body_template.clone(),
        })
    }

    /// Email the transcript of a finished call. Errors are logged, never
    /// returned.
    pub async fn send_transcript(
        &self,
        call_id: &str,
        caller_identity: &str,
        transcript_path: &Path,
        reason: &str,
    ) {
        let subject = expand_template(&self.subject_template, caller_identity, call_id, reason);
        let mut body = expand_template(&self.body_template, caller_identity, call_id, reason);
        match tokio::fs::read_to_string(transcript_path).await {
            Ok(transcript) => body.push_str(&transcript),
            Err(e) => {
                warn!(call_id, path = %transcript_path.display(),
                      "transcript unreadable for email: {e}");
                body.push_str("(transcript unavailable)\n");
            }
        }

        let mut message = Message::builder().from(self.from.clone()).subject(subject);
        for recipient in &self.to {
            message = message.to(recipient.clone());
        }
        let message = match message.body(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(call_id, "could not build transcript email: {e}");
                return;
            }
        };

        match self.transport.send(message).await {
            Ok(_) => debug!(call_id, "transcript email sent"),
            Err(e) => warn!(call_id, "transcript email failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_all_placeholders() {
        let out = expand_template(
            "Call {{channelId}} from {{callerId}} ended ({{reason}})",
            "+491701234567",
            "1722600000.42",
            "both-ended",
        );
        assert_eq!(
            out,
            "Call 1722600000.42 from +491701234567 ended (both-ended)"
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        let settings = EmailSettings {
            smtp_host: "mail.example.org".into(),
            smtp_port: 587,
            smtp_secure: false,
            smtp_user: None,
            smtp_pass: None,
            from: "not an address".into(),
            to: vec!["ops@example.org".into()],
            subject_template: String::new(),
            body_template: String::new(),
        };
        assert!(matches!(
            TranscriptMailer::new(&settings),
            Err(BridgeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn builds_with_multiple_recipients() {
        let settings = EmailSettings {
            smtp_host: "mail.example.org".into(),
            smtp_port: 465,
            smtp_secure: true,
            smtp_user: Some("bridge".into()),
            smtp_pass: Some("secret".into()),
            from: "bridge@example.org".into(),
            to: vec!["ops@example.org".into(), "sales@example.org".into()],
            subject_template: "Call from {{callerId}}".into(),
            body_template: String::new(),
        };
        let mailer = TranscriptMailer::new(&settings).unwrap();
        assert_eq!(mailer.to.len(), 2);
    }
}
