use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::SmtpConfig;

#[derive(Clone)]
pub struct EmailClient {
    transport: SmtpTransport,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailClient {
    pub fn new(cfg: &SmtpConfig) -> Result<Self> {
        let mut builder = SmtpTransport::relay(&cfg.host)
            .with_context(|| format!("invalid SMTP relay {}", cfg.host))?
            .port(cfg.port);
        if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        let from: Mailbox = cfg
            .from
            .parse()
            .with_context(|| format!("invalid sender address {}", cfg.from))?;
        let to = cfg
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("invalid recipient address {}", addr))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    pub fn send(&self, subject: &str, body: &str) -> Result<()> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let message = builder
            .body(body.to_string())
            .context("failed to build alert email")?;
        self.transport
            .send(&message)
            .context("failed to send alert email")?;
        Ok(())
    }
}

/// Fans trade alerts out to the log and, when configured, one email per cycle.
#[derive(Clone, Default)]
pub struct AlertNotifier {
    email: Option<EmailClient>,
    desk_name: String,
}

impl AlertNotifier {
    pub fn new(smtp: Option<&SmtpConfig>, desk_name: &str) -> Result<Self> {
        let email = smtp.map(EmailClient::new).transpose()?;
        Ok(Self {
            email,
            desk_name: desk_name.to_string(),
        })
    }

    pub fn email_enabled(&self) -> bool {
        self.email.is_some()
    }

    /// Blocking when email is enabled; call from a blocking task.
    pub fn notify(&self, alerts: &[String]) {
        if alerts.is_empty() {
            return;
        }
        for alert in alerts {
            log::info!("[ALERT] {}", alert);
        }
        if let Some(email) = &self.email {
            let (subject, body) = compose(&self.desk_name, alerts);
            match email.send(&subject, &body) {
                Ok(()) => log::info!("📧 [ALERT] email sent ({} alerts)", alerts.len()),
                Err(e) => log::warn!("[ALERT] {:#}", e),
            }
        }
    }
}

fn compose(desk_name: &str, alerts: &[String]) -> (String, String) {
    let subject = if alerts.len() == 1 {
        format!("[{}] {}", desk_name, alerts[0])
    } else {
        format!("[{}] {} trade alerts", desk_name, alerts.len())
    };
    (subject, alerts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp(from: &str) -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: Some("desk".to_string()),
            password: Some("secret".to_string()),
            from: from.to_string(),
            to: vec!["ops@example.com".to_string()],
        }
    }

    #[test]
    fn single_alert_goes_into_subject() {
        let (subject, body) = compose("pairdesk", &["🚨 ENTERED HEDGE: Long BTC / Short ETH".to_string()]);
        assert_eq!(subject, "[pairdesk] 🚨 ENTERED HEDGE: Long BTC / Short ETH");
        assert_eq!(body, "🚨 ENTERED HEDGE: Long BTC / Short ETH");
    }

    #[test]
    fn batched_alerts_share_one_message() {
        let alerts = vec!["a".to_string(), "b".to_string()];
        let (subject, body) = compose("pairdesk", &alerts);
        assert_eq!(subject, "[pairdesk] 2 trade alerts");
        assert_eq!(body, "a\nb");
    }

    #[test]
    fn email_client_validates_addresses() {
        assert!(EmailClient::new(&smtp("desk@example.com")).is_ok());
        assert!(EmailClient::new(&smtp("not an address")).is_err());
    }

    #[test]
    fn notifier_without_smtp_only_logs() {
        let notifier = AlertNotifier::new(None, "pairdesk").unwrap();
        assert!(!notifier.email_enabled());
        notifier.notify(&["🔔 CLOSED HEDGE BTC/ETH | Profit: $35.00".to_string()]);
    }
}
