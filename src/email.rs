//! Outbound mail boundary and per-action message composition.
//!
//! The crate only composes subjects and bodies; delivery belongs to the
//! host through [`EmailSender`]. Every action mail carries a single link of
//! the form `{app_url}{base}{path}?a={action}&t={token}`; templates use the
//! `{link}` placeholder which is substituted before sending.

use async_trait::async_trait;
use tracing::info;

use crate::token::TokenAction;

/// Email delivery abstraction implemented by the host.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        text_body: &str,
        html_body: &str,
    ) -> anyhow::Result<()>;
}

/// Local dev sender that logs the message instead of delivering it.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        text_body: &str,
        _html_body: &str,
    ) -> anyhow::Result<()> {
        info!(to_email = %to, subject = %subject, body = %text_body, "email send stub");
        Ok(())
    }
}

/// One block of an action mail body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmailPart {
    Paragraph(String),
    Link { url: String, label: String },
}

/// Subject and body parts for one action's mail. An empty subject means
/// "do not send".
#[derive(Clone, Debug, Default)]
pub struct ActionEmail {
    pub subject: String,
    pub parts: Vec<EmailPart>,
}

impl ActionEmail {
    #[must_use]
    pub fn new(subject: impl Into<String>, parts: Vec<EmailPart>) -> Self {
        Self {
            subject: subject.into(),
            parts,
        }
    }

    /// Substitutes the action link for `{link}` placeholders and for link
    /// parts pointing at the `#` stand-in.
    pub fn replace_link(&mut self, link: &str) {
        for part in &mut self.parts {
            match part {
                EmailPart::Paragraph(text) => {
                    if text.contains("{link}") {
                        *text = text.replace("{link}", link);
                    }
                }
                EmailPart::Link { url, .. } => {
                    if url == "#" || url.contains("{link}") {
                        *url = link.to_string();
                    }
                }
            }
        }
    }

    /// Plain-text rendering: one line per part, links as `label: url`.
    #[must_use]
    pub fn text_body(&self) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                EmailPart::Paragraph(text) => text.clone(),
                EmailPart::Link { url, label } => format!("{label}: {url}"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Minimal HTML rendering: paragraphs and anchors.
    #[must_use]
    pub fn html_body(&self) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                EmailPart::Paragraph(text) => format!("<p>{text}</p>"),
                EmailPart::Link { url, label } => {
                    format!(r#"<p><a href="{url}">{label}</a></p>"#)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Built-in subject and body for each action, overridable per action via
/// the configuration.
#[must_use]
pub fn default_action_email(action: TokenAction) -> ActionEmail {
    match action {
        TokenAction::Verify => ActionEmail::new(
            "Verify Your Email",
            vec![
                EmailPart::Paragraph("Click the link below to verify your email.".to_string()),
                EmailPart::Link {
                    url: "#".to_string(),
                    label: "Verify".to_string(),
                },
            ],
        ),
        TokenAction::Reset => ActionEmail::new(
            "Password Reset Link",
            vec![
                EmailPart::Paragraph("Click the link below to reset your password.".to_string()),
                EmailPart::Link {
                    url: "#".to_string(),
                    label: "Reset Password".to_string(),
                },
            ],
        ),
        TokenAction::EmailUpdate => ActionEmail::new(
            "Confirm Email Update",
            vec![
                EmailPart::Paragraph("Click the link below to update your email.".to_string()),
                EmailPart::Link {
                    url: "#".to_string(),
                    label: "Verify".to_string(),
                },
            ],
        ),
        TokenAction::Login => ActionEmail::new(
            "Login / Register Link",
            vec![
                EmailPart::Paragraph("Click the link below to login or register.".to_string()),
                EmailPart::Link {
                    url: "#".to_string(),
                    label: "Login".to_string(),
                },
            ],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_link_fills_placeholders() {
        let mut mail = ActionEmail::new(
            "Subject",
            vec![
                EmailPart::Paragraph("Open {link} to continue.".to_string()),
                EmailPart::Link {
                    url: "#".to_string(),
                    label: "Go".to_string(),
                },
            ],
        );
        mail.replace_link("https://app.test/auth/login?a=verify&t=tok");
        assert_eq!(
            mail.parts[0],
            EmailPart::Paragraph(
                "Open https://app.test/auth/login?a=verify&t=tok to continue.".to_string()
            )
        );
        assert_eq!(
            mail.parts[1],
            EmailPart::Link {
                url: "https://app.test/auth/login?a=verify&t=tok".to_string(),
                label: "Go".to_string(),
            }
        );
    }

    #[test]
    fn text_and_html_render_all_parts() {
        let mail = default_action_email(TokenAction::Verify);
        let text = mail.text_body();
        assert!(text.contains("verify your email"));
        assert!(text.contains("Verify: #"));
        let html = mail.html_body();
        assert!(html.contains("<p>Click the link below to verify your email.</p>"));
        assert!(html.contains(r##"<a href="#">Verify</a>"##));
    }

    #[test]
    fn every_action_has_a_subject() {
        for action in [
            TokenAction::Verify,
            TokenAction::Reset,
            TokenAction::EmailUpdate,
            TokenAction::Login,
        ] {
            assert!(!default_action_email(action).subject.is_empty());
        }
    }
}
