//! Mail alerting
//!
//! Operators get a mail whenever the error picture changes: the previous and
//! current error reports are sent side by side, truncated to a configurable
//! size, with the full text attached gzipped when it does not fit.

use flate2::write::GzEncoder;
use flate2::Compression;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::{Message, SmtpTransport, Transport};
use serde::Deserialize;
use std::io::Write;
use tracing::info;

use crate::error::{CoreError, CoreResult};

fn default_port() -> u16 {
    25
}

fn default_max_text_size() -> usize {
    64 * 1024
}

fn default_compress() -> bool {
    true
}

/// SMTP alerting settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub from: String,
    pub to: Vec<String>,
    /// Mail bodies longer than this are truncated.
    #[serde(default = "default_max_text_size")]
    pub max_text_size: usize,
    /// Attach the full text gzipped when the body was truncated.
    #[serde(default = "default_compress")]
    pub compress_attachments: bool,
}

/// Mail alert sender. With no configuration it degrades to logging only.
#[derive(Debug, Clone, Default)]
pub struct Alerter {
    config: Option<MailConfig>,
}

impl Alerter {
    pub fn new(config: Option<MailConfig>) -> Alerter {
        Alerter { config }
    }

    /// Send a diff-style alert showing the previous and current state of
    /// some error report.
    pub fn send_diff(&self, subject: &str, previous: &str, current: &str) -> CoreResult<()> {
        let body = format!("--- previous ---\n{previous}\n\n--- current ---\n{current}\n");
        self.send(subject, &body)
    }

    /// Send a plain alert.
    pub fn send(&self, subject: &str, body: &str) -> CoreResult<()> {
        let Some(config) = &self.config else {
            info!(subject, "mail alerting disabled, alert logged only");
            return Ok(());
        };

        let truncated = body.len() > config.max_text_size;
        let text = if truncated {
            let mut cut = config.max_text_size;
            while cut > 0 && !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}\n[... truncated, full text attached]", &body[..cut])
        } else {
            body.to_string()
        };

        let mut builder = Message::builder().subject(subject).from(
            config
                .from
                .parse()
                .map_err(|_| CoreError::Mail {
                    message: format!("invalid from address '{}'", config.from),
                })?,
        );
        for to in &config.to {
            builder = builder.to(to.parse().map_err(|_| CoreError::Mail {
                message: format!("invalid to address '{to}'"),
            })?);
        }

        let message = if truncated && config.compress_attachments {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(body.as_bytes())
                .and_then(|()| encoder.finish())
                .map_err(|e| CoreError::Mail {
                    message: format!("failed to compress attachment: {e}"),
                })
                .and_then(|compressed| {
                    builder
                        .multipart(
                            MultiPart::mixed()
                                .singlepart(SinglePart::plain(text.clone()))
                                .singlepart(
                                    Attachment::new("alert.txt.gz".to_string()).body(
                                        compressed,
                                        ContentType::parse("application/gzip").map_err(|e| {
                                            CoreError::Mail {
                                                message: e.to_string(),
                                            }
                                        })?,
                                    ),
                                ),
                        )
                        .map_err(|e| CoreError::Mail {
                            message: e.to_string(),
                        })
                })?
        } else {
            builder.body(text).map_err(|e| CoreError::Mail {
                message: e.to_string(),
            })?
        };

        let mailer = SmtpTransport::builder_dangerous(&config.server)
            .port(config.port)
            .build();
        mailer.send(&message).map_err(|e| CoreError::Mail {
            message: e.to_string(),
        })?;
        info!(subject, truncated, "alert mail sent");
        Ok(())
    }
}
