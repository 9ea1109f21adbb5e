/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{event::MailboxEvent, ingest::ParsedMessage, listener::SessionStream};
use mail_parser::MessageParser;
use sieve::{Envelope, Event, Input, Runtime};
use store::Mailbox;

use crate::{Recipient, Session};

/// Outcome of the Sieve evaluation for one recipient.
struct ScriptVerdict {
    /// Target mailboxes with per-target flags and the `:create` marker.
    file_into: Vec<(String, Vec<String>, bool)>,
    reject_reason: Option<String>,
}

impl<T: SessionStream> Session<T> {
    /// Delivers one DATA payload to every accepted recipient, returning one
    /// status line per recipient in RCPT order. Partial success is normal.
    pub(crate) async fn deliver(&mut self, raw: Vec<u8>) -> Vec<String> {
        let mail_from = self.transaction.mail_from.clone().unwrap_or_default();
        let recipients = std::mem::take(&mut self.transaction.recipients);

        let Some(parsed) = ParsedMessage::parse(raw) else {
            self.core.metrics.delivery(false);
            return vec!["554 5.6.0 Failed to parse message\r\n".to_string(); recipients.len()];
        };

        let mut responses = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let response = self
                .deliver_to(&parsed, &mail_from, recipient)
                .await;
            self.core
                .metrics
                .delivery(response.starts_with("250"));
            responses.push(response);
        }
        responses
    }

    async fn deliver_to(
        &self,
        parsed: &ParsedMessage,
        mail_from: &str,
        recipient: &Recipient,
    ) -> String {
        // Evaluate the recipient's active Sieve script; no script or a
        // runtime failure means an implicit keep.
        let verdict = match self
            .core
            .store
            .active_sieve_script(recipient.account_id)
            .await
        {
            Ok(Some(script)) => {
                self.evaluate_script(
                    &script.script,
                    &parsed.raw,
                    mail_from,
                    &recipient.address,
                    recipient.account_id,
                )
                .await
            }
            Ok(None) => ScriptVerdict::keep(),
            Err(err) if err.is_transient() => {
                return "451 4.3.0 Temporary server error\r\n".to_string();
            }
            Err(_) => ScriptVerdict::keep(),
        };

        if let Some(reason) = verdict.reject_reason {
            tracing::debug!(parent: &self.span, event = "reject",
                recipient = recipient.address, reason = reason,
                "Message rejected by Sieve script.");
            return format!("550 5.7.1 {reason}\r\n");
        }
        if verdict.file_into.is_empty() {
            // Explicit discard.
            tracing::debug!(parent: &self.span, event = "discard",
                recipient = recipient.address,
                "Message discarded by Sieve script.");
            return "250 2.1.5 OK\r\n".to_string();
        }

        let mut delivered = false;
        for (mailbox_name, flags, create) in verdict.file_into {
            match self
                .deliver_into(parsed, recipient, &mailbox_name, &flags, create)
                .await
            {
                Ok(()) => delivered = true,
                Err(err) if err.is_transient() => {
                    return "451 4.3.0 Temporary server error\r\n".to_string();
                }
                Err(err) if matches!(err.kind, store::ErrorKind::QuotaExceeded) => {
                    return "452 4.2.2 Mailbox full\r\n".to_string();
                }
                Err(err) => {
                    tracing::warn!(parent: &self.span, event = "error",
                        recipient = recipient.address, mailbox = mailbox_name,
                        reason = %err, "Delivery failed.");
                }
            }
        }

        if delivered {
            "250 2.1.5 OK\r\n".to_string()
        } else {
            "554 5.3.0 Delivery failed\r\n".to_string()
        }
    }

    async fn deliver_into(
        &self,
        parsed: &ParsedMessage,
        recipient: &Recipient,
        mailbox_name: &str,
        flags: &[String],
        create: bool,
    ) -> store::Result<()> {
        let mailbox = match self
            .core
            .store
            .mailbox_by_name(recipient.account_id, mailbox_name, false)
            .await?
        {
            Some(mailbox) => mailbox,
            None if create && self.core.config.lmtp.allow_sieve_create => self
                .core
                .store
                .create_mailbox(recipient.account_id, mailbox_name)
                .await?,
            // fileinto a missing mailbox falls back to INBOX.
            None => self
                .core
                .store
                .mailbox_by_name(recipient.account_id, "INBOX", false)
                .await?
                .ok_or_else(|| store::Error::not_found("INBOX does not exist"))?,
        };

        let (bits, custom) = store::split_flags(flags.iter().map(String::as_str));
        let fts_retention = self
            .core
            .config
            .lmtp
            .fts_retention
            .and_then(|retention| chrono::Duration::from_std(retention).ok());
        let (new_message, raw) = parsed.clone().into_new_message(
            recipient.account_id,
            &mailbox,
            bits | store::flags::RECENT,
            custom,
            None,
            fts_retention,
        );
        let content_hash = new_message.content_hash.clone();

        let result = self.core.store.insert_message(&new_message).await?;
        if !result.duplicate {
            self.core.blob.staging.write(&content_hash, &raw).await?;
            self.core.events.publish(
                mailbox.id,
                MailboxEvent::Appended {
                    uids: vec![result.uid],
                },
            );
        }

        tracing::debug!(parent: &self.span, event = "delivered",
            recipient = recipient.address, mailbox = mailbox.name,
            uid = result.uid, duplicate = result.duplicate,
            forwarded_for = recipient
                .forward
                .as_ref()
                .and_then(|forward| forward.originating_ip.as_deref())
                .unwrap_or(""),
            "Message delivered.");
        Ok(())
    }

    /// Runs the black-box Sieve engine and folds its events into a verdict.
    async fn evaluate_script(
        &self,
        script: &str,
        raw: &[u8],
        mail_from: &str,
        rcpt_to: &str,
        account_id: i64,
    ) -> ScriptVerdict {
        let compiled = match sieve::Compiler::new().compile(script.as_bytes()) {
            Ok(compiled) => compiled,
            Err(err) => {
                tracing::warn!(parent: &self.span, event = "error", reason = %err,
                    "Stored Sieve script no longer compiles; keeping message.");
                return ScriptVerdict::keep();
            }
        };
        let Some(message) = MessageParser::new().parse(raw) else {
            return ScriptVerdict::keep();
        };

        let runtime = Runtime::new();
        let mut instance = runtime.filter_parsed(message);
        instance.set_user_address(rcpt_to);
        instance.set_envelope(Envelope::From, mail_from);
        instance.set_envelope(Envelope::To, rcpt_to);

        let mut verdict = ScriptVerdict {
            file_into: Vec::new(),
            reject_reason: None,
        };
        let mut keep_seen = false;
        let mut discard_seen = false;
        let mut input = Input::script("active", std::sync::Arc::new(compiled));

        while let Some(event) = instance.run(input) {
            match event {
                Ok(Event::Keep { flags, .. }) => {
                    keep_seen = true;
                    verdict.push_target("INBOX".to_string(), flags, false);
                    input = true.into();
                }
                Ok(Event::FileInto {
                    folder,
                    flags,
                    create,
                    ..
                }) => {
                    keep_seen = true;
                    verdict.push_target(folder, flags, create);
                    input = true.into();
                }
                Ok(Event::Discard) => {
                    discard_seen = true;
                    input = true.into();
                }
                Ok(Event::Reject { reason, .. }) => {
                    verdict.reject_reason = Some(reason);
                    discard_seen = true;
                    input = true.into();
                }
                Ok(Event::IncludeScript { name, .. }) => {
                    // Resolve includes against the account's stored scripts.
                    match self
                        .core
                        .store
                        .sieve_script_by_name(account_id, &name)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|script| {
                            sieve::Compiler::new().compile(script.script.as_bytes()).ok()
                        }) {
                        Some(compiled) => {
                            input = Input::script(name, std::sync::Arc::new(compiled))
                        }
                        None => input = false.into(),
                    }
                }
                Ok(Event::SendMessage { recipient, .. }) => {
                    // Outbound relay (redirect / vacation) is out of scope
                    // for the delivery backend; log and continue.
                    tracing::info!(parent: &self.span, event = "redirect",
                        recipient = ?recipient,
                        "Sieve requested an outbound message; not relayed here.");
                    input = true.into();
                }
                Ok(_) => {
                    input = false.into();
                }
                Err(err) => {
                    tracing::debug!(parent: &self.span, event = "error", reason = %err,
                        "Sieve runtime error.");
                    input = true.into();
                }
            }
        }

        // No explicit action: the implicit keep applies.
        if !keep_seen && !discard_seen {
            verdict.push_target("INBOX".to_string(), Vec::new(), false);
        }
        verdict
    }
}

impl ScriptVerdict {
    fn keep() -> ScriptVerdict {
        ScriptVerdict {
            file_into: vec![("INBOX".to_string(), Vec::new(), false)],
            reject_reason: None,
        }
    }

    fn push_target(&mut self, mailbox: String, flags: Vec<String>, create: bool) {
        if !self
            .file_into
            .iter()
            .any(|(existing, ..)| existing == &mailbox)
        {
            self.file_into.push((mailbox, flags, create));
        }
    }
}

