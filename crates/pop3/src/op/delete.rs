/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    event::MailboxEvent,
    listener::{SessionResult, SessionStream},
};
use store::FlagsOp;

use crate::{protocol, Session, State};

impl<T: SessionStream> Session<T> {
    pub async fn handle_dele(&mut self, number: usize) -> SessionResult {
        let response = match &mut self.state {
            State::Authenticated { mailbox } => {
                match mailbox
                    .messages
                    .get_mut(number.wrapping_sub(1))
                    .filter(|message| !message.deleted)
                {
                    Some(message) => {
                        message.deleted = true;
                        protocol::ok(&format!("Message {number} deleted."))
                    }
                    None => protocol::err("No such message."),
                }
            }
            State::NotAuthenticated { .. } => protocol::err("Not authenticated."),
        };
        self.write_bytes(&response).await.ok();
        SessionResult::Continue
    }

    pub async fn handle_rset(&mut self) -> SessionResult {
        let response = match &mut self.state {
            State::Authenticated { mailbox } => {
                for message in &mut mailbox.messages {
                    message.deleted = false;
                }
                protocol::ok("Deletion marks removed.")
            }
            State::NotAuthenticated { .. } => protocol::err("Not authenticated."),
        };
        self.write_bytes(&response).await.ok();
        SessionResult::Continue
    }

    /// QUIT enters UPDATE state: DELE-marked messages are expunged.
    pub async fn handle_quit(&mut self) -> SessionResult {
        if let State::Authenticated { mailbox } = &self.state {
            let deleted: Vec<u32> = mailbox
                .messages
                .iter()
                .filter(|message| message.deleted)
                .map(|message| message.uid)
                .collect();
            if !deleted.is_empty() {
                // Mark and expunge in one pass.
                let marked = self
                    .core
                    .store
                    .update_flags(
                        mailbox.mailbox_id,
                        &deleted,
                        FlagsOp::Add,
                        store::flags::DELETED,
                        &[],
                        None,
                    )
                    .await;
                let expunged = match marked {
                    Ok(_) => self
                        .core
                        .store
                        .expunge_messages(mailbox.mailbox_id, Some(&deleted), true)
                        .await
                        .ok(),
                    Err(_) => None,
                };
                match expunged {
                    Some(result) if !result.expunged.is_empty() => {
                        self.core.events.publish(
                            mailbox.mailbox_id,
                            MailboxEvent::Expunged {
                                uids: result.expunged.iter().map(|&(uid, _)| uid).collect(),
                            },
                        );
                        tracing::debug!(parent: &self.span, event = "quit",
                            expunged = result.expunged.len(),
                            "POP3 update state complete.");
                    }
                    Some(_) => (),
                    None => {
                        self.write_bytes(&protocol::err(
                            "Some messages could not be deleted.",
                        ))
                        .await
                        .ok();
                        return SessionResult::Close;
                    }
                }
            }
        }
        self.write_bytes(&protocol::ok("Sora POP3 signing off."))
            .await
            .ok();
        SessionResult::Close
    }
}
