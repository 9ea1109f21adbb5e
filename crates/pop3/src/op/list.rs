/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::{SessionResult, SessionStream};

use crate::{protocol, Session, State};

impl<T: SessionStream> Session<T> {
    fn mailbox(&self) -> Option<&crate::Mailbox> {
        match &self.state {
            State::Authenticated { mailbox } => Some(mailbox),
            State::NotAuthenticated { .. } => None,
        }
    }

    pub async fn handle_stat(&mut self) -> SessionResult {
        let response = match self.mailbox() {
            Some(mailbox) => {
                let live: Vec<_> = mailbox
                    .messages
                    .iter()
                    .filter(|message| !message.deleted)
                    .collect();
                let size: i64 = live.iter().map(|message| message.size).sum();
                protocol::ok(&format!("{} {}", live.len(), size))
            }
            None => protocol::err("Not authenticated."),
        };
        self.write_bytes(&response).await.ok();
        SessionResult::Continue
    }

    pub async fn handle_list(&mut self, number: Option<usize>) -> SessionResult {
        let response = match self.mailbox() {
            Some(mailbox) => match number {
                Some(number) => match mailbox.get(number) {
                    Some(message) => protocol::ok(&format!("{number} {}", message.size)),
                    None => protocol::err("No such message."),
                },
                None => {
                    let mut body = Vec::new();
                    for (index, message) in mailbox.messages.iter().enumerate() {
                        if !message.deleted {
                            body.extend_from_slice(
                                format!("{} {}\r\n", index + 1, message.size).as_bytes(),
                            );
                        }
                    }
                    protocol::multiline("Scan listing follows", &body)
                }
            },
            None => protocol::err("Not authenticated."),
        };
        self.write_bytes(&response).await.ok();
        SessionResult::Continue
    }

    pub async fn handle_uidl(&mut self, number: Option<usize>) -> SessionResult {
        let response = match self.mailbox() {
            Some(mailbox) => match number {
                Some(number) => match mailbox.get(number) {
                    Some(message) => protocol::ok(&format!("{number} {}", message.uid)),
                    None => protocol::err("No such message."),
                },
                None => {
                    let mut body = Vec::new();
                    for (index, message) in mailbox.messages.iter().enumerate() {
                        if !message.deleted {
                            body.extend_from_slice(
                                format!("{} {}\r\n", index + 1, message.uid).as_bytes(),
                            );
                        }
                    }
                    protocol::multiline("Unique-ID listing follows", &body)
                }
            },
            None => protocol::err("Not authenticated."),
        };
        self.write_bytes(&response).await.ok();
        SessionResult::Continue
    }
}
