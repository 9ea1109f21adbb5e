/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::{SessionResult, SessionStream};

use crate::{protocol, Session, State};

impl<T: SessionStream> Session<T> {
    pub async fn handle_retr(&mut self, number: usize) -> SessionResult {
        let content_hash = match &self.state {
            State::Authenticated { mailbox } => {
                mailbox.get(number).map(|message| message.content_hash.clone())
            }
            State::NotAuthenticated { .. } => {
                self.write_bytes(&protocol::err("Not authenticated."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
        };
        let Some(content_hash) = content_hash else {
            self.write_bytes(&protocol::err("No such message."))
                .await
                .ok();
            return SessionResult::Continue;
        };

        match self.core.blob.get(&content_hash).await {
            Ok(raw) => {
                let response = protocol::multiline("Message follows", &raw);
                self.write_bytes(&response).await.ok();
            }
            Err(err) if err.is_not_found() => {
                self.write_bytes(&protocol::err("Message content unavailable."))
                    .await
                    .ok();
            }
            Err(_) => {
                self.write_bytes(&protocol::err("Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_top(&mut self, number: usize, lines: usize) -> SessionResult {
        let content_hash = match &self.state {
            State::Authenticated { mailbox } => {
                mailbox.get(number).map(|message| message.content_hash.clone())
            }
            State::NotAuthenticated { .. } => {
                self.write_bytes(&protocol::err("Not authenticated."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
        };
        let Some(content_hash) = content_hash else {
            self.write_bytes(&protocol::err("No such message."))
                .await
                .ok();
            return SessionResult::Continue;
        };

        match self.core.blob.get(&content_hash).await {
            Ok(raw) => {
                let top = protocol::top_slice(&raw, lines);
                let response = protocol::multiline("Top of message follows", &top);
                self.write_bytes(&response).await.ok();
            }
            Err(err) if err.is_not_found() => {
                self.write_bytes(&protocol::err("Message content unavailable."))
                    .await
                    .ok();
            }
            Err(_) => {
                self.write_bytes(&protocol::err("Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }
}
