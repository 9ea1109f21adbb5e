/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use imap_proto::{receiver::Request, Command, ResponseCode, StatusResponse};

use crate::{core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_create(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_mailbox_name()?;
        let data = self.state.session_data();

        if args.mailbox_name.eq_ignore_ascii_case("INBOX") {
            return Err(StatusResponse::no("INBOX already exists.")
                .with_code(ResponseCode::AlreadyExists)
                .with_tag(args.tag));
        }

        self.core
            .store
            .create_mailbox(data.account_id, &args.mailbox_name)
            .await
            .map_err(|err| err.into_status(&args.tag))?;
        data.mark_write();

        tracing::debug!(parent: &self.span, event = "create",
            mailbox = args.mailbox_name, "Mailbox created.");
        self.write_response(
            StatusResponse::completed(Command::Create).with_tag(args.tag),
        )
        .await
        .ok();
        Ok(())
    }

    pub async fn handle_delete(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_mailbox_name()?;
        let data = self.state.session_data();

        // Deleting the selected mailbox implicitly unselects it.
        if let Some(selected) = self.state.selected() {
            if selected.mailbox.name == args.mailbox_name {
                self.state = crate::core::State::Authenticated {
                    data: self.state.session_data(),
                };
            }
        }

        self.core
            .store
            .delete_mailbox(data.account_id, &args.mailbox_name)
            .await
            .map_err(|err| err.into_status(&args.tag))?;
        data.mark_write();

        self.write_response(
            StatusResponse::completed(Command::Delete).with_tag(args.tag),
        )
        .await
        .ok();
        Ok(())
    }

    pub async fn handle_rename(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_rename()?;
        let data = self.state.session_data();

        self.core
            .store
            .rename_mailbox(data.account_id, &args.from, &args.to)
            .await
            .map_err(|err| err.into_status(&args.tag))?;
        data.mark_write();

        self.write_response(
            StatusResponse::completed(Command::Rename).with_tag(args.tag),
        )
        .await
        .ok();
        Ok(())
    }
}
