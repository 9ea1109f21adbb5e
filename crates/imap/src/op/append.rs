/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{event::MailboxEvent, ingest::ParsedMessage, listener::SessionStream};
use imap_proto::{receiver::Request, Command, ResponseCode, StatusResponse};

use crate::{core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_append(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_append()?;
        let data = self.state.session_data();

        let mailbox = self
            .core
            .store
            .mailbox_by_name(data.account_id, &args.mailbox_name, data.is_pinned())
            .await
            .map_err(|err| err.into_status(&args.tag))?
            .ok_or_else(|| {
                StatusResponse::no("Mailbox does not exist.")
                    .with_code(ResponseCode::TryCreate)
                    .with_tag(args.tag.clone())
            })?;

        let mut uids = Vec::with_capacity(args.messages.len());
        let mut appended = Vec::new();
        for message in args.messages {
            let parsed = ParsedMessage::parse(message.raw).ok_or_else(|| {
                StatusResponse::no("Failed to parse message.")
                    .with_tag(args.tag.clone())
            })?;
            let (bits, custom) = store::split_flags(message.flags.iter().map(String::as_str));
            let (new_message, raw) = parsed.into_new_message(
                data.account_id,
                &mailbox,
                bits,
                custom,
                message.internal_date,
                None,
            );
            let content_hash = new_message.content_hash.clone();

            let result = self
                .core
                .store
                .insert_message(&new_message)
                .await
                .map_err(|err| err.into_status(&args.tag))?;
            data.mark_write();

            // Stage the raw bytes until the uploader confirms the object;
            // FETCH serves pending bodies from here.
            if !result.duplicate {
                self.core
                    .blob
                    .staging
                    .write(&content_hash, &raw)
                    .await
                    .map_err(|err| err.into_status(&args.tag))?;
                appended.push(result.uid);
            }
            uids.push(result.uid);

            tracing::debug!(parent: &self.span, event = "append",
                mailbox = mailbox.name, uid = result.uid,
                duplicate = result.duplicate, size = raw.len(),
                "Message appended.");
        }

        if !appended.is_empty() {
            self.core.events.publish(
                mailbox.id,
                MailboxEvent::Appended {
                    uids: appended,
                },
            );
        }

        // Refresh the selected view when appending into the selected mailbox.
        if self
            .state
            .selected()
            .is_some_and(|selected| selected.mailbox.id == mailbox.id)
        {
            self.synchronize_messages(&args.tag).await?;
        }

        self.write_response(
            StatusResponse::completed(Command::Append)
                .with_code(ResponseCode::AppendUid {
                    uid_validity: mailbox.uid_validity as u32,
                    uids,
                })
                .with_tag(args.tag),
        )
        .await
        .ok();
        Ok(())
    }
}
