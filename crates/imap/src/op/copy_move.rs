/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{event::MailboxEvent, listener::SessionStream};
use imap_proto::{
    protocol::esearch::{ExpungeResponse, VanishedResponse},
    protocol::ImapResponse,
    receiver::Request,
    Command, ResponseCode, StatusResponse,
};

use crate::{core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_copy_move(
        &mut self,
        request: Request<Command>,
        is_move: bool,
        is_uid: bool,
    ) -> OpResult {
        let args = request.parse_copy_move()?;
        let (data, mailbox) = self.state.select_data();

        let dest = self
            .core
            .store
            .mailbox_by_name(data.account_id, &args.mailbox_name, data.is_pinned())
            .await
            .map_err(|err| err.into_status(&args.tag))?
            .ok_or_else(|| {
                StatusResponse::no("Destination mailbox does not exist.")
                    .with_code(ResponseCode::TryCreate)
                    .with_tag(args.tag.clone())
            })?;
        if dest.id == mailbox.mailbox.id {
            return Err(StatusResponse::no(
                "Source and destination mailboxes are the same.",
            )
            .with_code(ResponseCode::Cannot)
            .with_tag(args.tag));
        }

        let uids = {
            let view = mailbox.try_read().map_err(|err| err.with_tag(&args.tag))?;
            view.resolve(&args.sequence, is_uid)
        };
        if uids.is_empty() {
            self.write_response(
                StatusResponse::completed(request_command(is_move, is_uid))
                    .with_tag(args.tag),
            )
            .await
            .ok();
            return Ok(());
        }

        let mut response = Vec::with_capacity(64);
        let copied = if is_move {
            let (copied, expunged) = self
                .core
                .store
                .move_messages(mailbox.mailbox.id, &dest, &uids)
                .await
                .map_err(|err| err.into_status(&args.tag))?;

            if !expunged.expunged.is_empty() {
                self.core.events.publish(
                    mailbox.mailbox.id,
                    MailboxEvent::Expunged {
                        uids: expunged.expunged.iter().map(|&(uid, _)| uid).collect(),
                    },
                );
                if self.is_qresync {
                    response.extend(
                        VanishedResponse {
                            earlier: false,
                            uids: expunged.expunged.iter().map(|&(uid, _)| uid).collect(),
                        }
                        .serialize(),
                    );
                } else {
                    response.extend(
                        ExpungeResponse {
                            seqnums: expunged.expunged.iter().map(|&(_, seq)| seq).collect(),
                        }
                        .serialize(),
                    );
                }
                // Drop the moved rows from the session snapshot; the EXPUNGE
                // lines above already renumbered the remainder for the client.
                let mut view = mailbox.try_write().map_err(|err| err.with_tag(&args.tag))?;
                view.uid_to_seq
                    .retain(|&(uid, _)| !expunged.expunged.iter().any(|&(gone, _)| gone == uid));
                let mut next_seq = 0u32;
                for entry in view.uid_to_seq.iter_mut() {
                    next_seq += 1;
                    entry.1 = next_seq;
                }
            }
            copied
        } else {
            self.core
                .store
                .copy_messages(mailbox.mailbox.id, &dest, &uids)
                .await
                .map_err(|err| err.into_status(&args.tag))?
        };
        data.mark_write();

        if copied.is_empty() {
            return Err(StatusResponse::no("No messages were found.")
                .with_code(ResponseCode::NonExistent)
                .with_tag(args.tag));
        }
        self.core.events.publish(
            dest.id,
            MailboxEvent::Appended {
                uids: copied.iter().map(|&(_, dst)| dst).collect(),
            },
        );

        let copyuid = ResponseCode::CopyUid {
            uid_validity: dest.uid_validity as u32,
            src_uids: copied.iter().map(|&(src, _)| src).collect(),
            dest_uids: copied.iter().map(|&(_, dst)| dst).collect(),
        };

        // MOVE reports COPYUID on an untagged OK (RFC 6851).
        if is_move {
            response.extend(
                StatusResponse::ok("Messages moved.")
                    .with_code(copyuid)
                    .into_bytes(),
            );
            response.extend(
                StatusResponse::completed(Command::Move(is_uid))
                    .with_tag(args.tag)
                    .into_bytes(),
            );
        } else {
            response.extend(
                StatusResponse::completed(Command::Copy(is_uid))
                    .with_code(copyuid)
                    .with_tag(args.tag)
                    .into_bytes(),
            );
        }
        self.write_bytes(&response).await.ok();
        Ok(())
    }
}

fn request_command(is_move: bool, is_uid: bool) -> Command {
    if is_move {
        Command::Move(is_uid)
    } else {
        Command::Copy(is_uid)
    }
}
