/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use common::listener::SessionStream;
use imap_proto::{
    protocol::esearch::VanishedResponse,
    protocol::fetch::{DataItem, FetchResponseLine},
    protocol::ImapResponse,
    receiver::Request,
    Command, ResponseCode, StatusResponse,
};

use crate::{
    core::{SelectedMailbox, Session, State},
    ImapError, OpResult,
};

impl<T: SessionStream> Session<T> {
    pub async fn handle_select(&mut self, request: Request<Command>, examine: bool) -> OpResult {
        let command = request.command;
        let args = request.parse_select()?;
        let data = self.state.session_data();

        if args.qresync.is_some() && !self.is_qresync {
            return Err(StatusResponse::no("QRESYNC is not enabled.").with_tag(args.tag));
        }

        let mailbox = self
            .core
            .store
            .mailbox_by_name(data.account_id, &args.mailbox_name, data.is_pinned())
            .await
            .map_err(|err| err.into_status(&args.tag))?
            .ok_or_else(|| {
                StatusResponse::no("Mailbox does not exist.")
                    .with_code(ResponseCode::NonExistent)
                    .with_tag(args.tag.clone())
            })?;

        let status = self
            .core
            .store
            .mailbox_status(&mailbox, data.is_pinned())
            .await
            .map_err(|err| err.into_status(&args.tag))?;
        let view = self
            .fetch_view_state(mailbox.id, data.is_pinned(), &args.tag)
            .await?;

        let closed_previous = matches!(&self.state, State::Selected { .. });
        let is_condstore = self.is_condstore || args.condstore;
        if args.condstore {
            self.is_condstore = true;
        }

        // Untagged portion of the SELECT response.
        let mut response = Vec::with_capacity(256);
        if closed_previous && self.version.is_rev2() {
            response.extend(
                StatusResponse::ok("Previous mailbox closed.")
                    .with_code(ResponseCode::Closed)
                    .into_bytes(),
            );
        }
        response.extend_from_slice(format!("* {} EXISTS\r\n", status.messages).as_bytes());
        if !self.version.is_rev2() {
            response.extend_from_slice(format!("* {} RECENT\r\n", status.recent).as_bytes());
        }
        response.extend_from_slice(
            b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n",
        );
        response.extend(
            StatusResponse::ok("Flags permitted.")
                .with_code(ResponseCode::PermanentFlags {
                    flags: vec![
                        "\\Answered".into(),
                        "\\Flagged".into(),
                        "\\Deleted".into(),
                        "\\Seen".into(),
                        "\\Draft".into(),
                        "\\*".into(),
                    ],
                })
                .into_bytes(),
        );
        if status.first_unseen > 0 && !self.version.is_rev2() {
            response.extend(
                StatusResponse::ok("First unseen.")
                    .with_code(ResponseCode::Unseen {
                        seqnum: status.first_unseen,
                    })
                    .into_bytes(),
            );
        }
        response.extend(
            StatusResponse::ok("UIDs valid.")
                .with_code(ResponseCode::UidValidity {
                    uid_validity: status.uid_validity,
                })
                .into_bytes(),
        );
        response.extend(
            StatusResponse::ok("Predicted next UID.")
                .with_code(ResponseCode::UidNext {
                    uid_next: status.uid_next,
                })
                .into_bytes(),
        );
        if is_condstore {
            response.extend(
                StatusResponse::ok("Highest modseq.")
                    .with_code(ResponseCode::HighestModseq {
                        modseq: status.highest_modseq.max(1) as u64,
                    })
                    .into_bytes(),
            );
        }

        // QRESYNC resynchronization: expunged-since and changed-since data.
        if let Some(qresync) = &args.qresync {
            if qresync.uid_validity == status.uid_validity {
                let known_uids = qresync
                    .known_uids
                    .as_ref()
                    .map(|sequence| {
                        sequence
                            .to_ranges(view.max_uid())
                            .into_iter()
                            .flat_map(|(start, end)| start..=end)
                            .collect::<Vec<u32>>()
                    });
                let vanished = self
                    .core
                    .store
                    .expunged_since(
                        mailbox.id,
                        qresync.modseq as i64,
                        known_uids.as_deref(),
                        data.is_pinned(),
                    )
                    .await
                    .map_err(|err| err.into_status(&args.tag))?;
                if !vanished.is_empty() {
                    response.extend(
                        VanishedResponse {
                            earlier: true,
                            uids: vanished,
                        }
                        .serialize(),
                    );
                }

                let changed = self
                    .core
                    .store
                    .messages_by_uids(
                        mailbox.id,
                        known_uids.as_deref(),
                        Some(qresync.modseq as i64),
                        data.is_pinned(),
                    )
                    .await
                    .map_err(|err| err.into_status(&args.tag))?;
                for message in changed {
                    FetchResponseLine {
                        seqnum: message.seqnum,
                        items: vec![
                            DataItem::Flags {
                                flags: store::render_flags(
                                    message.flags,
                                    &message.custom_flags,
                                ),
                            },
                            DataItem::Uid { uid: message.uid },
                            DataItem::ModSeq {
                                modseq: message.modseq() as u64,
                            },
                        ],
                    }
                    .serialize(&mut response);
                }
            }
        }

        // The first selecting session consumes \Recent.
        if status.recent > 0 && !examine {
            self.core
                .store
                .clear_recent(mailbox.id)
                .await
                .map_err(|err| err.into_status(&args.tag))?;
        }

        self.state = State::Selected {
            data,
            mailbox: Arc::new(SelectedMailbox {
                mailbox,
                read_only: examine,
                state: parking_lot::RwLock::new(view),
            }),
        };

        response.extend(
            StatusResponse::completed(command)
                .with_code(if examine {
                    ResponseCode::ReadOnly
                } else {
                    ResponseCode::ReadWrite
                })
                .with_tag(args.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }

    pub async fn handle_close(&mut self, request: Request<Command>) -> OpResult {
        // CLOSE expunges silently; EXAMINE mode skips the expunge.
        if let State::Selected { data, mailbox } = &self.state {
            if !mailbox.read_only {
                let result = self
                    .core
                    .store
                    .expunge_messages(mailbox.mailbox.id, None, true)
                    .await
                    .map_err(|err| err.into_status(&request.tag))?;
                if !result.expunged.is_empty() {
                    data.mark_write();
                    self.core.events.publish(
                        mailbox.mailbox.id,
                        common::event::MailboxEvent::Expunged {
                            uids: result.expunged.iter().map(|&(uid, _)| uid).collect(),
                        },
                    );
                }
            }
        }
        self.state = State::Authenticated {
            data: self.state.session_data(),
        };
        self.write_response(
            StatusResponse::completed(Command::Close).with_tag(request.tag),
        )
        .await
        .ok();
        Ok(())
    }

    pub async fn handle_unselect(&mut self, request: Request<Command>) -> OpResult {
        self.state = State::Authenticated {
            data: self.state.session_data(),
        };
        self.write_response(
            StatusResponse::completed(Command::Unselect).with_tag(request.tag),
        )
        .await
        .ok();
        Ok(())
    }
}
