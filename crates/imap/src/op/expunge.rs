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
    Command, StatusResponse,
};

use crate::{core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    /// EXPUNGE and UID EXPUNGE: soft-deletes \Deleted messages, restricted to
    /// the given UID set in the UID variant.
    pub async fn handle_expunge(&mut self, request: Request<Command>, is_uid: bool) -> OpResult {
        let (tag, sequence) = request.parse_expunge_uids()?;
        let (data, mailbox) = self.state.select_data();

        let uids = match &sequence {
            Some(sequence) if is_uid => {
                let view = mailbox.try_read().map_err(|err| err.with_tag(&tag))?;
                Some(view.resolve(sequence, true))
            }
            _ => None,
        };

        let result = self
            .core
            .store
            .expunge_messages(mailbox.mailbox.id, uids.as_deref(), true)
            .await
            .map_err(|err| err.into_status(&tag))?;

        let mut response = Vec::with_capacity(64);
        if !result.expunged.is_empty() {
            data.mark_write();
            self.core.events.publish(
                mailbox.mailbox.id,
                MailboxEvent::Expunged {
                    uids: result.expunged.iter().map(|&(uid, _)| uid).collect(),
                },
            );

            // Either VANISHED with ascending UIDs (QRESYNC) or EXPUNGE lines
            // in descending sequence order; never both.
            if self.is_qresync {
                response.extend(
                    VanishedResponse {
                        earlier: false,
                        uids: result.expunged.iter().map(|&(uid, _)| uid).collect(),
                    }
                    .serialize(),
                );
            } else {
                response.extend(
                    ExpungeResponse {
                        seqnums: result.expunged.iter().map(|&(_, seq)| seq).collect(),
                    }
                    .serialize(),
                );
            }

            let mut view = mailbox.try_write().map_err(|err| err.with_tag(&tag))?;
            view.uid_to_seq
                .retain(|&(uid, _)| !result.expunged.iter().any(|&(gone, _)| gone == uid));
            let mut next_seq = 0u32;
            for entry in view.uid_to_seq.iter_mut() {
                next_seq += 1;
                entry.1 = next_seq;
            }
            view.highest_modseq = result.modseq;
        }

        response.extend(
            StatusResponse::completed(Command::Expunge(is_uid))
                .with_tag(tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }
}
