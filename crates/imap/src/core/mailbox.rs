/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use imap_proto::{
    protocol::esearch::{ExpungeResponse, VanishedResponse},
    protocol::ImapResponse,
    StatusResponse,
};

use crate::ImapError;

use super::{MailboxViewState, Session, State};

impl<T: SessionStream> Session<T> {
    /// Loads a fresh (uid, seqnum) snapshot for a mailbox.
    pub async fn fetch_view_state(
        &self,
        mailbox_id: i64,
        pinned: bool,
        tag: &str,
    ) -> Result<MailboxViewState, StatusResponse> {
        let uid_to_seq = self
            .core
            .store
            .uid_sequence(mailbox_id, pinned)
            .await
            .map_err(|err| err.into_status(tag))?;
        let highest_modseq = self
            .core
            .store
            .highest_modseq(mailbox_id, pinned)
            .await
            .map_err(|err| err.into_status(tag))?;
        Ok(MailboxViewState {
            uid_to_seq,
            highest_modseq,
            saved_search: None,
        })
    }

    /// Reconciles the session's snapshot with the store and emits the
    /// pending untagged responses: EXPUNGE (or VANISHED under QRESYNC)
    /// followed by EXISTS when the count changed. Consecutive events
    /// coalesce into a single batch here.
    pub async fn synchronize_messages(&mut self, tag: &str) -> Result<(), StatusResponse> {
        let (data, mailbox) = match &self.state {
            State::Selected { data, mailbox } => (data.clone(), mailbox.clone()),
            _ => return Ok(()),
        };

        let fresh = self
            .fetch_view_state(mailbox.mailbox.id, data.is_pinned(), tag)
            .await?;

        let mut buf = Vec::new();
        let mut new_exists = None;
        {
            let mut view = mailbox.try_write().map_err(|err| err.with_tag(tag))?;
            if view.highest_modseq != fresh.highest_modseq
                || view.uid_to_seq.len() != fresh.uid_to_seq.len()
            {
                let removed: Vec<(u32, u32)> = view
                    .uid_to_seq
                    .iter()
                    .filter(|&&(uid, _)| {
                        fresh
                            .uid_to_seq
                            .binary_search_by_key(&uid, |&(uid, _)| uid)
                            .is_err()
                    })
                    .copied()
                    .collect();
                if !removed.is_empty() {
                    if self.is_qresync {
                        buf.extend(
                            VanishedResponse {
                                earlier: false,
                                uids: removed.iter().map(|&(uid, _)| uid).collect(),
                            }
                            .serialize(),
                        );
                    } else {
                        buf.extend(
                            ExpungeResponse {
                                seqnums: removed.iter().map(|&(_, seq)| seq).collect(),
                            }
                            .serialize(),
                        );
                    }
                }
                if view.uid_to_seq.len() != fresh.uid_to_seq.len()
                    || view.max_uid() != fresh.max_uid()
                {
                    new_exists = Some(fresh.uid_to_seq.len() as u32);
                }
                let saved_search = view.saved_search.take();
                *view = fresh;
                view.saved_search = saved_search;
            }
        }

        if let Some(exists) = new_exists {
            buf.extend_from_slice(format!("* {exists} EXISTS\r\n").as_bytes());
        }
        if !buf.is_empty() {
            self.write_bytes(&buf).await.map_err(|_| {
                StatusResponse::bye("Connection closed.")
            })?;
        }
        Ok(())
    }
}
