/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{event::MailboxEvent, listener::SessionStream};
use imap_proto::{
    parser::store::StoreOp,
    protocol::fetch::{DataItem, FetchResponseLine},
    receiver::Request,
    Command, ResponseCode, StatusResponse,
};
use store::FlagsOp;

use crate::{core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_store(&mut self, request: Request<Command>, is_uid: bool) -> OpResult {
        let args = request.parse_store()?;
        let (data, mailbox) = self.state.select_data();

        if args.unchanged_since.is_some() && !self.is_condstore {
            self.is_condstore = true;
        }

        let uids = {
            let view = mailbox.try_read().map_err(|err| err.with_tag(&args.tag))?;
            view.resolve(&args.sequence, is_uid)
        };
        let (bits, custom) = store::split_flags(args.flags.iter().map(String::as_str));

        let update = if uids.is_empty() {
            store::FlagsUpdate {
                updated: Vec::new(),
                modified: Vec::new(),
            }
        } else {
            self.core
                .store
                .update_flags(
                    mailbox.mailbox.id,
                    &uids,
                    match args.op {
                        StoreOp::Set => FlagsOp::Set,
                        StoreOp::Add => FlagsOp::Add,
                        StoreOp::Remove => FlagsOp::Remove,
                    },
                    bits,
                    &custom,
                    args.unchanged_since.map(|modseq| modseq as i64),
                )
                .await
                .map_err(|err| err.into_status(&args.tag))?
        };

        if !update.updated.is_empty() {
            data.mark_write();
            self.core.events.publish(
                mailbox.mailbox.id,
                MailboxEvent::FlagsChanged {
                    uids: update.updated.iter().map(|&(uid, ..)| uid).collect(),
                },
            );
        }

        let mut response = Vec::with_capacity(128);
        if !args.silent {
            let view = mailbox.try_read().map_err(|err| err.with_tag(&args.tag))?;
            for (uid, bits, custom, modseq) in &update.updated {
                let Some(seqnum) = view.seq_of_uid(*uid) else {
                    continue;
                };
                let mut items = vec![DataItem::Flags {
                    flags: store::render_flags(*bits, custom),
                }];
                if is_uid {
                    items.insert(0, DataItem::Uid { uid: *uid });
                }
                if self.is_condstore {
                    items.push(DataItem::ModSeq {
                        modseq: *modseq as u64,
                    });
                }
                FetchResponseLine { seqnum, items }.serialize(&mut response);
            }
        }

        let mut status = StatusResponse::completed(Command::Store(is_uid));
        if !update.modified.is_empty() {
            // CONDSTORE conflict: report the rows that were not updated.
            let mut modified = update.modified;
            if !is_uid {
                let view = mailbox.try_read().map_err(|err| err.with_tag(&args.tag))?;
                modified = modified
                    .iter()
                    .filter_map(|&uid| view.seq_of_uid(uid))
                    .collect();
            }
            modified.sort_unstable();
            status = status.with_code(ResponseCode::Modified { uids: modified });
        }
        response.extend(status.with_tag(args.tag).into_bytes());
        self.write_bytes(&response).await.ok();
        Ok(())
    }
}
