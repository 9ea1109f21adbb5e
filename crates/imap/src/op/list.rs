/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use imap_proto::{
    parser::mailbox::StatusArgs,
    protocol::list::{matches_pattern, ListAttribute, ListItem},
    protocol::status::{StatusItem, StatusResponseLine},
    receiver::Request,
    Command, ResponseCode, StatusResponse,
};

use crate::{core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_list(&mut self, request: Request<Command>, is_lsub: bool) -> OpResult {
        let command = request.command;
        let args = request.parse_list(is_lsub)?;
        let data = self.state.session_data();

        let mailboxes = self
            .core
            .store
            .list_mailboxes(data.account_id, data.is_pinned())
            .await
            .map_err(|err| err.into_status(&args.tag))?;

        let mut response = Vec::with_capacity(256);
        for mailbox in &mailboxes {
            if args.select_subscribed && !mailbox.subscribed {
                continue;
            }
            let special_use = ListAttribute::special_use(&mailbox.name);
            if args.select_special_use && special_use.is_none() {
                continue;
            }

            let full_name = if args.reference.is_empty() {
                mailbox.name.clone()
            } else {
                format!("{}/{}", args.reference.trim_end_matches('/'), mailbox.name)
            };
            if !args
                .patterns
                .iter()
                .any(|pattern| matches_pattern(pattern, &mailbox.name))
            {
                continue;
            }

            let mut item = ListItem::new(full_name);
            let has_children = mailboxes
                .iter()
                .any(|other| other.name.starts_with(&format!("{}/", mailbox.name)));
            item.attributes.push(if has_children {
                ListAttribute::HasChildren
            } else {
                ListAttribute::HasNoChildren
            });
            if (args.return_subscribed || is_lsub) && mailbox.subscribed {
                item.attributes.push(ListAttribute::Subscribed);
            }
            if args.return_special_use || args.select_special_use {
                if let Some(attribute) = special_use {
                    item.attributes.push(attribute);
                }
            }
            if let Some(items) = &args.return_status {
                item.status = Some(
                    self.build_status(mailbox, items, data.is_pinned(), &args.tag)
                        .await?,
                );
            }
            item.serialize(&mut response, is_lsub, self.version.is_rev2());
        }

        response.extend(
            StatusResponse::completed(command)
                .with_tag(args.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }

    pub async fn handle_namespace(&mut self, request: Request<Command>) -> OpResult {
        // Single personal namespace with "/" as hierarchy separator.
        let mut response = b"* NAMESPACE ((\"\" \"/\")) NIL NIL\r\n".to_vec();
        response.extend(
            StatusResponse::completed(Command::Namespace)
                .with_tag(request.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }

    pub async fn handle_status(&mut self, request: Request<Command>) -> OpResult {
        let args: StatusArgs = request.parse_status()?;
        let data = self.state.session_data();

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

        let line = self
            .build_status(&mailbox, &args.items, data.is_pinned(), &args.tag)
            .await?;
        let mut response = Vec::with_capacity(64);
        line.serialize(&mut response, self.version.is_rev2());
        response.extend(
            StatusResponse::completed(Command::Status)
                .with_tag(args.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }

    async fn build_status(
        &self,
        mailbox: &store::Mailbox,
        items: &[StatusItem],
        pinned: bool,
        tag: &str,
    ) -> Result<StatusResponseLine, StatusResponse> {
        let status = self
            .core
            .store
            .mailbox_status(mailbox, pinned)
            .await
            .map_err(|err| err.into_status(tag))?;
        Ok(StatusResponseLine {
            mailbox_name: mailbox.name.clone(),
            items: items
                .iter()
                .map(|item| {
                    let value = match item {
                        StatusItem::Messages => status.messages as u64,
                        StatusItem::UidNext => status.uid_next as u64,
                        StatusItem::UidValidity => status.uid_validity as u64,
                        StatusItem::Unseen => status.unseen as u64,
                        StatusItem::Recent => status.recent as u64,
                        StatusItem::HighestModseq => status.highest_modseq.max(1) as u64,
                        StatusItem::Deleted => status.deleted as u64,
                        StatusItem::Size => status.size as u64,
                    };
                    (*item, value)
                })
                .collect(),
        })
    }

    pub async fn handle_subscribe(
        &mut self,
        request: Request<Command>,
        subscribe: bool,
    ) -> OpResult {
        let command = request.command;
        let args = request.parse_mailbox_name()?;
        let data = self.state.session_data();

        self.core
            .store
            .set_subscribed(data.account_id, &args.mailbox_name, subscribe)
            .await
            .map_err(|err| err.into_status(&args.tag))?;
        data.mark_write();

        self.write_response(
            StatusResponse::completed(command).with_tag(args.tag),
        )
        .await
        .ok();
        Ok(())
    }
}
