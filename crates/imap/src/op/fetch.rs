/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use imap_proto::{
    protocol::esearch::VanishedResponse,
    protocol::fetch::{
        self, DataItem, FetchItem, FetchResponseLine,
    },
    protocol::ImapResponse,
    receiver::Request,
    Command, ResponseCode, StatusResponse,
};
use mail_parser::MessageParser;
use store::FlagsOp;

use crate::{core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_fetch(&mut self, request: Request<Command>, is_uid: bool) -> OpResult {
        let mut args = request.parse_fetch()?;
        let (data, mailbox) = self.state.select_data();

        // CHANGEDSINCE and VANISHED imply their extensions.
        if args.changed_since.is_some() && !self.is_condstore {
            self.is_condstore = true;
        }
        if args.include_vanished {
            if !self.is_qresync {
                return Err(StatusResponse::bad("VANISHED requires QRESYNC.")
                    .with_tag(args.tag));
            }
            if !is_uid {
                return Err(StatusResponse::bad("VANISHED is only valid with UID FETCH.")
                    .with_tag(args.tag));
            }
        }

        // Deliver pending changes first so seqnums line up.
        self.synchronize_messages(&args.tag).await?;

        let uids = {
            let view = mailbox.try_read().map_err(|err| err.with_tag(&args.tag))?;
            view.resolve(&args.sequence, is_uid)
        };

        // VANISHED (EARLIER) for the requested range.
        if args.include_vanished {
            if let Some(changed_since) = args.changed_since {
                let ranges = {
                    let view = mailbox.try_read().map_err(|err| err.with_tag(&args.tag))?;
                    args.sequence.to_ranges(view.max_uid().max(1))
                };
                let in_range: Vec<u32> = ranges
                    .iter()
                    .flat_map(|&(start, end)| start..=end)
                    .collect();
                let vanished = self
                    .core
                    .store
                    .expunged_since(
                        mailbox.mailbox.id,
                        changed_since as i64,
                        Some(&in_range),
                        data.is_pinned(),
                    )
                    .await
                    .map_err(|err| err.into_status(&args.tag))?;
                if !vanished.is_empty() {
                    let response = VanishedResponse {
                        earlier: true,
                        uids: vanished,
                    }
                    .serialize();
                    self.write_bytes(&response).await.ok();
                }
            }
        }

        if uids.is_empty() {
            // An empty set is legal and produces no untagged responses.
            self.write_response(
                StatusResponse::completed(Command::Fetch(is_uid)).with_tag(args.tag),
            )
            .await
            .ok();
            return Ok(());
        }

        let messages = self
            .core
            .store
            .messages_by_uids(
                mailbox.mailbox.id,
                Some(&uids),
                args.changed_since.map(|modseq| modseq as i64),
                data.is_pinned(),
            )
            .await
            .map_err(|err| err.into_status(&args.tag))?;

        if is_uid && !args.items.contains(&FetchItem::Uid) {
            args.items.insert(0, FetchItem::Uid);
        }
        let report_modseq = self.is_condstore || args.changed_since.is_some();
        let needs_body = args.items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Envelope
                    | FetchItem::Body
                    | FetchItem::BodyStructure
                    | FetchItem::Rfc822
                    | FetchItem::Rfc822Header
                    | FetchItem::Rfc822Text
                    | FetchItem::BodySection { .. }
                    | FetchItem::Binary { .. }
                    | FetchItem::BinarySize { .. }
            )
        });
        let sets_seen = !mailbox.read_only && args.items.iter().any(FetchItem::sets_seen);

        for message in messages {
            let raw = if needs_body {
                Some(
                    self.core
                        .blob
                        .get(&message.content_hash)
                        .await
                        .map_err(|err| {
                            if err.is_not_found() {
                                StatusResponse::no("Message content unavailable")
                                    .with_code(ResponseCode::ServerBug)
                                    .with_tag(args.tag.clone())
                            } else {
                                err.into_status(&args.tag)
                            }
                        })?,
                )
            } else {
                None
            };
            let parsed = match &raw {
                Some(raw) => MessageParser::new().parse(&raw[..]),
                None => None,
            };

            let mut flags = store::render_flags(message.flags, &message.custom_flags);
            let mut modseq = message.modseq();

            // Serving a non-peek body item sets \Seen.
            if sets_seen && !message.has_flag(store::flags::SEEN) {
                let update = self
                    .core
                    .store
                    .update_flags(
                        mailbox.mailbox.id,
                        &[message.uid],
                        FlagsOp::Add,
                        store::flags::SEEN,
                        &[],
                        None,
                    )
                    .await
                    .map_err(|err| err.into_status(&args.tag))?;
                data.mark_write();
                if let Some((_, bits, custom, new_modseq)) = update.updated.first() {
                    flags = store::render_flags(*bits, custom);
                    modseq = *new_modseq;
                }
            }

            let mut items = Vec::with_capacity(args.items.len() + 1);
            for item in &args.items {
                match item {
                    FetchItem::Uid => items.push(DataItem::Uid { uid: message.uid }),
                    FetchItem::Flags => items.push(DataItem::Flags {
                        flags: flags.clone(),
                    }),
                    FetchItem::InternalDate => items.push(DataItem::InternalDate {
                        date: message.internal_date,
                    }),
                    FetchItem::Rfc822Size => items.push(DataItem::Rfc822Size {
                        size: message.size as u64,
                    }),
                    FetchItem::ModSeq => (),
                    FetchItem::Envelope => {
                        if let Some(parsed) = &parsed {
                            items.push(DataItem::Envelope {
                                serialized: fetch::serialize_envelope(parsed),
                            });
                        }
                    }
                    FetchItem::Body => {
                        if let Some(parsed) = &parsed {
                            items.push(DataItem::Body {
                                serialized: fetch::serialize_body_structure(parsed, false),
                            });
                        }
                    }
                    FetchItem::BodyStructure => {
                        if let Some(parsed) = &parsed {
                            items.push(DataItem::BodyStructure {
                                serialized: fetch::serialize_body_structure(parsed, true),
                            });
                        }
                    }
                    FetchItem::Rfc822 => {
                        if let Some(raw) = &raw {
                            items.push(DataItem::Rfc822 {
                                contents: raw.clone(),
                            });
                        }
                    }
                    FetchItem::Rfc822Header => {
                        if let Some(parsed) = &parsed {
                            if let Some((contents, _)) = fetch::section_contents(
                                parsed,
                                &fetch::Section {
                                    parts: Vec::new(),
                                    text: Some(fetch::SectionText::Header),
                                },
                                None,
                            ) {
                                items.push(DataItem::Rfc822Header { contents });
                            }
                        }
                    }
                    FetchItem::Rfc822Text => {
                        if let Some(parsed) = &parsed {
                            if let Some((contents, _)) = fetch::section_contents(
                                parsed,
                                &fetch::Section {
                                    parts: Vec::new(),
                                    text: Some(fetch::SectionText::Text),
                                },
                                None,
                            ) {
                                items.push(DataItem::Rfc822Text { contents });
                            }
                        }
                    }
                    FetchItem::BodySection {
                        section, partial, ..
                    } => {
                        if let Some(parsed) = &parsed {
                            if let Some((contents, origin)) =
                                fetch::section_contents(parsed, section, *partial)
                            {
                                items.push(DataItem::BodySection {
                                    section: section.clone(),
                                    origin,
                                    contents,
                                });
                            }
                        }
                    }
                    FetchItem::Binary { parts, partial, .. } => {
                        if let Some(parsed) = &parsed {
                            match fetch::binary_contents(parsed, parts, *partial) {
                                Some((contents, origin)) => items.push(DataItem::Binary {
                                    parts: parts.clone(),
                                    origin,
                                    contents,
                                }),
                                None => {
                                    return Err(StatusResponse::no(
                                        "Failed to decode part.",
                                    )
                                    .with_code(ResponseCode::UnknownCte)
                                    .with_tag(args.tag))
                                }
                            }
                        }
                    }
                    FetchItem::BinarySize { parts } => {
                        if let Some(parsed) = &parsed {
                            if let Some(size) = fetch::binary_size(parsed, parts) {
                                items.push(DataItem::BinarySize {
                                    parts: parts.clone(),
                                    size,
                                });
                            }
                        }
                    }
                }
            }
            if report_modseq {
                items.push(DataItem::ModSeq {
                    modseq: modseq as u64,
                });
            }

            let mut response = Vec::with_capacity(128);
            FetchResponseLine {
                seqnum: message.seqnum,
                items,
            }
            .serialize(&mut response);
            if self.write_bytes(&response).await.is_err() {
                return Ok(());
            }
        }

        self.write_response(
            StatusResponse::completed(Command::Fetch(is_uid)).with_tag(args.tag),
        )
        .await
        .ok();
        Ok(())
    }
}
