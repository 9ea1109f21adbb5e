/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{event::MailboxEvent, listener::SessionStream};
use imap_proto::{
    protocol::fetch::{DataItem, FetchResponseLine},
    receiver::Request,
    Command, StatusResponse,
};
use tokio::io::AsyncReadExt;

use crate::{core::Session, core::State, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    /// IDLE: suspend on the selected mailbox's event bus until DONE or the
    /// idle timeout. Events arriving while idle are coalesced into one batch
    /// of untagged responses per wakeup.
    pub async fn handle_idle(&mut self, request: Request<Command>) -> OpResult {
        let tag = request.tag;
        let mut events_rx = match &self.state {
            State::Selected { mailbox, .. } => {
                Some(self.core.events.subscribe(mailbox.mailbox.id))
            }
            _ => None,
        };

        if self.write_bytes(b"+ idling\r\n").await.is_err() {
            return Ok(());
        }
        tracing::debug!(parent: &self.span, event = "idle", "Session entering IDLE.");

        let mut buf = vec![0u8; 1024];
        let mut line = Vec::new();
        let idle_timeout = tokio::time::sleep(self.core.config.imap.timeout_idle);
        tokio::pin!(idle_timeout);

        loop {
            tokio::select! {
                read = self.stream.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => return Ok(()),
                        Ok(bytes_read) => {
                            line.extend_from_slice(&buf[..bytes_read]);
                            if line.ends_with(b"\n") {
                                while matches!(line.last(), Some(b'\r') | Some(b'\n') | Some(b' ')) {
                                    line.pop();
                                }
                                if line.eq_ignore_ascii_case(b"DONE") {
                                    break;
                                }
                                line.clear();
                            }
                            if line.len() > 128 {
                                return Err(StatusResponse::bad(
                                    "Expected DONE.",
                                ).with_tag(tag));
                            }
                        }
                    }
                }
                event = recv_event(&mut events_rx) => {
                    let lagged = event.is_none();
                    let mut flag_uids = Vec::new();
                    let mut needs_sync = false;
                    let mut collect = |event: MailboxEvent| match event {
                        MailboxEvent::FlagsChanged { uids } => flag_uids.extend(uids),
                        MailboxEvent::Appended { .. } | MailboxEvent::Expunged { .. } => {
                            needs_sync = true;
                        }
                    };
                    if let Some(event) = event {
                        collect(event);
                    }
                    if let Some(rx) = events_rx.as_mut() {
                        while let Ok(event) = rx.try_recv() {
                            collect(event);
                        }
                    }
                    drop(collect);
                    if lagged {
                        // A lagged subscriber resynchronizes from the store.
                        needs_sync = true;
                    }

                    if needs_sync {
                        self.synchronize_messages(&tag).await?;
                    }
                    if !flag_uids.is_empty() {
                        self.notify_flag_changes(flag_uids).await?;
                    }
                }
                _ = &mut idle_timeout => {
                    // RFC 2177 requires clients to re-issue IDLE before the
                    // server's timeout; drop the connection afterwards.
                    return Err(StatusResponse::bye("IDLE timed out."));
                }
            }
        }

        tracing::debug!(parent: &self.span, event = "done", "Session exiting IDLE.");
        self.write_response(
            StatusResponse::completed(Command::Idle).with_tag(tag),
        )
        .await
        .ok();
        Ok(())
    }

    async fn notify_flag_changes(&mut self, uids: Vec<u32>) -> Result<(), StatusResponse> {
        let (data, mailbox) = match &self.state {
            State::Selected { data, mailbox } => (data.clone(), mailbox.clone()),
            _ => return Ok(()),
        };
        let messages = self
            .core
            .store
            .messages_by_uids(
                mailbox.mailbox.id,
                Some(&uids),
                None,
                data.is_pinned(),
            )
            .await
            .map_err(|err| err.into_status("*"))?;

        let mut response = Vec::with_capacity(64);
        {
            let view = mailbox
                .try_read()
                .map_err(|err| err.with_tag("*".to_string()))?;
            for message in messages {
                let Some(seqnum) = view.seq_of_uid(message.uid) else {
                    continue;
                };
                let mut items = vec![
                    DataItem::Flags {
                        flags: store::render_flags(message.flags, &message.custom_flags),
                    },
                    DataItem::Uid { uid: message.uid },
                ];
                if self.is_condstore {
                    items.push(DataItem::ModSeq {
                        modseq: message.modseq() as u64,
                    });
                }
                FetchResponseLine { seqnum, items }.serialize(&mut response);
            }
        }
        if !response.is_empty() {
            self.write_bytes(&response).await.ok();
        }
        Ok(())
    }
}

async fn recv_event(
    rx: &mut Option<tokio::sync::broadcast::Receiver<MailboxEvent>>,
) -> Option<MailboxEvent> {
    match rx {
        Some(rx) => match rx.recv().await {
            Ok(event) => Some(event),
            // Lagged subscribers resynchronize from the store.
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => None,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}
