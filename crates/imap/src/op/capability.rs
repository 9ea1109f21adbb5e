/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use imap_proto::{
    protocol::capability::{Capability, CapabilityResponse},
    protocol::{quoted_string, ImapResponse},
    receiver::Request,
    Command, StatusResponse,
};

use crate::{core::Session, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_capability(&mut self, request: Request<Command>) -> OpResult {
        let mut response = CapabilityResponse {
            capabilities: Capability::all_capabilities(
                self.state.is_authenticated(),
                self.is_tls,
            ),
        }
        .serialize();
        response.extend(
            StatusResponse::completed(Command::Capability)
                .with_tag(request.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }

    pub async fn handle_noop(&mut self, request: Request<Command>) -> OpResult {
        self.synchronize_messages(&request.tag).await?;
        self.write_response(
            StatusResponse::completed(Command::Noop).with_tag(request.tag),
        )
        .await
        .ok();
        Ok(())
    }

    pub async fn handle_id(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_id()?;
        if !args.params.is_empty() {
            tracing::debug!(parent: &self.span, event = "id",
                params = ?args.params, "Client identified itself.");
        }
        let mut response = Vec::with_capacity(64);
        response.extend_from_slice(b"* ID (\"name\" ");
        quoted_string(&mut response, "Sora");
        response.extend_from_slice(b" \"version\" ");
        quoted_string(&mut response, env!("CARGO_PKG_VERSION"));
        response.extend_from_slice(b")\r\n");
        response.extend(
            StatusResponse::completed(Command::Id)
                .with_tag(args.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }

    pub async fn handle_logout(&mut self, request: Request<Command>) -> OpResult {
        let mut response = StatusResponse::bye("Sora IMAP4rev2 server logging out.").into_bytes();
        response.extend(
            StatusResponse::completed(Command::Logout)
                .with_tag(request.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }
}
