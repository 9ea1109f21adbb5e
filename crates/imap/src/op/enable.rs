/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use imap_proto::{
    protocol::ProtocolVersion, receiver::Request, Command, StatusResponse,
};

use crate::{core::Session, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_enable(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_enable()?;
        let mut enabled = Vec::new();

        for capability in &args.capabilities {
            match capability.as_str() {
                "IMAP4REV2" => {
                    self.version = ProtocolVersion::Rev2;
                    enabled.push("IMAP4rev2");
                }
                "CONDSTORE" => {
                    self.is_condstore = true;
                    enabled.push("CONDSTORE");
                }
                "QRESYNC" => {
                    // QRESYNC implies CONDSTORE (RFC 7162).
                    self.is_qresync = true;
                    self.is_condstore = true;
                    enabled.push("QRESYNC");
                }
                "UTF8=ACCEPT" => enabled.push("UTF8=ACCEPT"),
                _ => (),
            }
        }

        let mut response = Vec::with_capacity(32);
        response.extend_from_slice(b"* ENABLED");
        for capability in &enabled {
            response.push(b' ');
            response.extend_from_slice(capability.as_bytes());
        }
        response.extend_from_slice(b"\r\n");
        response.extend(
            StatusResponse::completed(Command::Enable)
                .with_tag(args.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }
}
