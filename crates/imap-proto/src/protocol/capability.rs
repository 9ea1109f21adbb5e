/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    IMAP4rev2,
    IMAP4rev1,
    StartTls,
    LoginDisabled,
    AuthPlain,
    CondStore,
    QResync,
    LiteralPlus,
    SaslIr,
    UidPlus,
    Unselect,
    Children,
    Idle,
    Namespace,
    Id,
    Enable,
    ESearch,
    SearchRes,
    Sort,
    Thread(&'static str),
    Move,
    SpecialUse,
    ListExtended,
    ListStatus,
    StatusSize,
    StatusDeleted,
    Binary,
    Within,
}

impl Capability {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(match self {
            Capability::IMAP4rev2 => b"IMAP4rev2".as_slice(),
            Capability::IMAP4rev1 => b"IMAP4rev1",
            Capability::StartTls => b"STARTTLS",
            Capability::LoginDisabled => b"LOGINDISABLED",
            Capability::AuthPlain => b"AUTH=PLAIN",
            Capability::CondStore => b"CONDSTORE",
            Capability::QResync => b"QRESYNC",
            Capability::LiteralPlus => b"LITERAL+",
            Capability::SaslIr => b"SASL-IR",
            Capability::UidPlus => b"UIDPLUS",
            Capability::Unselect => b"UNSELECT",
            Capability::Children => b"CHILDREN",
            Capability::Idle => b"IDLE",
            Capability::Namespace => b"NAMESPACE",
            Capability::Id => b"ID",
            Capability::Enable => b"ENABLE",
            Capability::ESearch => b"ESEARCH",
            Capability::SearchRes => b"SEARCHRES",
            Capability::Sort => b"SORT",
            Capability::Thread(algorithm) => {
                buf.extend_from_slice(b"THREAD=");
                buf.extend_from_slice(algorithm.as_bytes());
                return;
            }
            Capability::Move => b"MOVE",
            Capability::SpecialUse => b"SPECIAL-USE",
            Capability::ListExtended => b"LIST-EXTENDED",
            Capability::ListStatus => b"LIST-STATUS",
            Capability::StatusSize => b"STATUS=SIZE",
            Capability::StatusDeleted => b"STATUS=DELETED",
            Capability::Binary => b"BINARY",
            Capability::Within => b"WITHIN",
        });
    }

    /// The full capability set; the banner and the CAPABILITY response must
    /// stay in lockstep with the dispatch table.
    pub fn all_capabilities(is_authenticated: bool, is_tls: bool) -> Vec<Capability> {
        let mut capabilities = vec![
            Capability::IMAP4rev2,
            Capability::IMAP4rev1,
            Capability::Enable,
            Capability::CondStore,
            Capability::QResync,
            Capability::LiteralPlus,
            Capability::SaslIr,
            Capability::UidPlus,
            Capability::Unselect,
            Capability::Children,
            Capability::Idle,
            Capability::Namespace,
            Capability::Id,
            Capability::ESearch,
            Capability::SearchRes,
            Capability::Sort,
            Capability::Thread("ORDEREDSUBJECT"),
            Capability::Thread("REFERENCES"),
            Capability::Move,
            Capability::SpecialUse,
            Capability::ListExtended,
            Capability::ListStatus,
            Capability::StatusSize,
            Capability::StatusDeleted,
            Capability::Binary,
        ];
        if !is_tls {
            capabilities.push(Capability::StartTls);
        }
        if !is_authenticated {
            if is_tls {
                capabilities.push(Capability::AuthPlain);
            } else {
                capabilities.push(Capability::LoginDisabled);
            }
        }
        capabilities
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityResponse {
    pub capabilities: Vec<Capability>,
}

impl super::ImapResponse for CapabilityResponse {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(b"* CAPABILITY");
        for capability in &self.capabilities {
            buf.push(b' ');
            capability.serialize(&mut buf);
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ImapResponse;

    #[test]
    fn banner_matches_mode() {
        let plain = CapabilityResponse {
            capabilities: Capability::all_capabilities(false, false),
        }
        .serialize();
        let plain = String::from_utf8(plain).unwrap();
        assert!(plain.contains("STARTTLS"));
        assert!(plain.contains("LOGINDISABLED"));
        assert!(!plain.contains("AUTH=PLAIN"));

        let tls = CapabilityResponse {
            capabilities: Capability::all_capabilities(false, true),
        }
        .serialize();
        let tls = String::from_utf8(tls).unwrap();
        assert!(tls.contains("AUTH=PLAIN"));
        assert!(!tls.contains("STARTTLS"));
    }
}
