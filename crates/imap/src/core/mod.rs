/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use common::{
    listener::{limiter::InFlight, ServerInstance, SessionStream},
    SharedCore,
};
use imap_proto::{
    protocol::{ProtocolVersion, Sequence},
    receiver::Receiver,
    Command, StatusResponse,
};
use parking_lot::RwLock;

pub mod client;
pub mod mailbox;
pub mod session;

/// Reads routed to the writer pool for this long after a session write, so a
/// lagging replica never hides the session's own mutations.
const PIN_GRACE: Duration = Duration::from_secs(30);

/// Bounded wait for the selected-mailbox lock; commands fail with a
/// transient error instead of convoying behind a stuck peer.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session<T: SessionStream> {
    pub core: SharedCore,
    pub instance: Arc<ServerInstance>,
    pub receiver: Receiver<Command>,
    pub version: ProtocolVersion,
    pub state: State,
    pub stream: T,
    pub is_tls: bool,
    pub is_condstore: bool,
    pub is_qresync: bool,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub in_flight: InFlight,
    pub span: tracing::Span,
}

pub enum State {
    NotAuthenticated {
        auth_failures: u32,
    },
    Authenticated {
        data: Arc<SessionData>,
    },
    Selected {
        data: Arc<SessionData>,
        mailbox: Arc<SelectedMailbox>,
    },
}

/// Authenticated-session state shared across the selected-mailbox
/// transitions.
pub struct SessionData {
    pub account_id: i64,
    pub address: String,
    /// Row id in `active_connections`, polled for admin kicks.
    pub connection_id: i64,
    pinned_until: AtomicU64,
}

impl SessionData {
    pub fn new(account_id: i64, address: String, connection_id: i64) -> Self {
        SessionData {
            account_id,
            address,
            connection_id,
            pinned_until: AtomicU64::new(0),
        }
    }

    /// Called after any write so subsequent reads hit the primary.
    pub fn mark_write(&self) {
        self.pinned_until
            .store(unix_now() + PIN_GRACE.as_secs(), Ordering::Relaxed);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_until.load(Ordering::Relaxed) > unix_now()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct SelectedMailbox {
    pub mailbox: store::Mailbox,
    pub read_only: bool,
    pub state: RwLock<MailboxViewState>,
}

/// The session's snapshot of the selected mailbox: the (uid, seqnum) map the
/// client has been shown, plus the saved search result.
#[derive(Debug, Default, Clone)]
pub struct MailboxViewState {
    /// Ascending by UID; seqnums are the client-visible numbering.
    pub uid_to_seq: Vec<(u32, u32)>,
    pub highest_modseq: i64,
    pub saved_search: Option<Vec<u32>>,
}

impl MailboxViewState {
    pub fn total(&self) -> u32 {
        self.uid_to_seq.len() as u32
    }

    pub fn max_uid(&self) -> u32 {
        self.uid_to_seq.last().map_or(0, |&(uid, _)| uid)
    }

    pub fn max_seq(&self) -> u32 {
        self.uid_to_seq.len() as u32
    }

    pub fn seq_of_uid(&self, uid: u32) -> Option<u32> {
        self.uid_to_seq
            .binary_search_by_key(&uid, |&(uid, _)| uid)
            .ok()
            .map(|index| self.uid_to_seq[index].1)
    }

    /// Resolves a sequence set to UIDs in ascending order. `is_uid` selects
    /// UID semantics; `$` resolves to the saved search.
    pub fn resolve(&self, sequence: &Sequence, is_uid: bool) -> Vec<u32> {
        if sequence.is_saved_search() {
            return self.saved_search.clone().unwrap_or_default();
        }
        if is_uid {
            let max_uid = self.max_uid();
            self.uid_to_seq
                .iter()
                .filter(|&&(uid, _)| sequence.contains(uid, max_uid))
                .map(|&(uid, _)| uid)
                .collect()
        } else {
            let max_seq = self.max_seq();
            self.uid_to_seq
                .iter()
                .filter(|&&(_, seq)| sequence.contains(seq, max_seq))
                .map(|&(uid, _)| uid)
                .collect()
        }
    }
}

impl SelectedMailbox {
    /// Bounded lock acquisition; a timeout surfaces as `NO Server busy`.
    pub fn try_read(
        &self,
    ) -> Result<parking_lot::RwLockReadGuard<'_, MailboxViewState>, StatusResponse> {
        self.state
            .try_read_for(LOCK_TIMEOUT)
            .ok_or_else(StatusResponse::server_busy)
    }

    pub fn try_write(
        &self,
    ) -> Result<parking_lot::RwLockWriteGuard<'_, MailboxViewState>, StatusResponse> {
        self.state
            .try_write_for(LOCK_TIMEOUT)
            .ok_or_else(StatusResponse::server_busy)
    }
}

impl State {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, State::NotAuthenticated { .. })
    }

    pub fn session_data(&self) -> Arc<SessionData> {
        match self {
            State::Authenticated { data } | State::Selected { data, .. } => data.clone(),
            State::NotAuthenticated { .. } => unreachable!(),
        }
    }

    pub fn select_data(&self) -> (Arc<SessionData>, Arc<SelectedMailbox>) {
        match self {
            State::Selected { data, mailbox } => (data.clone(), mailbox.clone()),
            _ => unreachable!(),
        }
    }

    pub fn selected(&self) -> Option<Arc<SelectedMailbox>> {
        match self {
            State::Selected { mailbox, .. } => Some(mailbox.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(uids: &[u32]) -> MailboxViewState {
        MailboxViewState {
            uid_to_seq: uids
                .iter()
                .enumerate()
                .map(|(index, &uid)| (uid, index as u32 + 1))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_seq_and_uid() {
        let view = view(&[10, 20, 30, 40]);
        let sequence = imap_proto::parser::parse_sequence_set(b"2:3").unwrap();
        assert_eq!(view.resolve(&sequence, false), vec![20, 30]);
        assert_eq!(view.resolve(&sequence, true), Vec::<u32>::new());

        let sequence = imap_proto::parser::parse_sequence_set(b"20:*").unwrap();
        assert_eq!(view.resolve(&sequence, true), vec![20, 30, 40]);
    }

    #[test]
    fn saved_search_marker() {
        let mut state = view(&[5, 6]);
        state.saved_search = Some(vec![6]);
        let sequence = imap_proto::parser::parse_sequence_set(b"$").unwrap();
        assert_eq!(state.resolve(&sequence, true), vec![6]);
    }

    #[test]
    fn empty_sequence_set_is_legal() {
        let view = view(&[]);
        let sequence = imap_proto::parser::parse_sequence_set(b"1:100").unwrap();
        assert!(view.resolve(&sequence, false).is_empty());
    }
}
