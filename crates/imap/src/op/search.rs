/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use ahash::AHashMap;
use common::listener::SessionStream;
use imap_proto::{
    parser::search::{ResultOption, SearchArgs, SearchKey, SortField, ThreadAlgorithm},
    protocol::esearch::{EsearchResponse, SearchResponse, SortResponse, ThreadResponse},
    protocol::ImapResponse,
    receiver::Request,
    Command, StatusResponse,
};
use store::{flags, Message, SearchNode};

use crate::{core::MailboxViewState, core::Session, ImapError, OpResult};

impl<T: SessionStream> Session<T> {
    pub async fn handle_search(&mut self, request: Request<Command>, is_uid: bool) -> OpResult {
        let args = request.parse_search()?;
        self.run_search(args, is_uid).await
    }

    pub async fn handle_sort(&mut self, request: Request<Command>, is_uid: bool) -> OpResult {
        let args = request.parse_sort()?;
        self.run_search(args, is_uid).await
    }

    pub async fn handle_thread(&mut self, request: Request<Command>, is_uid: bool) -> OpResult {
        let args = request.parse_thread()?;
        self.run_search(args, is_uid).await
    }

    async fn run_search(&mut self, args: SearchArgs, is_uid: bool) -> OpResult {
        let (data, mailbox) = self.state.select_data();
        self.synchronize_messages(&args.tag).await?;

        let node = {
            let view = mailbox.try_read().map_err(|err| err.with_tag(&args.tag))?;
            convert_key(&args.key, &view)
        };
        let sort = args
            .sort
            .as_deref()
            .map(convert_sort)
            .unwrap_or_default();

        let messages = self
            .core
            .store
            .search_messages(mailbox.mailbox.id, &node, &sort, data.is_pinned())
            .await
            .map_err(|err| err.into_status(&args.tag))?;

        let command = match (args.sort.is_some(), args.thread.is_some()) {
            (true, _) => Command::Sort(is_uid),
            (_, true) => Command::Thread(is_uid),
            _ => Command::Search(is_uid),
        };

        let ids: Vec<u32> = messages
            .iter()
            .map(|message| if is_uid { message.uid } else { message.seqnum })
            .collect();

        let mut response = if let Some(algorithm) = args.thread {
            ThreadResponse {
                threads: thread_messages(&messages, algorithm, is_uid),
            }
            .serialize()
        } else if args.sort.is_some() {
            SortResponse { ids }.serialize()
        } else if !args.result_options.is_empty() || self.version.is_rev2() {
            // ESEARCH result; an empty match omits ALL entirely.
            let want = |option: ResultOption| {
                args.result_options.is_empty() || args.result_options.contains(&option)
            };
            if args.result_options.contains(&ResultOption::Save) {
                let mut view = mailbox.try_write().map_err(|err| err.with_tag(&args.tag))?;
                view.saved_search =
                    Some(messages.iter().map(|message| message.uid).collect());
            }
            EsearchResponse {
                tag: args.tag.clone(),
                is_uid,
                min: want(ResultOption::Min)
                    .then(|| ids.iter().min().copied())
                    .flatten()
                    .filter(|_| args.result_options.contains(&ResultOption::Min)),
                max: want(ResultOption::Max)
                    .then(|| ids.iter().max().copied())
                    .flatten()
                    .filter(|_| args.result_options.contains(&ResultOption::Max)),
                count: args
                    .result_options
                    .contains(&ResultOption::Count)
                    .then_some(ids.len() as u32),
                all: (args.result_options.is_empty()
                    || args.result_options.contains(&ResultOption::All))
                .then(|| {
                    let mut sorted = ids.clone();
                    sorted.sort_unstable();
                    sorted
                }),
            }
            .serialize()
        } else {
            SearchResponse { ids }.serialize()
        };

        response.extend(
            StatusResponse::completed(command)
                .with_tag(args.tag)
                .into_bytes(),
        );
        self.write_bytes(&response).await.ok();
        Ok(())
    }
}

fn convert_sort(sort: &[imap_proto::parser::search::SortSpec]) -> Vec<store::SortKey> {
    sort.iter()
        .map(|spec| store::SortKey {
            field: match spec.field {
                SortField::Arrival => store::SortField::Arrival,
                SortField::Cc => store::SortField::Cc,
                SortField::Date => store::SortField::Date,
                SortField::From => store::SortField::From,
                SortField::Size => store::SortField::Size,
                SortField::Subject => store::SortField::Subject,
                SortField::To => store::SortField::To,
            },
            reverse: spec.reverse,
        })
        .collect()
}

/// Lowers the protocol search keys onto the store's criteria tree, resolving
/// sequence numbers and `$` against the session's snapshot.
fn convert_key(key: &SearchKey, view: &MailboxViewState) -> SearchNode {
    match key {
        SearchKey::And(keys) => SearchNode::And(
            keys.iter().map(|key| convert_key(key, view)).collect(),
        ),
        SearchKey::Or(left, right) => SearchNode::Or(
            Box::new(convert_key(left, view)),
            Box::new(convert_key(right, view)),
        ),
        SearchKey::Not(inner) => SearchNode::Not(Box::new(convert_key(inner, view))),
        SearchKey::All => SearchNode::All,
        SearchKey::Answered => SearchNode::HasFlag(flags::ANSWERED),
        SearchKey::Deleted => SearchNode::HasFlag(flags::DELETED),
        SearchKey::Draft => SearchNode::HasFlag(flags::DRAFT),
        SearchKey::Flagged => SearchNode::HasFlag(flags::FLAGGED),
        SearchKey::Recent => SearchNode::HasFlag(flags::RECENT),
        SearchKey::Seen => SearchNode::HasFlag(flags::SEEN),
        SearchKey::Unseen => SearchNode::Not(Box::new(SearchNode::HasFlag(flags::SEEN))),
        SearchKey::New => SearchNode::And(vec![
            SearchNode::HasFlag(flags::RECENT),
            SearchNode::Not(Box::new(SearchNode::HasFlag(flags::SEEN))),
        ]),
        SearchKey::Old => SearchNode::Not(Box::new(SearchNode::HasFlag(flags::RECENT))),
        SearchKey::Keyword(keyword) => SearchNode::Keyword(keyword.clone()),
        SearchKey::Bcc(value) => SearchNode::Address {
            address_type: "bcc",
            value: value.clone(),
        },
        SearchKey::Cc(value) => SearchNode::Address {
            address_type: "cc",
            value: value.clone(),
        },
        SearchKey::From(value) => SearchNode::Address {
            address_type: "from",
            value: value.clone(),
        },
        SearchKey::To(value) => SearchNode::Address {
            address_type: "to",
            value: value.clone(),
        },
        SearchKey::Subject(value) => SearchNode::Subject(value.clone()),
        SearchKey::Body(value) => SearchNode::Body(value.clone()),
        SearchKey::Text(value) => SearchNode::Text(value.clone()),
        SearchKey::Header(name, value) => SearchNode::Header {
            name: name.clone(),
            value: value.clone(),
        },
        SearchKey::Before(date) => SearchNode::Before(*date),
        SearchKey::On(date) => SearchNode::On(*date),
        SearchKey::Since(date) => SearchNode::Since(*date),
        SearchKey::SentBefore(date) => SearchNode::SentBefore(*date),
        SearchKey::SentOn(date) => SearchNode::SentOn(*date),
        SearchKey::SentSince(date) => SearchNode::SentSince(*date),
        SearchKey::Larger(size) => SearchNode::Larger(*size as i64),
        SearchKey::Smaller(size) => SearchNode::Smaller(*size as i64),
        SearchKey::ModSeq(modseq) => SearchNode::ModSeq(*modseq as i64),
        SearchKey::Uid(sequence) => {
            if sequence.is_saved_search() {
                SearchNode::UidSet(
                    view.saved_search
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(|&uid| (uid, uid))
                        .collect(),
                )
            } else {
                SearchNode::UidSet(sequence.to_ranges(view.max_uid().max(1)))
            }
        }
        SearchKey::SeqSet(sequence) => {
            let uids = view.resolve(sequence, false);
            SearchNode::UidSet(uids.into_iter().map(|uid| (uid, uid)).collect())
        }
    }
}

/// ORDEREDSUBJECT groups by base subject; REFERENCES follows the
/// In-Reply-To chain. Both order threads by their earliest message.
fn thread_messages(
    messages: &[Message],
    algorithm: ThreadAlgorithm,
    is_uid: bool,
) -> Vec<Vec<u32>> {
    let mut groups: AHashMap<String, Vec<&Message>> = AHashMap::new();
    match algorithm {
        ThreadAlgorithm::OrderedSubject => {
            for message in messages {
                groups
                    .entry(base_subject(&message.subject).to_lowercase())
                    .or_default()
                    .push(message);
            }
        }
        ThreadAlgorithm::References => {
            // Map Message-ID -> thread root by following In-Reply-To.
            let mut roots: AHashMap<&str, String> = AHashMap::new();
            for message in messages {
                let parent = message
                    .in_reply_to
                    .split_whitespace()
                    .next()
                    .unwrap_or_default();
                let root = roots
                    .get(parent)
                    .cloned()
                    .unwrap_or_else(|| {
                        if parent.is_empty() {
                            message.message_id.clone()
                        } else {
                            parent.to_string()
                        }
                    });
                roots.insert(message.message_id.as_str(), root.clone());
                groups.entry(root).or_default().push(message);
            }
        }
    }

    let mut threads: Vec<Vec<&Message>> = groups.into_values().collect();
    for thread in &mut threads {
        thread.sort_by_key(|message| (message.sent_date, message.uid));
    }
    threads.sort_by(|a, b| {
        let left = a.first().map(|message| (message.sent_date, message.uid));
        let right = b.first().map(|message| (message.sent_date, message.uid));
        left.cmp(&right)
    });
    threads
        .into_iter()
        .map(|thread| {
            thread
                .into_iter()
                .map(|message| if is_uid { message.uid } else { message.seqnum })
                .collect()
        })
        .collect()
}

/// Strips reply/forward prefixes for subject threading (RFC 5256).
fn base_subject(subject: &str) -> &str {
    let mut subject = subject.trim();
    loop {
        let lower = subject.to_lowercase();
        if let Some(rest) = lower
            .strip_prefix("re:")
            .or_else(|| lower.strip_prefix("fwd:"))
            .or_else(|| lower.strip_prefix("fw:"))
        {
            subject = subject[subject.len() - rest.len()..].trim_start();
        } else {
            return subject;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::base_subject;

    #[test]
    fn subject_normalization() {
        assert_eq!(base_subject("Re: Re: Lunch"), "Lunch");
        assert_eq!(base_subject("FWD: fw: Plans"), "Plans");
        assert_eq!(base_subject("Regular"), "Regular");
    }
}
