/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::NaiveDate;
use tokio_postgres::types::ToSql;

use crate::{Message, Result, Store};

use super::{fetch::{message_from_row, MESSAGE_COLUMNS}, into_error, PgStore};

/// Search criteria tree produced by the protocol layer from RFC 3501 keys.
/// Text matching runs over the content table's TSV columns, flags over the
/// bitfield, dates with day granularity.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchNode {
    All,
    And(Vec<SearchNode>),
    Or(Box<SearchNode>, Box<SearchNode>),
    Not(Box<SearchNode>),
    /// Inclusive UID ranges.
    UidSet(Vec<(u32, u32)>),
    /// Inclusive sequence-number ranges.
    SeqSet(Vec<(u32, u32)>),
    HasFlag(i32),
    Keyword(String),
    Text(String),
    Body(String),
    Header { name: String, value: String },
    Subject(String),
    Address { address_type: &'static str, value: String },
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Larger(i64),
    Smaller(i64),
    ModSeq(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Arrival,
    Date,
    Subject,
    From,
    To,
    Cc,
    Size,
    Uid,
}

#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    pub field: SortField,
    pub reverse: bool,
}

#[derive(Debug)]
enum Param {
    I32(i32),
    I64(i64),
    Text(String),
    Date(NaiveDate),
}

impl Param {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            Param::I32(value) => value,
            Param::I64(value) => value,
            Param::Text(value) => value,
            Param::Date(value) => value,
        }
    }
}

fn render(node: &SearchNode, sql: &mut String, params: &mut Vec<Param>) {
    match node {
        SearchNode::All => sql.push_str("true"),
        SearchNode::And(nodes) => {
            if nodes.is_empty() {
                sql.push_str("true");
                return;
            }
            sql.push('(');
            for (pos, node) in nodes.iter().enumerate() {
                if pos > 0 {
                    sql.push_str(" AND ");
                }
                render(node, sql, params);
            }
            sql.push(')');
        }
        SearchNode::Or(left, right) => {
            sql.push('(');
            render(left, sql, params);
            sql.push_str(" OR ");
            render(right, sql, params);
            sql.push(')');
        }
        SearchNode::Not(inner) => {
            sql.push_str("NOT ");
            render(inner, sql, params);
        }
        SearchNode::UidSet(ranges) | SearchNode::SeqSet(ranges) => {
            let column = if matches!(node, SearchNode::UidSet(_)) {
                "m.uid"
            } else {
                "s.seqnum"
            };
            if ranges.is_empty() {
                sql.push_str("false");
                return;
            }
            sql.push('(');
            for (pos, &(start, end)) in ranges.iter().enumerate() {
                if pos > 0 {
                    sql.push_str(" OR ");
                }
                params.push(Param::I64(start as i64));
                let start_param = params.len();
                params.push(Param::I64(end as i64));
                sql.push_str(&format!(
                    "{column} BETWEEN ${start_param} AND ${}",
                    start_param + 1
                ));
            }
            sql.push(')');
        }
        SearchNode::HasFlag(bits) => {
            params.push(Param::I32(*bits));
            sql.push_str(&format!("m.flags & ${} != 0", params.len()));
        }
        SearchNode::Keyword(keyword) => {
            params.push(Param::Text(
                serde_json::to_string(keyword).unwrap_or_default(),
            ));
            sql.push_str(&format!(
                "m.custom_flags @> ${}::jsonb",
                params.len()
            ));
        }
        SearchNode::Text(needle) => {
            params.push(Param::Text(needle.clone()));
            let param = params.len();
            sql.push_str(&format!(
                "(c.text_body_tsv @@ plainto_tsquery('simple', ${param}) \
                 OR c.headers_tsv @@ plainto_tsquery('simple', ${param}))"
            ));
        }
        SearchNode::Body(needle) => {
            params.push(Param::Text(needle.clone()));
            sql.push_str(&format!(
                "c.text_body_tsv @@ plainto_tsquery('simple', ${})",
                params.len()
            ));
        }
        SearchNode::Header { name, value } => {
            let pattern = if value.is_empty() {
                format!("%{name}:%")
            } else {
                format!("%{name}:%{value}%")
            };
            params.push(Param::Text(pattern));
            sql.push_str(&format!("c.headers ILIKE ${}", params.len()));
        }
        SearchNode::Subject(needle) => {
            params.push(Param::Text(format!("%{needle}%")));
            sql.push_str(&format!("m.subject ILIKE ${}", params.len()));
        }
        SearchNode::Address {
            address_type,
            value,
        } => {
            params.push(Param::Text(address_type.to_string()));
            let type_param = params.len();
            params.push(Param::Text(format!("%{}%", value.to_lowercase())));
            let value_param = params.len();
            sql.push_str(&format!(
                "EXISTS (SELECT 1 FROM jsonb_array_elements(m.recipients_json) r \
                 WHERE r->>'address_type' = ${type_param} \
                   AND (lower(r->>'email_address') LIKE ${value_param} \
                        OR lower(r->>'name') LIKE ${value_param}))"
            ));
        }
        SearchNode::Before(date) => date_clause("m.internal_date", "<", *date, sql, params),
        SearchNode::On(date) => date_clause("m.internal_date", "=", *date, sql, params),
        SearchNode::Since(date) => date_clause("m.internal_date", ">=", *date, sql, params),
        SearchNode::SentBefore(date) => date_clause("m.sent_date", "<", *date, sql, params),
        SearchNode::SentOn(date) => date_clause("m.sent_date", "=", *date, sql, params),
        SearchNode::SentSince(date) => date_clause("m.sent_date", ">=", *date, sql, params),
        SearchNode::Larger(size) => {
            params.push(Param::I64(*size));
            sql.push_str(&format!("m.size > ${}", params.len()));
        }
        SearchNode::Smaller(size) => {
            params.push(Param::I64(*size));
            sql.push_str(&format!("m.size < ${}", params.len()));
        }
        SearchNode::ModSeq(modseq) => {
            params.push(Param::I64(*modseq));
            sql.push_str(&format!(
                "GREATEST(m.created_modseq, COALESCE(m.updated_modseq, 0)) >= ${}",
                params.len()
            ));
        }
    }
}

fn date_clause(
    column: &str,
    op: &str,
    date: NaiveDate,
    sql: &mut String,
    params: &mut Vec<Param>,
) {
    params.push(Param::Date(date));
    sql.push_str(&format!("{column}::date {op} ${}", params.len()));
}

fn order_by(sort: &[SortKey]) -> String {
    let mut clause = String::from("ORDER BY ");
    for (pos, key) in sort.iter().enumerate() {
        if pos > 0 {
            clause.push_str(", ");
        }
        clause.push_str(match key.field {
            SortField::Arrival => "m.internal_date",
            SortField::Date => "m.sent_date",
            SortField::Subject => "m.subject_sort",
            SortField::From => "m.from_email_sort",
            SortField::To => "m.to_email_sort",
            SortField::Cc => "m.cc_email_sort",
            SortField::Size => "m.size",
            SortField::Uid => "m.uid",
        });
        if key.reverse {
            clause.push_str(" DESC");
        }
    }
    // Stable tiebreak.
    clause.push_str(", m.uid");
    clause
}

fn build_query(mailbox_id: i64, node: &SearchNode, sort: &[SortKey]) -> (String, Vec<Param>) {
    let mut params = vec![Param::I64(mailbox_id)];
    let mut clause = String::new();
    render(node, &mut clause, &mut params);
    let order = if sort.is_empty() {
        "ORDER BY m.uid".to_string()
    } else {
        order_by(sort)
    };
    (
        format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             JOIN message_sequences s ON s.mailbox_id = m.mailbox_id AND s.uid = m.uid
             LEFT JOIN message_contents c ON c.content_hash = m.content_hash
             WHERE m.mailbox_id = $1 AND m.expunged_at IS NULL AND {clause}
             {order}"
        ),
        params,
    )
}

impl PgStore {
    pub async fn search_messages(
        &self,
        mailbox_id: i64,
        node: &SearchNode,
        sort: &[SortKey],
        pinned: bool,
    ) -> Result<Vec<Message>> {
        let (sql, params) = build_query(mailbox_id, node, sort);
        let args: Vec<&(dyn ToSql + Sync)> = params.iter().map(Param::as_sql).collect();
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query(&sql, &args)
            .await
            .map_err(into_error)?
            .iter()
            .map(message_from_row)
            .collect())
    }
}

impl Store {
    pub async fn search_messages(
        &self,
        mailbox_id: i64,
        node: &SearchNode,
        sort: &[SortKey],
        pinned: bool,
    ) -> Result<Vec<Message>> {
        self.run(|| self.pg.search_messages(mailbox_id, node, sort, pinned))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_flag_and_not() {
        let node = SearchNode::And(vec![
            SearchNode::Not(Box::new(SearchNode::HasFlag(crate::model::flags::SEEN))),
            SearchNode::Larger(1024),
        ]);
        let (sql, params) = build_query(7, &node, &[]);
        assert!(sql.contains("NOT m.flags & $2 != 0"));
        assert!(sql.contains("m.size > $3"));
        assert!(sql.contains("ORDER BY m.uid"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn renders_uid_ranges_and_or() {
        let node = SearchNode::Or(
            Box::new(SearchNode::UidSet(vec![(1, 10), (20, 20)])),
            Box::new(SearchNode::SeqSet(vec![(3, 5)])),
        );
        let (sql, params) = build_query(1, &node, &[]);
        assert!(sql.contains("m.uid BETWEEN $2 AND $3"));
        assert!(sql.contains("m.uid BETWEEN $4 AND $5"));
        assert!(sql.contains("s.seqnum BETWEEN $6 AND $7"));
        assert_eq!(params.len(), 7);
    }

    #[test]
    fn empty_set_matches_nothing() {
        let (sql, _) = build_query(1, &SearchNode::UidSet(Vec::new()), &[]);
        assert!(sql.contains("false"));
    }

    #[test]
    fn sort_uses_denormalized_keys() {
        let sort = [
            SortKey {
                field: SortField::Subject,
                reverse: true,
            },
            SortKey {
                field: SortField::Date,
                reverse: false,
            },
        ];
        let (sql, _) = build_query(1, &SearchNode::All, &sort);
        assert!(sql.contains("ORDER BY m.subject_sort DESC, m.sent_date, m.uid"));
    }
}
