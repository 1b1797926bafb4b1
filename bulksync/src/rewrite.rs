//! The SQL rewrite engine: splits a SELECT statement into clauses and reassembles
//! them into DELETE, UPDATE, INSERT ... SELECT, and COUNT statements.
//!
//! The splitter is not a SQL parser. It walks the statement byte by byte, tracking
//! quote and parenthesis state, and recognizes clause keywords only at token
//! boundaries at nesting depth zero. Everything between recognized keywords is kept
//! verbatim, so subqueries, quoted identifiers, and string literals pass through
//! untouched.

use pg_escape::quote_identifier;

use crate::bail;
use crate::error::{BulkResult, ErrorKind};
use crate::expr::{Projection, SqlExpr};
use crate::types::Cell;

/// Clause keywords recognized at nesting depth zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKeyword {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Offset,
}

impl ClauseKeyword {
    /// Keywords in match order. Two-word keywords must come before their one-word
    /// prefixes would ever be considered; none overlap here so order is cosmetic.
    const ALL: &'static [(ClauseKeyword, &'static [&'static str])] = &[
        (ClauseKeyword::Select, &["select"]),
        (ClauseKeyword::From, &["from"]),
        (ClauseKeyword::Where, &["where"]),
        (ClauseKeyword::GroupBy, &["group", "by"]),
        (ClauseKeyword::Having, &["having"]),
        (ClauseKeyword::OrderBy, &["order", "by"]),
        (ClauseKeyword::Limit, &["limit"]),
        (ClauseKeyword::Offset, &["offset"]),
    ];
}

/// One clause of a split statement: the keyword (if recognized) plus its body text.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub keyword: Option<ClauseKeyword>,
    /// Full clause text including the keyword.
    text: String,
    /// Offset of the body within `text`, just past the keyword.
    body_offset: usize,
}

impl Clause {
    /// The clause body with the leading keyword and surrounding whitespace removed.
    pub fn body(&self) -> &str {
        self.text[self.body_offset..].trim()
    }
}

/// A statement split into top-level clauses, in original order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClauseList {
    clauses: Vec<Clause>,
}

/// Returns true when `b` can be part of an identifier-like token. Used to reject
/// keyword matches glued to surrounding tokens (e.g. a column named `fromage`).
fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'"' | b'$')
}

impl ClauseList {
    /// Splits a statement into clauses.
    ///
    /// Keywords inside single-quoted literals, double-quoted identifiers, or
    /// parenthesized subexpressions never start a clause. Doubled quotes inside a
    /// quoted region are the usual SQL escape and stay inside it.
    pub fn parse(sql: &str) -> BulkResult<Self> {
        let sql = sql.trim();
        if sql.is_empty() {
            bail!(ErrorKind::UnsupportedExpression, "Query text is empty");
        }

        let bytes = sql.as_bytes();
        let mut in_single = false;
        let mut in_double = false;
        let mut depth = 0usize;

        // Byte offsets where a recognized clause keyword starts, plus the keyword
        // and its total length in bytes.
        let mut boundaries: Vec<(usize, ClauseKeyword, usize)> = Vec::new();

        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];

            if in_single {
                if b == b'\'' {
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                        i += 2;
                        continue;
                    }
                    in_single = false;
                }
                i += 1;
                continue;
            }
            if in_double {
                if b == b'"' {
                    if i + 1 < bytes.len() && bytes[i + 1] == b'"' {
                        i += 2;
                        continue;
                    }
                    in_double = false;
                }
                i += 1;
                continue;
            }

            match b {
                b'\'' => {
                    in_single = true;
                    i += 1;
                    continue;
                }
                b'"' => {
                    in_double = true;
                    i += 1;
                    continue;
                }
                b'(' => {
                    depth += 1;
                    i += 1;
                    continue;
                }
                b')' => {
                    depth = depth.saturating_sub(1);
                    i += 1;
                    continue;
                }
                _ => {}
            }

            if depth == 0 && b.is_ascii_alphabetic() {
                // Only consider a keyword at a token boundary.
                let at_boundary = i == 0 || !is_word_byte(bytes[i - 1]);
                if at_boundary {
                    if let Some((keyword, len)) = match_keyword(sql, i) {
                        boundaries.push((i, keyword, len));
                        i += len;
                        continue;
                    }
                }
                // Skip the rest of this word so we never match mid-token.
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                continue;
            }

            i += 1;
        }

        let mut clauses = Vec::with_capacity(boundaries.len() + 1);

        let first_start = boundaries.first().map(|(s, _, _)| *s).unwrap_or(sql.len());
        if first_start > 0 {
            let text = sql[..first_start].trim_end().to_string();
            if !text.is_empty() {
                clauses.push(Clause {
                    keyword: None,
                    text,
                    body_offset: 0,
                });
            }
        }

        for (idx, (start, keyword, kw_len)) in boundaries.iter().enumerate() {
            let end = boundaries
                .get(idx + 1)
                .map(|(s, _, _)| *s)
                .unwrap_or(sql.len());
            clauses.push(Clause {
                keyword: Some(*keyword),
                text: sql[*start..end].trim_end().to_string(),
                body_offset: *kw_len,
            });
        }

        Ok(Self { clauses })
    }

    /// Returns the first clause with the given keyword, if present.
    pub fn find(&self, keyword: ClauseKeyword) -> Option<&Clause> {
        self.clauses.iter().find(|c| c.keyword == Some(keyword))
    }

    /// Reassembles the clause list into a statement.
    pub fn render(&self) -> String {
        self.clauses
            .iter()
            .map(|c| c.text.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn require(&self, keyword: ClauseKeyword, what: &'static str) -> BulkResult<&Clause> {
        match self.find(keyword) {
            Some(clause) => Ok(clause),
            None => bail!(ErrorKind::UnsupportedExpression, "Query is missing a required clause", what),
        }
    }

    /// Returns true when the FROM clause references more than one table (comma-list
    /// or any JOIN form).
    fn from_has_joins(&self) -> bool {
        let Some(from) = self.find(ClauseKeyword::From) else {
            return false;
        };

        let body = from.body();
        let bytes = body.as_bytes();
        let mut in_single = false;
        let mut in_double = false;
        let mut depth = 0usize;

        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if in_single {
                if b == b'\'' {
                    in_single = false;
                }
                i += 1;
                continue;
            }
            if in_double {
                if b == b'"' {
                    in_double = false;
                }
                i += 1;
                continue;
            }
            match b {
                b'\'' => in_single = true,
                b'"' => in_double = true,
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b',' if depth == 0 => return true,
                _ => {
                    if depth == 0 && b.is_ascii_alphabetic() {
                        let at_boundary = i == 0 || !is_word_byte(bytes[i - 1]);
                        let rest = &body[i..];
                        if at_boundary && starts_with_word(rest, "join") {
                            return true;
                        }
                        while i < bytes.len() && is_word_byte(bytes[i]) {
                            i += 1;
                        }
                        continue;
                    }
                }
            }
            i += 1;
        }

        false
    }

    /// Rewrites the query into a DELETE against its FROM table.
    ///
    /// The select list, ordering, and row limits are discarded; the filter carries
    /// over verbatim. Multi-table FROM clauses and grouping are not expressible as a
    /// single-table DELETE and are rejected.
    pub fn to_delete(&self) -> BulkResult<String> {
        let from = self.require(ClauseKeyword::From, "DELETE rewrite requires a FROM clause")?;
        self.reject_aggregation("DELETE")?;
        if self.from_has_joins() {
            bail!(
                ErrorKind::UnsupportedExpression,
                "Cannot rewrite a multi-table query into a DELETE",
                "FROM clause references more than one table"
            );
        }

        let mut sql = format!("DELETE FROM {}", from.body());
        if let Some(filter) = self.find(ClauseKeyword::Where) {
            sql.push_str(" WHERE ");
            sql.push_str(filter.body());
        }

        Ok(sql)
    }

    /// Rewrites the query into an UPDATE applying `projection` to its FROM table.
    ///
    /// Literal assignments become bind parameters appended to `params`, numbered
    /// after the query's own parameters. Raw SQL assignments render verbatim.
    /// Assignments referencing the row's own pre-update values have no set-based
    /// rendering and are rejected.
    pub fn to_update(&self, projection: &Projection, params: &mut Vec<Cell>) -> BulkResult<String> {
        let from = self.require(ClauseKeyword::From, "UPDATE rewrite requires a FROM clause")?;
        self.reject_aggregation("UPDATE")?;
        if self.from_has_joins() {
            bail!(
                ErrorKind::UnsupportedExpression,
                "Cannot rewrite a multi-table query into an UPDATE",
                "FROM clause references more than one table"
            );
        }
        if projection.assignments.is_empty() {
            bail!(ErrorKind::UnsupportedExpression, "UPDATE projection is empty");
        }

        let mut assignments = Vec::with_capacity(projection.assignments.len());
        for (column, expr) in &projection.assignments {
            let rendered = match expr {
                SqlExpr::Literal(value) => {
                    params.push(value.clone());
                    format!("${}", params.len())
                }
                SqlExpr::Raw(text) => text.clone(),
                SqlExpr::Column(name) => bail!(
                    ErrorKind::UnsupportedExpression,
                    "Assignment reads the row's pre-update value",
                    format!("column reference '{name}' cannot be rendered set-based")
                ),
            };
            assignments.push(format!("{} = {}", quote_identifier(column), rendered));
        }

        let mut sql = format!("UPDATE {} SET {}", from.body(), assignments.join(", "));
        if let Some(filter) = self.find(ClauseKeyword::Where) {
            sql.push_str(" WHERE ");
            sql.push_str(filter.body());
        }

        Ok(sql)
    }

    /// Rewrites the query into an INSERT ... SELECT targeting `target`, or a
    /// CREATE TABLE ... AS when the target does not exist yet.
    ///
    /// With an explicit column list the select list is narrowed to those columns;
    /// otherwise the query's own select list carries over as-is.
    pub fn to_insert_select(
        &self,
        target: &str,
        columns: Option<&[String]>,
        target_exists: bool,
    ) -> BulkResult<String> {
        self.require(ClauseKeyword::Select, "INSERT rewrite requires a SELECT clause")?;

        if !target_exists {
            return Ok(format!("CREATE TABLE {} AS {}", target, self.render()));
        }

        let source = match columns {
            Some(names) if !names.is_empty() => {
                let narrowed = names
                    .iter()
                    .map(|n| quote_identifier(n).to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("SELECT {} FROM ({}) AS src", narrowed, self.render())
            }
            _ => self.render(),
        };

        let column_list = match columns {
            Some(names) if !names.is_empty() => {
                let list = names
                    .iter()
                    .map(|n| quote_identifier(n).to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(" ({list})")
            }
            _ => String::new(),
        };

        Ok(format!("INSERT INTO {}{} {}", target, column_list, source))
    }

    /// Rewrites the query into a row count of its result set.
    ///
    /// Ordering and row limits do not change the count and are dropped before
    /// wrapping, so the planner never sorts just to count.
    pub fn to_count(&self) -> BulkResult<String> {
        self.require(ClauseKeyword::Select, "COUNT rewrite requires a SELECT clause")?;

        let inner = self
            .clauses
            .iter()
            .filter(|c| {
                !matches!(
                    c.keyword,
                    Some(ClauseKeyword::OrderBy)
                        | Some(ClauseKeyword::Limit)
                        | Some(ClauseKeyword::Offset)
                )
            })
            .map(|c| c.text.trim())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(format!("SELECT COUNT(*) FROM ({inner}) AS cnt"))
    }

    /// Detects filters that can never match any row, so the caller can skip the
    /// round trip entirely.
    ///
    /// Purely syntactic: recognizes the stock always-false shapes (`1 = 0`,
    /// `false`, `IN (NULL)`, `= ANY('{}')`) after whitespace normalization.
    pub fn has_always_false_filter(&self) -> bool {
        let Some(filter) = self.find(ClauseKeyword::Where) else {
            return false;
        };

        let normalized: String = filter
            .body()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        matches!(normalized.as_str(), "1=0" | "0=1" | "1=2" | "2=1" | "false")
            || normalized.ends_with("in(null)")
            || normalized.contains("=any('{}')")
            || normalized.contains("=any(array[]")
    }

    fn reject_aggregation(&self, what: &str) -> BulkResult<()> {
        if self.find(ClauseKeyword::GroupBy).is_some() || self.find(ClauseKeyword::Having).is_some()
        {
            bail!(
                ErrorKind::UnsupportedExpression,
                "Cannot rewrite an aggregated query",
                format!("{what} rewrite does not support GROUP BY or HAVING")
            );
        }

        Ok(())
    }
}

/// Tries to match a clause keyword starting at byte offset `at`, returning the
/// keyword and its matched length (including internal whitespace for two-word
/// keywords).
fn match_keyword(sql: &str, at: usize) -> Option<(ClauseKeyword, usize)> {
    let rest = &sql[at..];

    for (keyword, words) in ClauseKeyword::ALL {
        if let Some(len) = match_words(rest, words) {
            return Some((*keyword, len));
        }
    }

    None
}

/// Matches a sequence of words at the start of `text`, each followed by a
/// non-word byte (or end of input), separated by whitespace. Returns the total
/// matched length.
fn match_words(text: &str, words: &[&str]) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut pos = 0usize;

    for (idx, word) in words.iter().enumerate() {
        if idx > 0 {
            let ws_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos == ws_start {
                return None;
            }
        }

        if !starts_with_word(&text[pos..], word) {
            return None;
        }
        pos += word.len();
    }

    Some(pos)
}

/// Case-insensitive match of `word` at the start of `text`, requiring a token
/// boundary after it.
fn starts_with_word(text: &str, word: &str) -> bool {
    if text.len() < word.len() {
        return false;
    }
    if !text[..word.len()].eq_ignore_ascii_case(word) {
        return false;
    }

    match text.as_bytes().get(word.len()) {
        Some(&b) => !is_word_byte(b),
        None => true,
    }
}
