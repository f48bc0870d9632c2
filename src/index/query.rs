//! Engine-independent query model.
//!
//! A [`Query`] is a tree of [`QueryNode`]s plus whatever syntax errors and warnings were
//! collected while building it. Syntax errors are data: a query carrying errors is simply
//! not evaluated.

use serde::Serialize;
use std::fmt;

/// How a clause participates in a boolean query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BoolOperator {
    /// The clause must match.
    Must,
    /// At least one optional clause must match when there are no required clauses.
    Should,
    /// The clause must not match.
    MustNot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNode {
    MatchAll,
    /// A single analysed word.
    Term(String),
    /// Consecutive analysed words.
    Phrase(Vec<String>),
    /// Words starting with the given prefix.
    Prefix(String),
    /// Words matching a pattern where `?` is one character and `*` any run of characters.
    Wildcard(String),
    Bool(Vec<(BoolOperator, QueryNode)>),
}

impl QueryNode {
    fn is_purely_negative(clauses: &[(BoolOperator, QueryNode)]) -> bool {
        !clauses.is_empty()
            && clauses
                .iter()
                .all(|(operator, _)| *operator == BoolOperator::MustNot)
    }
}

impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryNode::MatchAll => write!(f, "*"),
            QueryNode::Term(term) => write!(f, "{}", term),
            QueryNode::Phrase(words) => write!(f, "\"{}\"", words.join(" ")),
            QueryNode::Prefix(prefix) => write!(f, "{}*", prefix),
            QueryNode::Wildcard(pattern) => write!(f, "{}", pattern),
            QueryNode::Bool(clauses) => {
                write!(f, "(")?;
                for (i, (operator, node)) in clauses.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    match operator {
                        BoolOperator::Must => write!(f, "+{}", node)?,
                        BoolOperator::Should => write!(f, "{}", node)?,
                        BoolOperator::MustNot => write!(f, "-{}", node)?,
                    }
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub root: QueryNode,
    pub syntax_errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Query {
    pub fn new(root: QueryNode) -> Self {
        Self {
            root,
            syntax_errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn match_all() -> Self {
        Self::new(QueryNode::MatchAll)
    }

    /// A query that only reports `error`.
    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            root: QueryNode::Bool(Vec::new()),
            syntax_errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.syntax_errors.is_empty()
    }

    /// Combine clauses into a boolean query, carrying over their errors and warnings.
    ///
    /// A clause list with only prohibited clauses is conjoined with match-all and warned
    /// about, since it has to enumerate every document.
    pub fn boolean(clauses: Vec<(BoolOperator, Query)>) -> Self {
        let mut syntax_errors = Vec::new();
        let mut warnings = Vec::new();
        let mut nodes = Vec::with_capacity(clauses.len());

        for (operator, query) in clauses {
            syntax_errors.extend(query.syntax_errors);
            warnings.extend(query.warnings);
            nodes.push((operator, query.root));
        }

        let root = normalize_bool(nodes, &mut warnings);
        Self {
            root,
            syntax_errors,
            warnings,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)
    }
}

/// Build a boolean node, conjoining a purely negative clause list with match-all.
pub(crate) fn normalize_bool(
    mut clauses: Vec<(BoolOperator, QueryNode)>,
    warnings: &mut Vec<String>,
) -> QueryNode {
    if QueryNode::is_purely_negative(&clauses) {
        let original = QueryNode::Bool(clauses.clone());
        warnings.push(format!(
            "Negative clause may require a full index scan: {}",
            original
        ));
        clauses.insert(0, (BoolOperator::Must, QueryNode::MatchAll));
    }
    QueryNode::Bool(clauses)
}

/// Split text into lower-cased words the way indexed content is split.
///
/// A word is a maximal run of alphanumeric characters and underscores.
pub fn analyze(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Query construction exposed by an index engine.
pub trait QueryBuilder: Send + Sync {
    /// Match `text` after analysis: one word is a term, several words a phrase.
    fn value(&self, text: &str) -> Query;

    /// Match the analysed words of `text` in sequence.
    fn phrase(&self, text: &str) -> Query;

    /// Match words starting with `prefix`.
    fn prefix(&self, prefix: &str) -> Query;

    /// Parse the engine-native textual syntax.
    fn parse(&self, text: &str) -> Query;

    fn boolean(&self, clauses: Vec<(BoolOperator, Query)>) -> Query {
        Query::boolean(clauses)
    }

    fn all_of(&self, queries: Vec<Query>) -> Query {
        self.boolean(
            queries
                .into_iter()
                .map(|query| (BoolOperator::Must, query))
                .collect(),
        )
    }

    fn any_of(&self, queries: Vec<Query>) -> Query {
        self.boolean(
            queries
                .into_iter()
                .map(|query| (BoolOperator::Should, query))
                .collect(),
        )
    }

    fn not(&self, query: Query) -> Query {
        self.boolean(vec![(BoolOperator::MustNot, query)])
    }
}

/// Builds queries over words produced by [`analyze`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardQueryBuilder;

impl StandardQueryBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl QueryBuilder for StandardQueryBuilder {
    fn value(&self, text: &str) -> Query {
        let mut words = analyze(text);
        match words.len() {
            0 => Query::invalid(format!("'{}' contains no searchable words", text)),
            1 => Query::new(QueryNode::Term(words.remove(0))),
            _ => Query::new(QueryNode::Phrase(words)),
        }
    }

    fn phrase(&self, text: &str) -> Query {
        let words = analyze(text);
        if words.is_empty() {
            return Query::invalid(format!("Phrase \"{}\" contains no searchable words", text));
        }
        Query::new(QueryNode::Phrase(words))
    }

    fn prefix(&self, prefix: &str) -> Query {
        let mut words = analyze(prefix);
        if words.len() != 1 {
            return Query::invalid(format!("Prefix '{}' must be a single word", prefix));
        }
        Query::new(QueryNode::Prefix(words.remove(0)))
    }

    fn parse(&self, text: &str) -> Query {
        crate::index::query_parser::parse(text)
    }
}
