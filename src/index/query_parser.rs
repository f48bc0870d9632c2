//! Textual query syntax.
//!
//! ```text
//! hello world          either word (default operator OR)
//! +hello -world        hello required, world prohibited
//! hello AND NOT world  same as above
//! "hello world"        phrase
//! hel*  h?llo  *llo*   prefix and wildcard patterns
//! (a OR b) AND c       grouping
//! ```
//!
//! `AND` binds tighter than adjacency/`OR`. Malformed input yields a [`Query`] carrying the
//! syntax error instead of an `Err`.

use crate::index::query::{
    analyze, normalize_bool, BoolOperator, Query, QueryBuilder, QueryNode, StandardQueryBuilder,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Required,
    Prohibited,
    Phrase(String),
    Word(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::And => "AND".to_string(),
            Token::Or => "OR".to_string(),
            Token::Not => "NOT".to_string(),
            Token::Required => "'+'".to_string(),
            Token::Prohibited => "'-'".to_string(),
            Token::Phrase(text) => format!("\"{}\"", text),
            Token::Word(word) => format!("'{}'", word),
        }
    }
}

/// Parse `text` into a query. Never fails; problems are reported in `syntax_errors`.
pub fn parse(text: &str) -> Query {
    let tokens = match tokenize(text) {
        Ok(tokens) => tokens,
        Err(e) => return Query::invalid(e),
    };
    if tokens.is_empty() {
        return Query::invalid("Empty query");
    }

    let mut parser = Parser {
        tokens,
        position: 0,
        warnings: Vec::new(),
        builder: StandardQueryBuilder::new(),
    };

    let root = match parser.parse_sequence() {
        Ok(root) => root,
        Err(e) => return Query::invalid(e),
    };
    if let Some((offset, token)) = parser.tokens.get(parser.position) {
        return Query::invalid(format!(
            "Unexpected {} at position {}",
            token.describe(),
            offset
        ));
    }

    Query {
        root,
        syntax_errors: Vec::new(),
        warnings: parser.warnings,
    }
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut at_clause_start = true;

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            at_clause_start = true;
            continue;
        }

        match c {
            '(' => {
                chars.next();
                tokens.push((offset, Token::LParen));
                at_clause_start = true;
            }
            ')' => {
                chars.next();
                tokens.push((offset, Token::RParen));
                at_clause_start = false;
            }
            '"' => {
                chars.next();
                let mut phrase = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    phrase.push(c);
                }
                if !closed {
                    return Err(format!("Unterminated phrase starting at position {}", offset));
                }
                tokens.push((offset, Token::Phrase(phrase)));
                at_clause_start = false;
            }
            '+' | '-' if at_clause_start => {
                chars.next();
                let token = if c == '+' {
                    Token::Required
                } else {
                    Token::Prohibited
                };
                tokens.push((offset, token));
                at_clause_start = false;
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                let token = match word.as_str() {
                    "AND" | "&&" => Token::And,
                    "OR" | "||" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Word(word),
                };
                tokens.push((offset, token));
                at_clause_start = false;
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    warnings: Vec<String>,
    builder: StandardQueryBuilder,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token)| token)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn end_offset(&self) -> usize {
        self.tokens
            .last()
            .map(|(offset, _)| *offset + 1)
            .unwrap_or_default()
    }

    fn expect_operand(&self, operator: &str) -> Result<(), String> {
        match self.peek() {
            None | Some(Token::RParen) | Some(Token::And) | Some(Token::Or) => Err(format!(
                "Operator {} is missing a right operand",
                operator
            )),
            _ => Ok(()),
        }
    }

    /// Clauses joined by adjacency or `OR`, up to the end or a closing parenthesis.
    fn parse_sequence(&mut self) -> Result<QueryNode, String> {
        let mut clauses = Vec::new();

        loop {
            match self.peek() {
                None | Some(Token::RParen) => break,
                Some(Token::Or) => {
                    if clauses.is_empty() {
                        return Err("Operator OR is missing a left operand".to_string());
                    }
                    self.next();
                    self.expect_operand("OR")?;
                }
                _ => clauses.push(self.parse_conjunction()?),
            }
        }

        if clauses.is_empty() {
            return Err(format!("Empty group at position {}", self.end_offset()));
        }
        if clauses.len() == 1 && clauses[0].0 == BoolOperator::Should {
            return Ok(clauses.remove(0).1);
        }
        Ok(normalize_bool(clauses, &mut self.warnings))
    }

    /// Clauses joined by `AND`, each made required unless prohibited.
    fn parse_conjunction(&mut self) -> Result<(BoolOperator, QueryNode), String> {
        let first = self.parse_unary()?;
        if self.peek() != Some(&Token::And) {
            return Ok(first);
        }

        let mut clauses = vec![required(first)];
        while self.peek() == Some(&Token::And) {
            self.next();
            self.expect_operand("AND")?;
            clauses.push(required(self.parse_unary()?));
        }
        Ok((
            BoolOperator::Should,
            normalize_bool(clauses, &mut self.warnings),
        ))
    }

    fn parse_unary(&mut self) -> Result<(BoolOperator, QueryNode), String> {
        match self.peek() {
            Some(Token::Not) => {
                self.next();
                self.expect_operand("NOT")?;
                let (_, node) = self.parse_unary()?;
                Ok((BoolOperator::MustNot, node))
            }
            Some(Token::Required) => {
                self.next();
                self.expect_operand("'+'")?;
                Ok((BoolOperator::Must, self.parse_primary()?))
            }
            Some(Token::Prohibited) => {
                self.next();
                self.expect_operand("'-'")?;
                Ok((BoolOperator::MustNot, self.parse_primary()?))
            }
            _ => Ok((BoolOperator::Should, self.parse_primary()?)),
        }
    }

    fn parse_primary(&mut self) -> Result<QueryNode, String> {
        let Some((offset, token)) = self.next() else {
            return Err("Query ends with a dangling operator".to_string());
        };

        match token {
            Token::LParen => {
                let node = self.parse_sequence()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(node),
                    _ => Err(format!(
                        "Missing closing parenthesis for '(' at position {}",
                        offset
                    )),
                }
            }
            Token::Phrase(text) => into_node(self.builder.phrase(&text)),
            Token::Word(word) => self.word(&word),
            Token::And | Token::Or => Err(format!(
                "Operator {} is missing a left operand",
                token.describe()
            )),
            other => Err(format!(
                "Unexpected {} at position {}",
                other.describe(),
                offset
            )),
        }
    }

    fn word(&self, word: &str) -> Result<QueryNode, String> {
        if word == "*" {
            return Ok(QueryNode::MatchAll);
        }

        let is_wildcard = |c: char| c == '*' || c == '?';
        if !word.contains(is_wildcard) {
            return into_node(self.builder.value(word));
        }

        if let Some(stem) = word.strip_suffix('*') {
            if !stem.is_empty() && !stem.contains(is_wildcard) {
                return into_node(self.builder.prefix(stem));
            }
        }

        let literal: String = word.chars().filter(|c| !is_wildcard(*c)).collect();
        if !literal.is_empty() && analyze(&literal).concat() != literal.to_lowercase() {
            return Err(format!(
                "Wildcard pattern '{}' may only contain word characters",
                word
            ));
        }
        Ok(QueryNode::Wildcard(word.to_lowercase()))
    }
}

fn required((operator, node): (BoolOperator, QueryNode)) -> (BoolOperator, QueryNode) {
    match operator {
        BoolOperator::Should => (BoolOperator::Must, node),
        other => (other, node),
    }
}

fn into_node(query: Query) -> Result<QueryNode, String> {
    match query.syntax_errors.into_iter().next() {
        Some(error) => Err(error),
        None => Ok(query.root),
    }
}
