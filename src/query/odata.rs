//! OData-subset grammar (§4.8).
//!
//! A small hand-written lexer/recursive-descent parser covering the
//! comparison, logical, text-match, `in`, `exists`/`empty` filter grammar,
//! plus the `order_by` and `select` clauses. Anything outside this subset
//! is a `QueryError`, never a panic.

use std::iter::Peekable;
use std::str::Chars;

use crate::errors::{Error, QueryError};
use crate::query::ast::{
    CompareOp, CompoundSort, FilterNode, LogicalOp, SingleFieldSort, SortDirection, TextMatchKind, Value,
};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    String(String),
    Number(String),
    LParen,
    RParen,
    Comma,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer { chars: input.chars().peekable() }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            match c {
                ' ' | '\t' | '\n' | '\r' => {
                    self.chars.next();
                }
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                ',' => {
                    self.chars.next();
                    tokens.push(Token::Comma);
                }
                '\'' => {
                    tokens.push(Token::String(self.read_quoted_string()?));
                }
                c if c.is_ascii_digit() || c == '-' => {
                    tokens.push(Token::Number(self.read_number()));
                }
                c if c.is_alphabetic() || c == '_' => {
                    tokens.push(Token::Ident(self.read_ident()));
                }
                other => {
                    return Err(QueryError::InvalidFilter(format!("unexpected character '{other}'")).into());
                }
            }
        }
        Ok(tokens)
    }

    fn read_quoted_string(&mut self) -> Result<String, Error> {
        self.chars.next(); // opening quote
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some('\'') => {
                    // `''` is an escaped literal quote inside the string.
                    if self.chars.peek() == Some(&'\'') {
                        self.chars.next();
                        out.push('\'');
                    }
                    else {
                        return Ok(out);
                    }
                }
                Some(c) => out.push(c),
                None => return Err(QueryError::InvalidFilter("unterminated string literal".to_string()).into()),
            }
        }
    }

    fn read_number(&mut self) -> String {
        let mut out = String::new();
        if self.chars.peek() == Some(&'-') {
            out.push(self.chars.next().unwrap());
        }
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '+' || c == '-' {
                out.push(c);
                self.chars.next();
            }
            else {
                break;
            }
        }
        // Trailing type suffix (L, M, f, d) is consumed but not retained;
        // literal typing is inferred from shape in `parse_value`.
        while let Some(&c) = self.chars.peek() {
            if matches!(c, 'L' | 'M' | 'm' | 'f' | 'F' | 'd' | 'D') {
                self.chars.next();
            }
            else {
                break;
            }
        }
        out
    }

    fn read_ident(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                out.push(c);
                self.chars.next();
            }
            else {
                break;
            }
        }
        out
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_ident(&mut self, expected: &str) -> bool {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case(expected) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn parse_expr(&mut self) -> Result<FilterNode, Error> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<FilterNode, Error> {
        let mut left = self.parse_and()?;
        while self.expect_ident("or") {
            let right = self.parse_and()?;
            left = FilterNode::Logical { op: LogicalOp::Or, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterNode, Error> {
        let mut left = self.parse_unary()?;
        while self.expect_ident("and") {
            let right = self.parse_unary()?;
            left = FilterNode::Logical { op: LogicalOp::And, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterNode, Error> {
        if self.expect_ident("not") {
            return Ok(FilterNode::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterNode, Error> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let lowered = name.to_ascii_lowercase();
                if matches!(lowered.as_str(), "contains" | "startswith" | "endswith") && self.peek_is_lparen_after() {
                    self.parse_text_match(&lowered)
                }
                else if matches!(lowered.as_str(), "exists" | "empty") && self.peek_is_lparen_after() {
                    self.parse_field_function(&lowered)
                }
                else {
                    self.parse_comparison_or_in(name)
                }
            }
            other => Err(QueryError::InvalidFilter(format!("expected filter term, got {other:?}")).into()),
        }
    }

    fn peek_is_lparen_after(&self) -> bool {
        matches!(self.tokens.get(self.pos + 1), Some(Token::LParen))
    }

    fn parse_text_match(&mut self, kind_name: &str) -> Result<FilterNode, Error> {
        self.pos += 1; // function name
        self.expect_lparen()?;
        let field = self.parse_field_name()?;
        self.expect_comma()?;
        let literal = self.parse_string_literal()?;
        self.expect_rparen()?;
        let kind = match kind_name {
            "contains" => TextMatchKind::Contains,
            "startswith" => TextMatchKind::StartsWith,
            "endswith" => TextMatchKind::EndsWith,
            _ => unreachable!(),
        };
        Ok(FilterNode::TextMatch { field, kind, literal })
    }

    fn parse_field_function(&mut self, kind_name: &str) -> Result<FilterNode, Error> {
        self.pos += 1;
        self.expect_lparen()?;
        let field = self.parse_field_name()?;
        self.expect_rparen()?;
        Ok(match kind_name {
            "exists" => FilterNode::Exists { field },
            "empty" => FilterNode::Empty { field },
            _ => unreachable!(),
        })
    }

    fn parse_comparison_or_in(&mut self, field: String) -> Result<FilterNode, Error> {
        let op_token = self.next().ok_or_else(|| QueryError::InvalidFilter("unexpected end of filter".to_string()))?;
        let Token::Ident(op_name) = op_token else {
            return Err(QueryError::InvalidFilter("expected comparison operator".to_string()).into());
        };
        let lowered = op_name.to_ascii_lowercase();
        if lowered == "in" {
            self.expect_lparen()?;
            let mut values = Vec::new();
            loop {
                values.push(self.parse_value()?);
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
            self.expect_rparen()?;
            return Ok(FilterNode::In { field, values });
        }

        let op = match lowered.as_str() {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            other => return Err(QueryError::UnsupportedConstruct(format!("comparison operator '{other}'")).into()),
        };
        let value = self.parse_value()?;
        Ok(FilterNode::Comparison { field, op, value })
    }

    fn parse_field_name(&mut self) -> Result<String, Error> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(QueryError::InvalidFilter(format!("expected field name, got {other:?}")).into()),
        }
    }

    fn parse_string_literal(&mut self) -> Result<String, Error> {
        match self.next() {
            Some(Token::String(s)) => Ok(s),
            other => Err(QueryError::InvalidFilter(format!("expected string literal, got {other:?}")).into()),
        }
    }

    fn parse_value(&mut self) -> Result<Value, Error> {
        match self.next() {
            Some(Token::String(s)) => {
                if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&s) {
                    Ok(Value::DateTimeOffset(dt.to_utc()))
                }
                else {
                    Ok(Value::String(s))
                }
            }
            Some(Token::Ident(ident)) => match ident.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::String(String::new())),
                _ => Err(QueryError::InvalidFilter(format!("unexpected identifier in value position: {ident}")).into()),
            },
            Some(Token::Number(n)) => {
                if n.contains('.') || n.contains('e') || n.contains('E') {
                    n.parse::<f64>()
                        .map(Value::Double)
                        .map_err(|_| QueryError::InvalidFilter(format!("invalid numeric literal '{n}'")).into())
                }
                else {
                    n.parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| QueryError::InvalidFilter(format!("invalid numeric literal '{n}'")).into())
                }
            }
            other => Err(QueryError::InvalidFilter(format!("expected value, got {other:?}")).into()),
        }
    }

    fn expect_lparen(&mut self) -> Result<(), Error> {
        match self.next() {
            Some(Token::LParen) => Ok(()),
            other => Err(QueryError::InvalidFilter(format!("expected '(', got {other:?}")).into()),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), Error> {
        match self.next() {
            Some(Token::RParen) => Ok(()),
            other => Err(QueryError::InvalidFilter(format!("expected ')', got {other:?}")).into()),
        }
    }

    fn expect_comma(&mut self) -> Result<(), Error> {
        match self.next() {
            Some(Token::Comma) => Ok(()),
            other => Err(QueryError::InvalidFilter(format!("expected ',', got {other:?}")).into()),
        }
    }
}

/// Parse a `$filter`-style expression into the portable AST.
pub fn parse_filter(input: &str) -> Result<FilterNode, Error> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser::new(tokens);
    let node = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(QueryError::InvalidFilter("trailing input after filter expression".to_string()).into());
    }
    Ok(node)
}

/// Parse a comma-separated `order_by` clause: `field [asc|desc], ...`.
pub fn parse_order_by(input: &str) -> Result<CompoundSort, Error> {
    let mut clauses = Vec::new();
    for raw_clause in input.split(',') {
        let raw_clause = raw_clause.trim();
        if raw_clause.is_empty() {
            continue;
        }
        let mut parts = raw_clause.split_whitespace();
        let field = parts
            .next()
            .ok_or_else(|| QueryError::InvalidOrderBy(format!("empty clause in '{input}'")))?
            .to_string();
        let direction = match parts.next() {
            None => SortDirection::Asc,
            Some(dir) if dir.eq_ignore_ascii_case("asc") => SortDirection::Asc,
            Some(dir) if dir.eq_ignore_ascii_case("desc") => SortDirection::Desc,
            Some(other) => return Err(QueryError::InvalidOrderBy(format!("unknown sort direction '{other}'")).into()),
        };
        if parts.next().is_some() {
            return Err(QueryError::InvalidOrderBy(format!("malformed clause '{raw_clause}'")).into());
        }
        clauses.push(SingleFieldSort { field, direction });
    }
    Ok(CompoundSort { clauses })
}

/// Parse a comma-separated `select` clause. Names must start with a letter
/// or underscore and contain only letters, digits, `_`, or `.`; anything
/// else is silently dropped rather than erroring (§4.8: "unknown names
/// yield no error").
pub fn parse_select(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter(|s| is_valid_field_name(s))
        .map(|s| s.to_string())
        .collect()
}

fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_comparison() {
        let node = parse_filter("Price gt 200").unwrap();
        assert_eq!(node, FilterNode::Comparison { field: "Price".to_string(), op: CompareOp::Gt, value: Value::Int(200) });
    }

    #[test]
    fn parses_and_of_two_comparisons() {
        let node = parse_filter("Category eq 'Electronics' and Price gt 200").unwrap();
        match node {
            FilterNode::Logical { op: LogicalOp::And, .. } => {}
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn parses_contains_function() {
        let node = parse_filter("contains(Name, 'wid''get')").unwrap();
        assert_eq!(
            node,
            FilterNode::TextMatch { field: "Name".to_string(), kind: TextMatchKind::Contains, literal: "wid'get".to_string() }
        );
    }

    #[test]
    fn parses_not_and_parens() {
        let node = parse_filter("not (Price eq 1 or Price eq 2)").unwrap();
        assert!(matches!(node, FilterNode::Not(_)));
    }

    #[test]
    fn rejects_unsupported_construct() {
        let err = parse_filter("Price foo 1").unwrap_err();
        assert!(matches!(err, Error::Query(QueryError::UnsupportedConstruct(_))));
    }

    #[test]
    fn parses_order_by_with_default_asc() {
        let sort = parse_order_by("Rating desc, Price asc, Name").unwrap();
        assert_eq!(sort.clauses.len(), 3);
        assert_eq!(sort.clauses[0].direction, SortDirection::Desc);
        assert_eq!(sort.clauses[2].direction, SortDirection::Asc);
    }

    #[test]
    fn select_drops_invalid_names_without_erroring() {
        let fields = parse_select("ProductId, 1bad, _ok, Name.nested");
        assert_eq!(fields, vec!["ProductId".to_string(), "_ok".to_string(), "Name.nested".to_string()]);
    }
}
