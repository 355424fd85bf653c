//! Lexer and recursive-descent parser for subscription filters.
//!
//! ```text
//! expr      := or
//! or        := and ("or" and)*
//! and       := unary ("and" unary)*
//! unary     := ("not" | "!") unary | primary
//! primary   := "(" expr ")" | "all" | function | condition
//! function  := ("contains" | "match") "(" field "," string ")"
//! condition := field op literal
//!            | field ["not"] "exists"
//!            | field ["not"] "in" "[" literal ("," literal)* "]"
//! op        := "=" | "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```
//!
//! Fields are dotted paths; a segment containing spaces or dots can be
//! quoted with backticks: ``properties.`Plan Name` = "pro"``.

use super::{Expression, Operator, ParseError};
use crate::event::{FieldPath, Segment};
use serde_json::{Number, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Str(String),
    Num(Number),
    Op(Operator),
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    start: usize,
    end: usize,
}

fn lex(source: &str) -> Result<Vec<Spanned>, ParseError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    let offset = |i: usize| chars.get(i).map(|&(o, _)| o).unwrap_or(source.len());

    while i < chars.len() {
        let (start, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(Spanned {
                token,
                start,
                end: start + c.len_utf8(),
            });
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|&(_, c)| c);

        // Comparison operators
        let op = match (c, next) {
            ('=', Some('=')) => Some((Operator::Eq, 2)),
            ('=', _) => Some((Operator::Eq, 1)),
            ('!', Some('=')) => Some((Operator::Ne, 2)),
            ('<', Some('=')) => Some((Operator::Le, 2)),
            ('<', _) => Some((Operator::Lt, 1)),
            ('>', Some('=')) => Some((Operator::Ge, 2)),
            ('>', _) => Some((Operator::Gt, 1)),
            _ => None,
        };
        if let Some((op, width)) = op {
            i += width;
            tokens.push(Spanned {
                token: Token::Op(op),
                start,
                end: offset(i),
            });
            continue;
        }

        if c == '!' {
            i += 1;
            tokens.push(Spanned {
                token: Token::Bang,
                start,
                end: offset(i),
            });
            continue;
        }

        // String literal
        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            loop {
                let Some(&(_, sc)) = chars.get(i) else {
                    return Err(ParseError::new(
                        "unterminated string literal",
                        &source[start..],
                        start,
                    ));
                };
                i += 1;
                if sc == quote {
                    break;
                }
                if sc == '\\' {
                    let Some(&(_, escaped)) = chars.get(i) else {
                        return Err(ParseError::new(
                            "unterminated escape in string",
                            &source[start..],
                            start,
                        ));
                    };
                    i += 1;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                    continue;
                }
                text.push(sc);
            }
            tokens.push(Spanned {
                token: Token::Str(text),
                start,
                end: offset(i),
            });
            continue;
        }

        // Number literal
        if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) {
            i += 1;
            while let Some(&(_, nc)) = chars.get(i) {
                if nc.is_ascii_digit() || nc == '.' || nc == 'e' || nc == 'E' {
                    i += 1;
                } else {
                    break;
                }
            }
            let end = offset(i);
            let text = &source[start..end];
            let number = parse_number(text)
                .ok_or_else(|| ParseError::new("invalid number", text, start))?;
            tokens.push(Spanned {
                token: Token::Num(number),
                start,
                end,
            });
            continue;
        }

        // Field path: segments separated by '.', optionally backtick-quoted
        if is_field_start(c) || c == '`' {
            let mut segments = Vec::new();
            loop {
                let mut segment = String::new();
                match chars.get(i) {
                    Some(&(qstart, '`')) => {
                        i += 1;
                        loop {
                            match chars.get(i) {
                                Some(&(_, '`')) => {
                                    i += 1;
                                    break;
                                }
                                Some(&(_, sc)) => {
                                    segment.push(sc);
                                    i += 1;
                                }
                                None => {
                                    return Err(ParseError::new(
                                        "unterminated quoted field",
                                        &source[qstart..],
                                        qstart,
                                    ))
                                }
                            }
                        }
                    }
                    _ => {
                        while let Some(&(_, fc)) = chars.get(i) {
                            if is_field_char(fc) {
                                segment.push(fc);
                                i += 1;
                            } else {
                                break;
                            }
                        }
                    }
                }
                if segment.is_empty() {
                    let at = offset(i);
                    return Err(ParseError::new(
                        "empty field segment",
                        &source[start..at],
                        start,
                    ));
                }
                segments.push(segment);

                if chars.get(i).map(|&(_, c)| c) == Some('.') {
                    i += 1;
                    continue;
                }
                break;
            }
            tokens.push(Spanned {
                token: Token::Field(segments),
                start,
                end: offset(i),
            });
            continue;
        }

        return Err(ParseError::new(
            "unexpected character",
            &source[start..start + c.len_utf8()],
            start,
        ));
    }

    tokens.push(Spanned {
        token: Token::Eof,
        start: source.len(),
        end: source.len(),
    });
    Ok(tokens)
}

fn is_field_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_field_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '-'
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(int) = text.parse::<i64>() {
        return Some(Number::from(int));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

/// Parse a subscription filter into an [`Expression`].
pub fn parse(source: &str) -> Result<Expression, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };

    if parser.peek() == &Token::Eof {
        return Err(ParseError::new("empty expression", "", 0));
    }

    let expr = parser.parse_or()?;
    if parser.peek() != &Token::Eof {
        return Err(parser.unexpected("expected 'and', 'or' or end of expression"));
    }
    Ok(expr)
}

/// Deepest nesting of `not` and parentheses a filter may use.
const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn current(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn unexpected(&self, message: &str) -> ParseError {
        let spanned = self.current();
        let fragment = if spanned.token == Token::Eof {
            "end of input"
        } else {
            &self.source[spanned.start..spanned.end]
        };
        ParseError::new(message, fragment, spanned.start)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        is_keyword(self.peek(), keyword)
    }

    fn expect(&mut self, token: Token, message: &str) -> Result<(), ParseError> {
        if self.peek() == &token {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(message))
        }
    }

    fn parse_or(&mut self) -> Result<Expression, ParseError> {
        let mut children = vec![self.parse_and()?];
        while self.at_keyword("or") {
            self.advance();
            children.push(self.parse_and()?);
        }
        Ok(collapse(children, |children| Expression::Or { children }))
    }

    fn parse_and(&mut self) -> Result<Expression, ParseError> {
        let mut children = vec![self.parse_unary()?];
        while self.at_keyword("and") {
            self.advance();
            children.push(self.parse_unary()?);
        }
        Ok(collapse(children, |children| Expression::And { children }))
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.unexpected("expression nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        if self.at_keyword("not") || self.peek() == &Token::Bang {
            return self.nested(|parser| {
                parser.advance();
                let child = parser.parse_unary()?;
                Ok(Expression::Not {
                    child: Box::new(child),
                })
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        match self.peek().clone() {
            Token::LParen => self.nested(|parser| {
                parser.advance();
                let expr = parser.parse_or()?;
                parser.expect(Token::RParen, "expected ')'")?;
                Ok(expr)
            }),
            token if is_keyword(&token, "all") && self.ends_term(1) => {
                self.advance();
                Ok(Expression::All)
            }
            token
                if (is_keyword(&token, "contains") || is_keyword(&token, "match"))
                    && self.peek_at(1) == &Token::LParen =>
            {
                self.parse_function()
            }
            Token::Field(_) => self.parse_condition(),
            _ => Err(self.unexpected("expected a condition")),
        }
    }

    /// True when the token `ahead` positions away closes the current term.
    fn ends_term(&self, ahead: usize) -> bool {
        let token = self.peek_at(ahead);
        matches!(token, Token::Eof | Token::RParen)
            || is_keyword(token, "and")
            || is_keyword(token, "or")
    }

    fn parse_function(&mut self) -> Result<Expression, ParseError> {
        let name = match self.advance() {
            Token::Field(segments) => segments.join("."),
            _ => return Err(self.unexpected("expected a function name")),
        };
        self.expect(Token::LParen, "expected '('")?;
        let field = self.parse_field()?;
        self.expect(Token::Comma, "expected ','")?;
        let argument = match self.peek().clone() {
            Token::Str(text) => {
                self.advance();
                text
            }
            _ => return Err(self.unexpected("expected a string argument")),
        };
        self.expect(Token::RParen, "expected ')'")?;

        Ok(if name.eq_ignore_ascii_case("contains") {
            Expression::Contains {
                field,
                value: argument,
            }
        } else {
            Expression::Match {
                field,
                pattern: argument,
            }
        })
    }

    fn parse_field(&mut self) -> Result<FieldPath, ParseError> {
        match self.peek().clone() {
            Token::Field(segments) => {
                self.advance();
                Ok(field_path(segments))
            }
            _ => Err(self.unexpected("expected a field name")),
        }
    }

    fn parse_condition(&mut self) -> Result<Expression, ParseError> {
        let field = self.parse_field()?;

        let negated = if self.at_keyword("not") {
            self.advance();
            true
        } else {
            false
        };

        let condition = if self.at_keyword("exists") {
            self.advance();
            Expression::Exists { field }
        } else if self.at_keyword("in") {
            self.advance();
            let values = self.parse_list()?;
            Expression::In { field, values }
        } else if negated {
            return Err(self.unexpected("expected 'exists' or 'in' after 'not'"));
        } else {
            let operator = match self.peek().clone() {
                Token::Op(op) => {
                    self.advance();
                    op
                }
                _ => return Err(self.unexpected("expected a comparison operator")),
            };
            let value = self.parse_literal()?;
            Expression::Compare {
                field,
                operator,
                value,
            }
        };

        Ok(if negated {
            Expression::Not {
                child: Box::new(condition),
            }
        } else {
            condition
        })
    }

    fn parse_list(&mut self) -> Result<Vec<Value>, ParseError> {
        self.expect(Token::LBracket, "expected '['")?;
        let mut values = Vec::new();
        if self.peek() == &Token::RBracket {
            self.advance();
            return Ok(values);
        }
        loop {
            values.push(self.parse_literal()?);
            match self.peek() {
                Token::Comma => {
                    self.advance();
                }
                Token::RBracket => {
                    self.advance();
                    return Ok(values);
                }
                _ => return Err(self.unexpected("expected ',' or ']'")),
            }
        }
    }

    fn parse_literal(&mut self) -> Result<Value, ParseError> {
        let value = match self.peek().clone() {
            Token::Str(text) => Value::String(text),
            Token::Num(number) => Value::Number(number),
            token if is_keyword(&token, "true") => Value::Bool(true),
            token if is_keyword(&token, "false") => Value::Bool(false),
            token if is_keyword(&token, "null") => Value::Null,
            _ => return Err(self.unexpected("expected a string, number, boolean or null")),
        };
        self.advance();
        Ok(value)
    }
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    match token {
        Token::Field(segments) => segments.len() == 1 && segments[0].eq_ignore_ascii_case(keyword),
        _ => false,
    }
}

fn field_path(segments: Vec<String>) -> FieldPath {
    let segments = segments
        .into_iter()
        .filter(|s| s != "$")
        .map(Segment::Key)
        .collect();
    FieldPath::from_segments(segments)
}

fn collapse(mut children: Vec<Expression>, build: fn(Vec<Expression>) -> Expression) -> Expression {
    if children.len() == 1 {
        children.remove(0)
    } else {
        build(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_simple_comparison() {
        let expr = parse(r#"type = "track""#).unwrap();
        assert_eq!(
            expr,
            Expression::Compare {
                field: field("type"),
                operator: Operator::Eq,
                value: json!("track"),
            }
        );
    }

    #[test]
    fn test_parse_and_or_precedence() {
        let expr = parse(r#"type = "track" and event = "A" or event = "B""#).unwrap();
        match expr {
            Expression::Or { children } => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], Expression::And { .. }));
            }
            other => panic!("expected or, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_parentheses_and_not() {
        let expr = parse(r#"not (type = "page" or type = "screen")"#).unwrap();
        assert!(matches!(expr, Expression::Not { .. }));
    }

    #[test]
    fn test_parse_exists_and_in() {
        assert_eq!(
            parse("context.traits.email exists").unwrap(),
            Expression::Exists {
                field: field("context.traits.email")
            }
        );
        assert_eq!(
            parse(r#"event in ["A", "B", 3]"#).unwrap(),
            Expression::In {
                field: field("event"),
                values: vec![json!("A"), json!("B"), json!(3)],
            }
        );
        assert!(matches!(
            parse("userId not exists").unwrap(),
            Expression::Not { .. }
        ));
    }

    #[test]
    fn test_parse_functions() {
        assert_eq!(
            parse(r#"contains(event, "Order")"#).unwrap(),
            Expression::Contains {
                field: field("event"),
                value: "Order".into(),
            }
        );
        assert_eq!(
            parse(r#"match(context.page.path, "/docs/*")"#).unwrap(),
            Expression::Match {
                field: field("context.page.path"),
                pattern: "/docs/*".into(),
            }
        );
    }

    #[test]
    fn test_parse_quoted_field_segment() {
        let expr = parse(r#"properties.`Plan Name` = "pro""#).unwrap();
        assert_eq!(
            expr,
            Expression::Compare {
                field: FieldPath::from_segments(vec![
                    Segment::Key("properties".into()),
                    Segment::Key("Plan Name".into())
                ]),
                operator: Operator::Eq,
                value: json!("pro"),
            }
        );
    }

    #[test]
    fn test_parse_all_and_literals() {
        assert_eq!(parse("all").unwrap(), Expression::All);
        assert_eq!(
            parse("properties.revenue >= -1.5").unwrap(),
            Expression::Compare {
                field: field("properties.revenue"),
                operator: Operator::Ge,
                value: json!(-1.5),
            }
        );
        assert_eq!(
            parse("context.active != false").unwrap(),
            Expression::Compare {
                field: field("context.active"),
                operator: Operator::Ne,
                value: json!(false),
            }
        );
    }

    #[test]
    fn test_parse_errors_name_fragment() {
        let err = parse(r#"type = "track" and"#).unwrap_err();
        assert_eq!(err.fragment, "end of input");

        let err = parse(r#"type ~ "track""#).unwrap_err();
        assert_eq!(err.fragment, "~");
        assert_eq!(err.position, 5);

        let err = parse(r#"type = "track"#).unwrap_err();
        assert!(err.message.contains("unterminated"));

        let err = parse(r#"type = "a" "b""#).unwrap_err();
        assert_eq!(err.fragment, "\"b\"");

        assert!(parse("   ").is_err());
        assert!(parse("(type = \"a\"").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let err = parse(&format!("{}all", "!".repeat(200_000))).unwrap_err();
        assert_eq!(err.message, "expression nested too deeply");
        assert_eq!(err.fragment, "!");

        let err = parse(&format!("{}all{}", "(".repeat(200_000), ")".repeat(200_000))).unwrap_err();
        assert_eq!(err.message, "expression nested too deeply");

        let err = parse(&format!("{}type exists", "not ".repeat(100))).unwrap_err();
        assert_eq!(err.fragment, "not");
    }

    #[test]
    fn test_moderate_nesting_parses() {
        let expr = parse(&format!("{}all", "!".repeat(10))).unwrap();
        assert!(matches!(expr, Expression::Not { .. }));

        let source = format!("{}type = \"track\"{}", "(".repeat(10), ")".repeat(10));
        assert!(matches!(parse(&source).unwrap(), Expression::Compare { .. }));
    }
}
