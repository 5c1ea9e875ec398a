// Expression Lexer
// Tokenizes the ${{ }} expression language and splits templates into text/expression segments

use std::fmt;

use crate::error::EvaluationError;

/// Token types for workflow expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    // Identifiers and references
    Identifier(String),

    // Operators
    Star,  // *
    Eq,    // ==
    Ne,    // !=
    Lt,    // <
    Le,    // <=
    Gt,    // >
    Ge,    // >=
    And,   // &&
    Or,    // ||
    Not,   // !
    Dot,   // .
    Comma, // ,

    // Delimiters
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Star => write!(f, "*"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// A token together with its byte offset in the source expression
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
    len: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
            len: input.len(),
        }
    }

    /// Tokenize the entire input. The last token is always `Eof`.
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, EvaluationError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(Spanned {
                token,
                position: self.position,
            });
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, EvaluationError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            self.position = self.len;
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '*' => self.single(Token::Star),
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '[' => self.single(Token::LBracket),
            ']' => self.single(Token::RBracket),

            '=' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Eq)
                } else {
                    Err(EvaluationError::syntax("expected '==' operator", pos))
                }
            }
            '!' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Not)
                }
            }
            '<' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Le)
                } else {
                    Ok(Token::Lt)
                }
            }
            '>' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Ge)
                } else {
                    Ok(Token::Gt)
                }
            }
            '&' => {
                self.advance();
                if self.peek_char() == Some('&') {
                    self.advance();
                    Ok(Token::And)
                } else {
                    Err(EvaluationError::syntax("expected '&&' operator", pos))
                }
            }
            '|' => {
                self.advance();
                if self.peek_char() == Some('|') {
                    self.advance();
                    Ok(Token::Or)
                } else {
                    Err(EvaluationError::syntax("expected '||' operator", pos))
                }
            }

            '\'' => self.read_string(),

            '-' => {
                let mut ahead = self.chars.clone();
                ahead.next();
                match ahead.peek() {
                    Some(&(_, next)) if next.is_ascii_digit() || next == '.' => self.read_number(),
                    _ => Err(EvaluationError::syntax("unexpected '-'", pos)),
                }
            }
            '0'..='9' => self.read_number(),

            'a'..='z' | 'A'..='Z' | '_' => self.read_identifier(),

            _ => Err(EvaluationError::syntax(
                format!("unexpected character '{}'", ch),
                pos,
            )),
        }
    }

    fn single(&mut self, token: Token) -> Result<Token, EvaluationError> {
        self.advance();
        Ok(token)
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self) -> Result<Token, EvaluationError> {
        let start = self.position;
        self.advance(); // opening quote

        let mut value = String::new();

        loop {
            match self.chars.peek() {
                Some(&(_, '\'')) => {
                    self.advance();
                    // '' is an escaped quote
                    if self.peek_char() == Some('\'') {
                        value.push('\'');
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(&(_, ch)) => {
                    value.push(ch);
                    self.advance();
                }
                None => {
                    return Err(EvaluationError::syntax("unterminated string", start));
                }
            }
        }

        Ok(Token::String(value))
    }

    fn read_number(&mut self) -> Result<Token, EvaluationError> {
        let start = self.position;
        let mut text = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '+') {
                // a sign is only part of the literal at the start or after an exponent
                if matches!(ch, '-' | '+')
                    && !(text.is_empty() || (text.ends_with(['e', 'E']) && !is_hex(&text)))
                {
                    break;
                }
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        parse_number_literal(&text)
            .map(Token::Number)
            .ok_or_else(|| EvaluationError::syntax(format!("invalid number '{}'", text), start))
    }

    fn read_identifier(&mut self) -> Result<Token, EvaluationError> {
        let mut ident = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let token = match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        };

        Ok(token)
    }
}

fn is_hex(text: &str) -> bool {
    let unsigned = text.strip_prefix('-').unwrap_or(text);
    unsigned.starts_with("0x") || unsigned.starts_with("0X")
}

/// Parse a numeric literal: decimal, exponent or `0x` hex, optionally negative.
pub fn parse_number_literal(text: &str) -> Option<f64> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let value = if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()? as f64
    } else {
        if unsigned.is_empty()
            || !unsigned
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
        {
            return None;
        }
        unsigned.parse::<f64>().ok()?
    };

    Some(if negative { -value } else { value })
}

/// A piece of a template string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text copied as-is
    Text(String),
    /// Source of a `${{ ... }}` expression, trimmed
    Expression(String),
}

/// Split a template into literal text and `${{ }}` expressions.
///
/// Quotes inside an expression are honoured so `'}}'` does not close it.
pub fn split_template(input: &str) -> Result<Vec<Segment>, EvaluationError> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = input;
    let mut offset = 0;

    while let Some(start) = rest.find("${{") {
        text.push_str(&rest[..start]);
        let body = &rest[start + 3..];

        let end = find_closing(body).ok_or_else(|| {
            EvaluationError::syntax("unterminated '${{' expression", offset + start)
        })?;

        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Expression(body[..end].trim().to_string()));

        let consumed = start + 3 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    Ok(segments)
}

fn find_closing(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }

    None
}

/// True if the string contains at least one `${{` opener
pub fn has_expressions(input: &str) -> bool {
    input.contains("${{")
}
