// Expression Parser
// Parses tokens into an AST for workflow expressions

use crate::error::EvaluationError;
use crate::expression::lexer::{Lexer, Spanned, Token};

use std::fmt;

/// Abstract Syntax Tree node for expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),

    /// Context reference: github.ref, needs['build'].outputs, labels.*.name
    Reference(Reference),

    /// Function call: contains(a, b). Names are matched case-insensitively.
    FunctionCall { name: String, args: Vec<Expr> },

    /// Path into a computed value: fromJSON(x).include[0], fromJSON(x).*.name
    Access {
        object: Box<Expr>,
        parts: Vec<ReferencePart>,
    },

    Not(Box<Expr>),

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Path into the context snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub parts: Vec<ReferencePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferencePart {
    Property(String),
    Index(Box<Expr>),
    /// `.*` object filter
    Wildcard,
}

impl Reference {
    pub fn new(name: String) -> Self {
        Self {
            parts: vec![ReferencePart::Property(name)],
        }
    }

    pub fn with_property(mut self, name: String) -> Self {
        self.parts.push(ReferencePart::Property(name));
        self
    }

    /// Root context name (`github`, `needs`, ...)
    pub fn root(&self) -> &str {
        match self.parts.first() {
            Some(ReferencePart::Property(name)) => name,
            _ => "",
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            match part {
                ReferencePart::Property(name) if i == 0 => write!(f, "{}", name)?,
                ReferencePart::Property(name) => write!(f, ".{}", name)?,
                ReferencePart::Index(expr) => match expr.as_ref() {
                    Expr::String(s) => write!(f, "['{}']", s)?,
                    Expr::Number(n) => write!(f, "[{}]", n)?,
                    _ => write!(f, "[..]")?,
                },
                ReferencePart::Wildcard => write!(f, ".*")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq, // ==
    Ne, // !=
    Lt, // <
    Le, // <=
    Gt, // >
    Ge, // >=

    And, // &&
    Or,  // ||
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "=="),
            BinaryOp::Ne => write!(f, "!="),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::Le => write!(f, "<="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::Ge => write!(f, ">="),
            BinaryOp::And => write!(f, "&&"),
            BinaryOp::Or => write!(f, "||"),
        }
    }
}

const STATUS_FUNCTIONS: [&str; 4] = ["success", "failure", "cancelled", "always"];

impl Expr {
    /// True if a status check function appears anywhere in the expression
    pub fn uses_status_function(&self) -> bool {
        match self {
            Expr::FunctionCall { name, args } => {
                STATUS_FUNCTIONS.contains(&name.to_ascii_lowercase().as_str())
                    || args.iter().any(Expr::uses_status_function)
            }
            Expr::Reference(reference) => reference.parts.iter().any(|part| match part {
                ReferencePart::Index(expr) => expr.uses_status_function(),
                _ => false,
            }),
            Expr::Access { object, parts } => {
                object.uses_status_function()
                    || parts.iter().any(|part| match part {
                        ReferencePart::Index(expr) => expr.uses_status_function(),
                        _ => false,
                    })
            }
            Expr::Not(inner) => inner.uses_status_function(),
            Expr::Binary { left, right, .. } => {
                left.uses_status_function() || right.uses_status_function()
            }
            Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::String(_) => false,
        }
    }
}

pub struct ExprParser {
    tokens: Vec<Spanned>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse_str(input: &str) -> Result<Expr, EvaluationError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    pub fn parse(&mut self) -> Result<Expr, EvaluationError> {
        if self.check(&Token::Eof) {
            return Err(self.error("empty expression"));
        }

        let expr = self.parse_or()?;

        if !self.check(&Token::Eof) {
            return Err(self.error(&format!("unexpected token {}", self.peek())));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. Or: ||
    // 2. And: &&
    // 3. Equality: == !=
    // 4. Comparison: < <= > >=
    // 5. Unary: !
    // 6. Postfix: . [] .*

    fn parse_or(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_and()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_equality()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };

            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };

            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvaluationError> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(expr)));
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvaluationError> {
        let mut expr = self.parse_primary()?;

        loop {
            let part = if self.check(&Token::Dot) {
                self.advance();
                match self.advance().clone() {
                    Token::Identifier(property) => ReferencePart::Property(property),
                    Token::Star => ReferencePart::Wildcard,
                    // keywords are valid property names: steps.null.outputs
                    keyword @ (Token::Null | Token::True | Token::False) => {
                        ReferencePart::Property(keyword.to_string())
                    }
                    _ => return Err(self.error("expected property name after '.'")),
                }
            } else if self.check(&Token::LBracket) {
                self.advance();
                let index = self.parse_or()?;
                self.expect(&Token::RBracket, "expected ']'")?;
                ReferencePart::Index(Box::new(index))
            } else {
                break;
            };

            expr = match expr {
                Expr::Reference(mut r) => {
                    r.parts.push(part);
                    Expr::Reference(r)
                }
                Expr::Access { object, mut parts } => {
                    parts.push(part);
                    Expr::Access { object, parts }
                }
                other => Expr::Access {
                    object: Box::new(other),
                    parts: vec![part],
                },
            };
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvaluationError> {
        match self.peek().clone() {
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::String(s))
            }
            Token::Identifier(name) => {
                self.advance();

                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::FunctionCall { name, args })
                } else {
                    Ok(Expr::Reference(Reference::new(name)))
                }
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            token => Err(self.error(&format!("unexpected token {}", token))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, EvaluationError> {
        self.expect(&Token::LParen, "expected '('")?;

        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            args.push(self.parse_or()?);

            while self.check(&Token::Comma) {
                self.advance();
                if self.check(&Token::RParen) {
                    break; // trailing comma
                }
                args.push(self.parse_or()?);
            }
        }

        self.expect(&Token::RParen, "expected ')'")?;
        Ok(args)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self
            .tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof);
        self.position += 1;
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), EvaluationError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn error(&self, message: &str) -> EvaluationError {
        let position = self
            .tokens
            .get(self.position.min(self.tokens.len().saturating_sub(1)))
            .map(|s| s.position)
            .unwrap_or(0);
        EvaluationError::syntax(message, position)
    }
}
