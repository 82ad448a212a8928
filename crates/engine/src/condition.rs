//! GOM pre/postcondition language.
//!
//! ```text
//! orders/schema.state == MODIFIED && !(billing/schema.version < 3)
//! ```
//!
//! A condition compares fields of coherence rows (`state`, `version`,
//! `consistency`) against literals and combines comparisons with `!`, `&&`,
//! `||` and parentheses. Evaluation is read-only. A pair without a row reads
//! as `INVALID` at version 0 with the default consistency type.

use std::collections::BTreeMap;
use std::fmt;

use megamodel_storage::{CoherenceRecord, CoherenceState, ConsistencyType, StateKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid condition `{condition}`: {message} at column {column}")]
pub struct ConditionError {
    pub condition: String,
    pub column: usize,
    pub message: String,
}

// ──────────────────────────────────────────────
// Syntax tree
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    fn is_ordering(&self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Neq)
    }

    fn holds<T: PartialOrd>(&self, left: T, right: T) -> bool {
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Neq => left != right,
            CmpOp::Lt => left < right,
            CmpOp::Lte => left <= right,
            CmpOp::Gt => left > right,
            CmpOp::Gte => left >= right,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CmpOp::Eq => "==",
            CmpOp::Neq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    State(CoherenceState),
    Consistency(ConsistencyType),
    Version(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Bool(bool),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        key: StateKey,
        op: CmpOp,
        value: Literal,
    },
}

/// A parsed condition, ready to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    text: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        let tokens = lex(text)?;
        let mut parser = Parser {
            text,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;
        match parser.peek() {
            Token::Eof => Ok(Condition {
                text: text.to_string(),
                expr,
            }),
            other => Err(parser.error(format!("unexpected {other}"))),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Every (microservice, component) pair the condition reads.
    pub fn references(&self) -> Vec<StateKey> {
        fn walk(expr: &Expr, out: &mut Vec<StateKey>) {
            match expr {
                Expr::Bool(_) => {}
                Expr::Not(inner) => walk(inner, out),
                Expr::And(l, r) | Expr::Or(l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                Expr::Compare { key, .. } => {
                    if !out.contains(key) {
                        out.push(key.clone());
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.expr, &mut out);
        out
    }

    pub fn evaluate(
        &self,
        rows: &BTreeMap<StateKey, CoherenceRecord>,
        default_consistency: ConsistencyType,
    ) -> bool {
        eval(&self.expr, rows, default_consistency)
    }
}

fn eval(
    expr: &Expr,
    rows: &BTreeMap<StateKey, CoherenceRecord>,
    default_consistency: ConsistencyType,
) -> bool {
    match expr {
        Expr::Bool(b) => *b,
        Expr::Not(inner) => !eval(inner, rows, default_consistency),
        Expr::And(l, r) => {
            eval(l, rows, default_consistency) && eval(r, rows, default_consistency)
        }
        Expr::Or(l, r) => {
            eval(l, rows, default_consistency) || eval(r, rows, default_consistency)
        }
        Expr::Compare { key, op, value } => {
            let row = rows.get(key);
            match value {
                Literal::State(expected) => {
                    let state = row.map_or(CoherenceState::Invalid, |r| r.state);
                    op.holds(state, *expected)
                }
                Literal::Consistency(expected) => {
                    let consistency = row.map_or(default_consistency, |r| r.consistency_type);
                    op.holds(consistency, *expected)
                }
                Literal::Version(expected) => {
                    let version = row.map_or(0, |r| r.version);
                    op.holds(version, *expected)
                }
            }
        }
    }
}

// ──────────────────────────────────────────────
// Lexer
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// References, literals and the keywords `true` / `false`.
    Word(String),
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CmpOp),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "`{w}`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Not => f.write_str("`!`"),
            Token::And => f.write_str("`&&`"),
            Token::Or => f.write_str("`||`"),
            Token::Op(op) => write!(f, "`{op}`"),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    column: usize,
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !"()!=<>&|".contains(c)
}

fn lex(text: &str) -> Result<Vec<Spanned>, ConditionError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0usize;
    let err = |column: usize, message: String| ConditionError {
        condition: text.to_string(),
        column,
        message,
    };

    while pos < chars.len() {
        let c = chars[pos];
        let column = pos + 1;
        let next = chars.get(pos + 1).copied();

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('!', Some('=')) => (Token::Op(CmpOp::Neq), 2),
            ('!', _) => (Token::Not, 1),
            ('=', Some('=')) => (Token::Op(CmpOp::Eq), 2),
            ('<', Some('=')) => (Token::Op(CmpOp::Lte), 2),
            ('<', _) => (Token::Op(CmpOp::Lt), 1),
            ('>', Some('=')) => (Token::Op(CmpOp::Gte), 2),
            ('>', _) => (Token::Op(CmpOp::Gt), 1),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=' | '&' | '|', _) => {
                return Err(err(column, format!("unexpected character '{c}'")));
            }
            _ => {
                let start = pos;
                while pos < chars.len() && is_word_char(chars[pos]) {
                    pos += 1;
                }
                tokens.push(Spanned {
                    token: Token::Word(chars[start..pos].iter().collect()),
                    column,
                });
                continue;
            }
        };
        tokens.push(Spanned { token, column });
        pos += width;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        column: chars.len() + 1,
    });
    Ok(tokens)
}

// ──────────────────────────────────────────────
// Parser
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    State,
    Version,
    Consistency,
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: String) -> ConditionError {
        ConditionError {
            condition: self.text.to_string(),
            column: self.tokens[self.pos.min(self.tokens.len() - 1)].column,
            message,
        }
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek().clone() {
            Token::Not => {
                self.advance();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Token::LParen => {
                self.advance();
                let inner = self.expr()?;
                match self.peek() {
                    Token::RParen => {
                        self.advance();
                        Ok(inner)
                    }
                    other => Err(self.error(format!("expected `)`, found {other}"))),
                }
            }
            Token::Word(word) if word == "true" || word == "false" => {
                self.advance();
                Ok(Expr::Bool(word == "true"))
            }
            Token::Word(word) => self.compare(&word),
            other => Err(self.error(format!("expected a condition, found {other}"))),
        }
    }

    fn compare(&mut self, word: &str) -> Result<Expr, ConditionError> {
        let (key, field) = self.reference(word)?;
        self.advance();

        let op = match self.peek() {
            Token::Op(op) => *op,
            other => return Err(self.error(format!("expected a comparison, found {other}"))),
        };
        if op.is_ordering() && field != Field::Version {
            return Err(self.error(format!("operator `{op}` only applies to version")));
        }
        self.advance();

        let literal = match self.peek() {
            Token::Word(w) => w.clone(),
            other => return Err(self.error(format!("expected a value, found {other}"))),
        };
        let value = match field {
            Field::State => literal.parse().map(Literal::State),
            Field::Consistency => literal.parse().map(Literal::Consistency),
            Field::Version => literal
                .parse()
                .map(Literal::Version)
                .map_err(|_| format!("expected a version number, found `{literal}`")),
        }
        .map_err(|message| self.error(message))?;
        self.advance();

        Ok(Expr::Compare { key, op, value })
    }

    fn reference(&self, word: &str) -> Result<(StateKey, Field), ConditionError> {
        let malformed = || {
            self.error(format!(
                "expected `<microservice>/<component>.<field>`, found `{word}`"
            ))
        };
        let (pair, field) = word.rsplit_once('.').ok_or_else(malformed)?;
        let (microservice, component) = pair.split_once('/').ok_or_else(malformed)?;
        if microservice.is_empty() || component.is_empty() {
            return Err(malformed());
        }
        let field = match field {
            "state" => Field::State,
            "version" => Field::Version,
            "consistency" => Field::Consistency,
            other => return Err(self.error(format!("unknown field `{other}`"))),
        };
        Ok((StateKey::new(microservice, component), field))
    }
}
