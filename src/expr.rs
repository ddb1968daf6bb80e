//! Boolean condition engine used by the rule system
//!
//! Conditions are compiled once at startup into a small AST and evaluated
//! per request against variable bindings. Every bound value is a string;
//! the comparison operators (`==`, `!=`, `<`, `>`) compare strings, so
//! numeric literals compare as strings too. `&&` and `||` require boolean
//! operands and short-circuit.

use std::fmt;

/// Variable lookup used during evaluation.
pub trait Vars {
    fn get(&self, name: &str) -> Option<&str>;
}

/// Result of evaluating a (sub)expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Str(&'a str),
    Bool(bool),
}

impl Value<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Gt,
    And,
    Or,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::And => "&&",
            BinOp::Or => "||",
        };
        f.write_str(s)
    }
}

/// A compiled condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String literal. Numeric literals are kept in their source form.
    Str(String),
    /// Free variable, resolved through [`Vars`] at evaluation time.
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    Parse(String),
    UnknownVar(String),
    TypeMismatch { op: BinOp, lhs: &'static str, rhs: &'static str },
    NotBoolean,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::Parse(msg) => write!(f, "parse error: {}", msg),
            ExprError::UnknownVar(name) => write!(f, "unknown variable '{}'", name),
            ExprError::TypeMismatch { op, lhs, rhs } => {
                write!(f, "operator '{}' cannot be applied to {} and {}", op, lhs, rhs)
            }
            ExprError::NotBoolean => write!(f, "condition does not evaluate to a boolean"),
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Ident(String),
    Op(BinOp),
    LParen,
    RParen,
}

fn lex(input: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' => i += 1,
            b'(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            b'\'' => {
                let start = i + 1;
                let end = bytes[start..]
                    .iter()
                    .position(|&b| b == b'\'')
                    .map(|p| start + p)
                    .ok_or_else(|| ExprError::Parse("unterminated string literal".to_string()))?;
                tokens.push(Token::Literal(input[start..end].to_string()));
                i = end + 1;
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(BinOp::Eq));
                    i += 2;
                } else {
                    return Err(ExprError::Parse("expected '==' after '='".to_string()));
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(BinOp::Ne));
                    i += 2;
                } else {
                    return Err(ExprError::Parse("expected '!=' after '!'".to_string()));
                }
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::Op(BinOp::And));
                    i += 2;
                } else {
                    return Err(ExprError::Parse("expected '&&' after '&'".to_string()));
                }
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::Op(BinOp::Or));
                    i += 2;
                } else {
                    return Err(ExprError::Parse("expected '||' after '|'".to_string()));
                }
            }
            b'<' => {
                tokens.push(Token::Op(BinOp::Lt));
                i += 1;
            }
            b'>' => {
                tokens.push(Token::Op(BinOp::Gt));
                i += 1;
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                tokens.push(Token::Literal(input[start..i].to_string()));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            _ => {
                return Err(ExprError::Parse(format!(
                    "unexpected character '{}'",
                    c as char
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinOp::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Token::Op(BinOp::And)) {
            self.advance();
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_primary()?;
        while let Some(&Token::Op(op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt))) =
            self.peek()
        {
            self.advance();
            let rhs = self.parse_primary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Parse("expected ')'".to_string())),
                }
            }
            Some(Token::Literal(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(s)) => Ok(Expr::Ident(s)),
            Some(tok) => Err(ExprError::Parse(format!("unexpected token {:?}", tok))),
            None => Err(ExprError::Parse("unexpected end of condition".to_string())),
        }
    }
}

/// Compile a condition string into an [`Expr`].
pub fn compile(input: &str) -> Result<Expr, ExprError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Parse("empty condition".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "trailing input after condition: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

impl Expr {
    pub fn eval<'a>(&'a self, vars: &'a dyn Vars) -> Result<Value<'a>, ExprError> {
        match self {
            Expr::Str(s) => Ok(Value::Str(s)),
            Expr::Ident(name) => vars
                .get(name)
                .map(Value::Str)
                .ok_or_else(|| ExprError::UnknownVar(name.clone())),
            Expr::Binary { op, lhs, rhs } => match op {
                BinOp::And => {
                    if !as_bool(lhs.eval(vars)?, *op)? {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(as_bool(rhs.eval(vars)?, *op)?))
                }
                BinOp::Or => {
                    if as_bool(lhs.eval(vars)?, *op)? {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(as_bool(rhs.eval(vars)?, *op)?))
                }
                BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt => {
                    let l = lhs.eval(vars)?;
                    let r = rhs.eval(vars)?;
                    compare(*op, l, r)
                }
            },
        }
    }

    /// Evaluate to a boolean, rejecting string-valued conditions.
    pub fn eval_bool(&self, vars: &dyn Vars) -> Result<bool, ExprError> {
        match self.eval(vars)? {
            Value::Bool(b) => Ok(b),
            Value::Str(_) => Err(ExprError::NotBoolean),
        }
    }
}

fn as_bool(v: Value<'_>, op: BinOp) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(b),
        Value::Str(_) => Err(ExprError::TypeMismatch {
            op,
            lhs: "string",
            rhs: "string",
        }),
    }
}

fn compare<'a>(op: BinOp, l: Value<'a>, r: Value<'a>) -> Result<Value<'a>, ExprError> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => {
            let result = match op {
                BinOp::Eq => a == b,
                BinOp::Ne => a != b,
                BinOp::Lt => a < b,
                BinOp::Gt => a > b,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        (Value::Bool(a), Value::Bool(b)) if matches!(op, BinOp::Eq | BinOp::Ne) => {
            Ok(Value::Bool(if op == BinOp::Eq { a == b } else { a != b }))
        }
        (l, r) => Err(ExprError::TypeMismatch {
            op,
            lhs: l.type_name(),
            rhs: r.type_name(),
        }),
    }
}
