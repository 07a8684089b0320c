//! Condition expression language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! Expr       ::= OrExpr
//! OrExpr     ::= AndExpr ( '||' AndExpr )*
//! AndExpr    ::= Unary ( '&&' Unary )*
//! Unary      ::= '!' Unary | Primary
//! Primary    ::= '(' Expr ')' | Operand ( CmpOp Operand )?
//! Operand    ::= '${' identifier '}' | QuotedString | Number | 'true' | 'false'
//! CmpOp      ::= '==' | '!=' | '<' | '<=' | '>' | '>='
//! ```
//!
//! Evaluation is pure, against a snapshot of session values. An undefined
//! variable reference compares as a type-appropriate zero value (empty
//! string / 0 / false) instead of erroring, so conditions written against
//! variables that have not resolved yet are tolerated. `&&` and `||`
//! short-circuit left to right.

use std::collections::HashMap;

use roundtable_types::EngineError;
use serde_json::Value;

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum CondExpr {
    Or(Box<CondExpr>, Box<CondExpr>),
    And(Box<CondExpr>, Box<CondExpr>),
    Not(Box<CondExpr>),
    Cmp {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },
    /// A bare operand used in boolean position, e.g. `${approved}`.
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn make_error(msg: &str) -> EngineError {
    EngineError::DefinitionError(format!("condition parse error: {msg}"))
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Str(String),
    Num(f64),
    Bool(bool),
    OrOr,
    AndAnd,
    Not,
    LParen,
    RParen,
    Op(CmpOp),
}

fn tokenize(input: &str) -> Result<Vec<Token>, EngineError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'$' => {
                if i + 1 >= bytes.len() || bytes[i + 1] != b'{' {
                    return Err(make_error("'$' must begin a '${name}' reference"));
                }
                let rest = &input[i + 2..];
                let end = rest
                    .find('}')
                    .ok_or_else(|| make_error("unterminated '${' reference"))?;
                let name = &rest[..end];
                if name.is_empty()
                    || !name.chars().all(|c| c.is_alphanumeric() || c == '_')
                {
                    return Err(make_error(&format!("invalid variable name: '{name}'")));
                }
                tokens.push(Token::Var(name.to_string()));
                i += 2 + end + 1;
            }
            quote @ (b'"' | b'\'') => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(make_error("unterminated string literal"));
                }
                tokens.push(Token::Str(input[i + 1..j].to_string()));
                i = j + 1;
            }
            b'|' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'|' {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(make_error("single '|' is not an operator"));
                }
            }
            b'&' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'&' {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(make_error("single '&' is not an operator"));
                }
            }
            b'!' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            b'=' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err(make_error("use '==' for equality"));
                }
            }
            b'<' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            b'>' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            b'(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == b'-' => {
                let mut j = i + 1;
                while j < bytes.len()
                    && (bytes[j].is_ascii_digit() || bytes[j] == b'.')
                {
                    j += 1;
                }
                let text = &input[i..j];
                let num = text
                    .parse::<f64>()
                    .map_err(|_| make_error(&format!("invalid number: '{text}'")))?;
                tokens.push(Token::Num(num));
                i = j;
            }
            c if c.is_ascii_alphabetic() => {
                let mut j = i + 1;
                while j < bytes.len()
                    && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_')
                {
                    j += 1;
                }
                match &input[i..j] {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    word => {
                        return Err(make_error(&format!(
                            "bare word '{word}'; variable references use ${{name}}"
                        )))
                    }
                }
                i = j;
            }
            c => {
                return Err(make_error(&format!(
                    "unexpected character '{}'",
                    c as char
                )))
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser — recursive descent matching the grammar above
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn or_expr(&mut self) -> Result<CondExpr, EngineError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.and_expr()?;
            left = CondExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<CondExpr, EngineError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.unary()?;
            left = CondExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<CondExpr, EngineError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.unary()?;
            return Ok(CondExpr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<CondExpr, EngineError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.or_expr()?;
            match self.next() {
                Some(Token::RParen) => return Ok(inner),
                _ => return Err(make_error("missing ')'")),
            }
        }

        let lhs = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.operand()?;
            Ok(CondExpr::Cmp { lhs, op, rhs })
        } else {
            Ok(CondExpr::Truthy(lhs))
        }
    }

    fn operand(&mut self) -> Result<Operand, EngineError> {
        match self.next() {
            Some(Token::Var(name)) => Ok(Operand::Var(name)),
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Num(n)) => Ok(Operand::Num(n)),
            Some(Token::Bool(b)) => Ok(Operand::Bool(b)),
            Some(other) => Err(make_error(&format!("expected operand, got {other:?}"))),
            None => Err(make_error("expected operand, got end of input")),
        }
    }
}

/// Parse a condition string into a [`CondExpr`].
///
/// An empty or whitespace-only input produces an expression that is always
/// true.
pub fn parse_condition(input: &str) -> Result<CondExpr, EngineError> {
    if input.trim().is_empty() {
        return Ok(CondExpr::Truthy(Operand::Bool(true)));
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(make_error(&format!(
            "trailing tokens after expression in '{input}'"
        )));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum CondValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

fn resolve_operand(operand: &Operand, values: &HashMap<String, Value>) -> CondValue {
    match operand {
        Operand::Str(s) => CondValue::Str(s.clone()),
        Operand::Num(n) => CondValue::Num(*n),
        Operand::Bool(b) => CondValue::Bool(*b),
        Operand::Var(name) => match values.get(name) {
            None | Some(Value::Null) => CondValue::Null,
            Some(Value::String(s)) => CondValue::Str(s.clone()),
            Some(Value::Number(n)) => CondValue::Num(n.as_f64().unwrap_or(0.0)),
            Some(Value::Bool(b)) => CondValue::Bool(*b),
            // Structured values compare by their JSON text.
            Some(other) => CondValue::Str(other.to_string()),
        },
    }
}

/// Substitute the type-appropriate zero value for null, judged against the
/// other side of the comparison.
fn zero_for(other: &CondValue) -> CondValue {
    match other {
        CondValue::Str(_) => CondValue::Str(String::new()),
        CondValue::Num(_) => CondValue::Num(0.0),
        CondValue::Bool(_) => CondValue::Bool(false),
        CondValue::Null => CondValue::Str(String::new()),
    }
}

fn compare(lhs: CondValue, op: CmpOp, rhs: CondValue) -> bool {
    let (lhs, rhs) = match (&lhs, &rhs) {
        (CondValue::Null, _) => (zero_for(&rhs), rhs),
        (_, CondValue::Null) => {
            let z = zero_for(&lhs);
            (lhs, z)
        }
        _ => (lhs, rhs),
    };

    let ordering = match (&lhs, &rhs) {
        (CondValue::Num(a), CondValue::Num(b)) => a.partial_cmp(b),
        (CondValue::Bool(a), CondValue::Bool(b)) => a.partial_cmp(b),
        (CondValue::Str(a), CondValue::Str(b)) => a.partial_cmp(b),
        // Mixed string/number: numeric when the string parses as a number,
        // otherwise compare display forms.
        (CondValue::Str(s), CondValue::Num(n)) => match s.parse::<f64>() {
            Ok(a) => a.partial_cmp(n),
            Err(_) => s.as_str().partial_cmp(display(&rhs).as_str()),
        },
        (CondValue::Num(n), CondValue::Str(s)) => match s.parse::<f64>() {
            Ok(b) => n.partial_cmp(&b),
            Err(_) => display(&lhs).as_str().partial_cmp(s.as_str()),
        },
        _ => display(&lhs).as_str().partial_cmp(display(&rhs).as_str()),
    };

    match (ordering, op) {
        (Some(o), CmpOp::Eq) => o.is_eq(),
        (Some(o), CmpOp::Ne) => o.is_ne(),
        (Some(o), CmpOp::Lt) => o.is_lt(),
        (Some(o), CmpOp::Le) => o.is_le(),
        (Some(o), CmpOp::Gt) => o.is_gt(),
        (Some(o), CmpOp::Ge) => o.is_ge(),
        // NaN comparisons: only `!=` holds.
        (None, CmpOp::Ne) => true,
        (None, _) => false,
    }
}

fn display(v: &CondValue) -> String {
    match v {
        CondValue::Str(s) => s.clone(),
        CondValue::Num(n) => n.to_string(),
        CondValue::Bool(b) => b.to_string(),
        CondValue::Null => String::new(),
    }
}

fn truthy(v: CondValue) -> bool {
    match v {
        CondValue::Bool(b) => b,
        CondValue::Num(n) => n != 0.0,
        CondValue::Str(s) => !s.is_empty(),
        CondValue::Null => false,
    }
}

/// Evaluate a parsed condition against a snapshot of session values.
pub fn evaluate_condition(expr: &CondExpr, values: &HashMap<String, Value>) -> bool {
    match expr {
        CondExpr::Or(a, b) => {
            evaluate_condition(a, values) || evaluate_condition(b, values)
        }
        CondExpr::And(a, b) => {
            evaluate_condition(a, values) && evaluate_condition(b, values)
        }
        CondExpr::Not(inner) => !evaluate_condition(inner, values),
        CondExpr::Cmp { lhs, op, rhs } => compare(
            resolve_operand(lhs, values),
            *op,
            resolve_operand(rhs, values),
        ),
        CondExpr::Truthy(operand) => truthy(resolve_operand(operand, values)),
    }
}

/// Parse and evaluate in one step. A condition that fails to parse evaluates
/// to `false`; load-time validation reports the syntax error separately.
pub fn check_condition(input: &str, values: &HashMap<String, Value>) -> bool {
    match parse_condition(input) {
        Ok(expr) => evaluate_condition(&expr, values),
        Err(_) => false,
    }
}
