//! Sandboxed arithmetic expressions over a single variable `x`
//!
//! Expressions are parsed once into a small AST. Only numbers, `x`, the
//! constants `pi`/`e`/`tau` and the functions of the selected
//! [`FunctionSet`] resolve; there is no other name lookup, so an
//! expression cannot reach anything outside its own arguments.
//!
//! ```text
//! or      := and ("or" and)*
//! and     := not ("and" not)*
//! not     := "not" not | compare
//! compare := sum (("<" | "<=" | ">" | ">=" | "==" | "!=") sum)*
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "//" | "%") unary)*
//! unary   := ("-" | "+") unary | power
//! power   := primary ("**" unary)?
//! primary := number | name | name "(" args ")" | "(" or ")"
//! ```

use serde::Deserialize;
use std::f64::consts;
use std::fmt;

use crate::error::ConfigError;

/// Which functions an expression may call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionSet {
    #[default]
    Basic,
    /// Opt-in superset with inverse trig, hyperbolic and misc helpers
    Extended,
}

/// Result of evaluating an expression
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Number(f64),
    Bool(bool),
}

impl Scalar {
    fn truthy(self) -> bool {
        match self {
            Scalar::Number(n) => n != 0.0,
            Scalar::Bool(b) => b,
        }
    }

    fn number(self) -> Result<f64, String> {
        match self {
            Scalar::Number(n) => Ok(n),
            Scalar::Bool(_) => Err("expected a number, found a boolean".to_string()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// A compiled expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Node,
}

impl Expression {
    pub fn compile(source: &str, functions: FunctionSet) -> Result<Self, ConfigError> {
        let tokens = tokenize(source).map_err(ConfigError::Expression)?;
        if tokens.len() > MAX_TOKENS {
            return Err(ConfigError::Expression(format!(
                "expression too long ({} tokens, at most {})",
                tokens.len(),
                MAX_TOKENS
            )));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            functions,
        };
        let root = parser.parse_or().map_err(ConfigError::Expression)?;
        if let Some(token) = parser.peek() {
            return Err(ConfigError::Expression(format!(
                "unexpected {} after end of expression",
                token
            )));
        }
        Ok(Self { root })
    }

    pub fn evaluate(&self, x: f64) -> Result<Scalar, String> {
        self.root.eval(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Abs,
    Min,
    Max,
    Floor,
    Ceil,
    Round,
    Sqrt,
    Pow,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Log,
    Log10,
    Clamp,
    If,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Hypot,
    Cbrt,
    Exp2,
    Log2,
    Trunc,
    Fract,
    Signum,
}

impl Function {
    fn lookup(name: &str, set: FunctionSet) -> Option<Self> {
        let basic = match name {
            "abs" | "fabs" => Some(Function::Abs),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "floor" => Some(Function::Floor),
            "ceil" => Some(Function::Ceil),
            "round" => Some(Function::Round),
            "sqrt" => Some(Function::Sqrt),
            "pow" => Some(Function::Pow),
            "sin" => Some(Function::Sin),
            "cos" => Some(Function::Cos),
            "tan" => Some(Function::Tan),
            "exp" => Some(Function::Exp),
            "ln" => Some(Function::Ln),
            "log" => Some(Function::Log),
            "log10" => Some(Function::Log10),
            "clamp" => Some(Function::Clamp),
            "if" => Some(Function::If),
            _ => None,
        };
        if basic.is_some() || set == FunctionSet::Basic {
            return basic;
        }
        match name {
            "asin" => Some(Function::Asin),
            "acos" => Some(Function::Acos),
            "atan" => Some(Function::Atan),
            "atan2" => Some(Function::Atan2),
            "sinh" => Some(Function::Sinh),
            "cosh" => Some(Function::Cosh),
            "tanh" => Some(Function::Tanh),
            "asinh" => Some(Function::Asinh),
            "acosh" => Some(Function::Acosh),
            "atanh" => Some(Function::Atanh),
            "hypot" => Some(Function::Hypot),
            "cbrt" => Some(Function::Cbrt),
            "exp2" => Some(Function::Exp2),
            "log2" => Some(Function::Log2),
            "trunc" => Some(Function::Trunc),
            "fract" => Some(Function::Fract),
            "signum" => Some(Function::Signum),
            _ => None,
        }
    }

    /// (min, max) argument count, `None` max means variadic
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Function::Min | Function::Max => (1, None),
            Function::Round | Function::Log => (1, Some(2)),
            Function::Pow | Function::Atan2 | Function::Hypot => (2, Some(2)),
            Function::Clamp | Function::If => (3, Some(3)),
            _ => (1, Some(1)),
        }
    }

    fn apply(self, args: &[Node], x: f64) -> Result<Scalar, String> {
        // `if` is lazy in its branches
        if self == Function::If {
            return if args[0].eval(x)?.truthy() {
                args[1].eval(x)
            } else {
                args[2].eval(x)
            };
        }

        let values = args
            .iter()
            .map(|arg| arg.eval(x).and_then(Scalar::number))
            .collect::<Result<Vec<f64>, String>>()?;
        let a = values[0];

        let result = match self {
            Function::Abs => a.abs(),
            Function::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Function::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Function::Floor => a.floor(),
            Function::Ceil => a.ceil(),
            Function::Round => match values.get(1) {
                Some(digits) => {
                    let factor = 10f64.powi(*digits as i32);
                    (a * factor).round() / factor
                }
                None => a.round(),
            },
            Function::Sqrt => {
                if a < 0.0 {
                    return Err("math domain error in sqrt".to_string());
                }
                a.sqrt()
            }
            Function::Pow => a.powf(values[1]),
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Exp => a.exp(),
            Function::Ln => checked_log(a, "ln")?,
            Function::Log => match values.get(1) {
                Some(base) => checked_log(a, "log")? / checked_log(*base, "log")?,
                None => checked_log(a, "log")?,
            },
            Function::Log10 => checked_log(a, "log10")? / consts::LN_10,
            Function::Clamp => {
                let (lo, hi) = (values[1], values[2]);
                if lo > hi {
                    return Err(format!("clamp bounds reversed ({} > {})", lo, hi));
                }
                a.clamp(lo, hi)
            }
            Function::Asin => a.asin(),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Atan2 => a.atan2(values[1]),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Asinh => a.asinh(),
            Function::Acosh => a.acosh(),
            Function::Atanh => a.atanh(),
            Function::Hypot => a.hypot(values[1]),
            Function::Cbrt => a.cbrt(),
            Function::Exp2 => a.exp2(),
            Function::Log2 => checked_log(a, "log2")? / consts::LN_2,
            Function::Trunc => a.trunc(),
            Function::Fract => a.fract(),
            Function::Signum => a.signum(),
            Function::If => unreachable!("handled above"),
        };
        Ok(Scalar::Number(result))
    }
}

fn checked_log(value: f64, name: &str) -> Result<f64, String> {
    if value <= 0.0 {
        return Err(format!("math domain error in {}", name));
    }
    Ok(value.ln())
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Variable,
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl Node {
    fn eval(&self, x: f64) -> Result<Scalar, String> {
        match self {
            Node::Number(n) => Ok(Scalar::Number(*n)),
            Node::Variable => Ok(Scalar::Number(x)),
            Node::Unary(UnaryOp::Neg, inner) => Ok(Scalar::Number(-inner.eval(x)?.number()?)),
            Node::Unary(UnaryOp::Not, inner) => Ok(Scalar::Bool(!inner.eval(x)?.truthy())),
            Node::Binary(BinaryOp::And, lhs, rhs) => {
                let left = lhs.eval(x)?;
                if left.truthy() {
                    rhs.eval(x)
                } else {
                    Ok(left)
                }
            }
            Node::Binary(BinaryOp::Or, lhs, rhs) => {
                let left = lhs.eval(x)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    rhs.eval(x)
                }
            }
            Node::Binary(op, lhs, rhs) => {
                let a = lhs.eval(x)?;
                let b = rhs.eval(x)?;
                binary(*op, a, b)
            }
            Node::Call(function, args) => function.apply(args, x),
        }
    }
}

fn binary(op: BinaryOp, a: Scalar, b: Scalar) -> Result<Scalar, String> {
    // Equality also works between booleans
    match (op, a, b) {
        (BinaryOp::Eq, Scalar::Bool(l), Scalar::Bool(r)) => return Ok(Scalar::Bool(l == r)),
        (BinaryOp::Ne, Scalar::Bool(l), Scalar::Bool(r)) => return Ok(Scalar::Bool(l != r)),
        _ => {}
    }

    let (a, b) = (a.number()?, b.number()?);
    let value = match op {
        BinaryOp::Add => Scalar::Number(a + b),
        BinaryOp::Sub => Scalar::Number(a - b),
        BinaryOp::Mul => Scalar::Number(a * b),
        BinaryOp::Div => {
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            Scalar::Number(a / b)
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err("integer division by zero".to_string());
            }
            Scalar::Number((a / b).floor())
        }
        BinaryOp::Rem => {
            if b == 0.0 {
                return Err("modulo by zero".to_string());
            }
            // sign follows the divisor
            Scalar::Number(a - b * (a / b).floor())
        }
        BinaryOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err("zero cannot be raised to a negative power".to_string());
            }
            Scalar::Number(a.powf(b))
        }
        BinaryOp::Lt => Scalar::Bool(a < b),
        BinaryOp::Le => Scalar::Bool(a <= b),
        BinaryOp::Gt => Scalar::Bool(a > b),
        BinaryOp::Ge => Scalar::Bool(a >= b),
        BinaryOp::Eq => Scalar::Bool(a == b),
        BinaryOp::Ne => Scalar::Bool(a != b),
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators are evaluated lazily"),
    };
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Name(name) => write!(f, "name '{}'", name),
            Token::Op(op) => write!(f, "operator '{}'", op),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

const OPERATORS: [&str; 14] = [
    "**", "//", "<=", ">=", "==", "!=", "+", "-", "*", "/", "%", "<", ">", "!",
];

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| format!("invalid number literal '{}'", literal))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            let name = raw.strip_prefix("math.").unwrap_or(&raw);
            if name.contains('.') {
                return Err(format!("attribute access is not allowed: '{}'", raw));
            }
            tokens.push(Token::Name(name.to_string()));
            continue;
        }

        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| format!("unexpected character '{}'", c))?;
                if *op == "!" {
                    return Err("unexpected character '!'".to_string());
                }
                tokens.push(Token::Op(op));
                i += op.len();
                continue;
            }
        }
        i += 1;
    }

    Ok(tokens)
}

// Bounds recursion in both the parser and the evaluator
const MAX_TOKENS: usize = 512;
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    functions: FunctionSet,
}

impl Parser {
    fn nested(&mut self, parse: fn(&mut Self) -> Result<Node, String>) -> Result<Node, String> {
        if self.depth >= MAX_NESTING {
            return Err("expression nested too deeply".to_string());
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Name(name)) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Node, String> {
        let mut node = self.parse_and()?;
        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            node = Node::Binary(BinaryOp::Or, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, String> {
        let mut node = self.parse_not()?;
        while self.eat_keyword("and") {
            let rhs = self.parse_not()?;
            node = Node::Binary(BinaryOp::And, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_not(&mut self) -> Result<Node, String> {
        if self.eat_keyword("not") {
            let inner = self.nested(Self::parse_not)?;
            return Ok(Node::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_compare()
    }

    /// Chained comparisons expand to a conjunction: `a < b < c` is `a < b and b < c`
    fn parse_compare(&mut self) -> Result<Node, String> {
        let first = self.parse_sum()?;
        let mut operands = vec![first];
        let mut ops = Vec::new();
        while let Some(op) = self.eat_op(&["<", "<=", ">", ">=", "==", "!="]) {
            ops.push(match op {
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "==" => BinaryOp::Eq,
                _ => BinaryOp::Ne,
            });
            operands.push(self.parse_sum()?);
        }

        if ops.is_empty() {
            return Ok(operands.remove(0));
        }

        let mut result: Option<Node> = None;
        for (idx, op) in ops.into_iter().enumerate() {
            let cmp = Node::Binary(
                op,
                Box::new(operands[idx].clone()),
                Box::new(operands[idx + 1].clone()),
            );
            result = Some(match result {
                Some(acc) => Node::Binary(BinaryOp::And, Box::new(acc), Box::new(cmp)),
                None => cmp,
            });
        }
        result.ok_or_else(|| "empty comparison".to_string())
    }

    fn parse_sum(&mut self) -> Result<Node, String> {
        let mut node = self.parse_product()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.parse_product()?;
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_product(&mut self) -> Result<Node, String> {
        let mut node = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "//", "%"]) {
            let rhs = self.parse_unary()?;
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "//" => BinaryOp::FloorDiv,
                _ => BinaryOp::Rem,
            };
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, String> {
        match self.eat_op(&["-", "+"]) {
            Some("-") => Ok(Node::Unary(
                UnaryOp::Neg,
                Box::new(self.nested(Self::parse_unary)?),
            )),
            Some(_) => self.nested(Self::parse_unary),
            None => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Node, String> {
        let base = self.parse_primary()?;
        if self.eat_op(&["**"]).is_some() {
            let exponent = self.nested(Self::parse_unary)?;
            return Ok(Node::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Number(n)),
            Some(Token::LParen) => {
                let inner = self.nested(Self::parse_or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(format!("expected ')', found {}", other)),
                    None => Err("unclosed '('".to_string()),
                }
            }
            Some(Token::Name(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.pos += 1;
                    return self.parse_call(&name);
                }
                match name.as_str() {
                    "x" => Ok(Node::Variable),
                    "pi" => Ok(Node::Number(consts::PI)),
                    "e" => Ok(Node::Number(consts::E)),
                    "tau" => Ok(Node::Number(consts::TAU)),
                    "True" | "true" => Ok(Node::Number(1.0)),
                    "False" | "false" => Ok(Node::Number(0.0)),
                    _ => Err(format!("unknown name '{}'", name)),
                }
            }
            Some(other) => Err(format!("unexpected {}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Node, String> {
        let function = Function::lookup(name, self.functions)
            .ok_or_else(|| format!("function '{}' is not allowed", name))?;

        let mut args = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                args.push(self.nested(Self::parse_or)?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    Some(other) => return Err(format!("expected ',' or ')', found {}", other)),
                    None => return Err(format!("unclosed call to '{}'", name)),
                }
            }
        } else {
            self.pos += 1;
        }

        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Err(format!(
                "'{}' called with {} argument(s)",
                name,
                args.len()
            ));
        }
        Ok(Node::Call(function, args))
    }
}
