//! 表达式的词法和语法分析
//!
//! 优先级从低到高：`||`、`&&`、比较、`+ -`、`* / %`、一元 `- !`、`^`（右结合）。

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Min,
    Max,
    Abs,
    Sqrt,
    Exp,
    Ln,
    Log10,
    Pow,
    Floor,
    Ceil,
    Round,
    Clamp,
    If,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let function = match name {
            "min" => Function::Min,
            "max" => Function::Max,
            "abs" => Function::Abs,
            "sqrt" => Function::Sqrt,
            "exp" => Function::Exp,
            "ln" => Function::Ln,
            "log10" => Function::Log10,
            "pow" => Function::Pow,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "round" => Function::Round,
            "clamp" => Function::Clamp,
            "if" => Function::If,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Abs => "abs",
            Function::Sqrt => "sqrt",
            Function::Exp => "exp",
            Function::Ln => "ln",
            Function::Log10 => "log10",
            Function::Pow => "pow",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Round => "round",
            Function::Clamp => "clamp",
            Function::If => "if",
        }
    }

    /// 允许的参数个数范围
    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::Min | Function::Max => (1, None),
            Function::Pow => (2, Some(2)),
            Function::Clamp | Function::If => (3, Some(3)),
            _ => (1, Some(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub column: usize,
    pub message: String,
}

impl SyntaxError {
    fn new(column: usize, message: impl Into<String>) -> Self {
        Self {
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "第{}列: {}", self.column, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 16] = [
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "^", "<", ">", "!", "=",
];

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, SyntaxError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let column = i + 1;
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
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
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| SyntaxError::new(column, format!("无效的数字 '{}'", text)))?;
            tokens.push((Token::Number(value), column));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), column));
        } else if c == '(' {
            tokens.push((Token::LParen, column));
            i += 1;
        } else if c == ')' {
            tokens.push((Token::RParen, column));
            i += 1;
        } else if c == ',' {
            tokens.push((Token::Comma, column));
            i += 1;
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| SyntaxError::new(column, format!("无法识别的字符 '{}'", c)))?;
            if *op == "=" {
                return Err(SyntaxError::new(column, "表达式中不能赋值，比较请使用 '=='"));
            }
            tokens.push((Token::Op(op), column));
            i += op.len();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end_column: usize,
    depth: usize,
    max_depth: usize,
}

/// 带高度的语法树节点，高度同时约束求值时的递归深度
struct Node {
    expr: Expr,
    height: usize,
}

impl Node {
    fn leaf(expr: Expr) -> Self {
        Self { expr, height: 1 }
    }
}

/// 解析一个完整的表达式，嵌套层数和语法树高度都不得超过 `max_depth`
pub fn parse_expression(input: &str, max_depth: usize) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SyntaxError::new(1, "缺少表达式"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end_column: input.chars().count() + 1,
        depth: 0,
        max_depth,
    };
    let node = parser.parse_or()?;
    match parser.peek() {
        None => Ok(node.expr),
        Some((token, column)) => Err(SyntaxError::new(
            *column,
            format!("多余的内容 {}", describe(token)),
        )),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("'{}'", n),
        Token::Ident(name) => format!("'{}'", name),
        Token::Op(op) => format!("'{}'", op),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::Comma => "','".to_string(),
    }
}

impl Parser {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, candidates: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some((Token::Op(op), _)) if candidates.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn column(&self) -> usize {
        self.peek().map(|(_, column)| *column).unwrap_or(self.end_column)
    }

    fn too_deep(&self) -> SyntaxError {
        SyntaxError::new(
            self.column(),
            format!("表达式嵌套层数超过上限 {}", self.max_depth),
        )
    }

    /// 进入一层递归下降，超过上限时直接报错而不是继续压栈
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, SyntaxError>,
    ) -> Result<T, SyntaxError> {
        if self.depth >= self.max_depth {
            return Err(self.too_deep());
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn node(&self, expr: Expr, height: usize) -> Result<Node, SyntaxError> {
        if height > self.max_depth {
            return Err(self.too_deep());
        }
        Ok(Node { expr, height })
    }

    fn binary(&self, op: BinaryOp, left: Node, right: Node) -> Result<Node, SyntaxError> {
        let height = left.height.max(right.height) + 1;
        self.node(
            Expr::Binary(op, Box::new(left.expr), Box::new(right.expr)),
            height,
        )
    }

    fn parse_or(&mut self) -> Result<Node, SyntaxError> {
        self.nested(|parser| {
            let mut left = parser.parse_and()?;
            while parser.eat_op(&["||"]).is_some() {
                let right = parser.parse_and()?;
                left = parser.binary(BinaryOp::Or, left, right)?;
            }
            Ok(left)
        })
    }

    fn parse_and(&mut self) -> Result<Node, SyntaxError> {
        let mut left = self.parse_comparison()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.parse_comparison()?;
            left = self.binary(BinaryOp::And, left, right)?;
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Node, SyntaxError> {
        let mut left = self.parse_additive()?;
        while let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) {
            let op = match op {
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                "<=" => BinaryOp::Le,
                ">=" => BinaryOp::Ge,
                "<" => BinaryOp::Lt,
                _ => BinaryOp::Gt,
            };
            let right = self.parse_additive()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Node, SyntaxError> {
        let mut left = self.parse_multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            let right = self.parse_multiplicative()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, SyntaxError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            let right = self.parse_unary()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, SyntaxError> {
        self.nested(|parser| {
            if let Some(op) = parser.eat_op(&["-", "!"]) {
                let op = if op == "-" { UnaryOp::Neg } else { UnaryOp::Not };
                let operand = parser.parse_unary()?;
                let height = operand.height + 1;
                return parser.node(Expr::Unary(op, Box::new(operand.expr)), height);
            }
            parser.parse_power()
        })
    }

    fn parse_power(&mut self) -> Result<Node, SyntaxError> {
        let base = self.parse_primary()?;
        if self.eat_op(&["^"]).is_some() {
            // 右结合，指数部分允许一元负号
            let exponent = self.parse_unary()?;
            return self.binary(BinaryOp::Pow, base, exponent);
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Node, SyntaxError> {
        let column = self.column();
        match self.next() {
            Some((Token::Number(value), _)) => Ok(Node::leaf(Expr::Number(value))),
            Some((Token::Ident(name), _)) => match name.as_str() {
                "true" => Ok(Node::leaf(Expr::Bool(true))),
                "false" => Ok(Node::leaf(Expr::Bool(false))),
                _ if matches!(self.peek(), Some((Token::LParen, _))) => {
                    self.parse_call(&name, column)
                }
                _ => Ok(Node::leaf(Expr::Var(name))),
            },
            Some((Token::LParen, _)) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    _ => Err(SyntaxError::new(column, "括号未闭合")),
                }
            }
            Some((token, column)) => Err(SyntaxError::new(
                column,
                format!("意外的 {}", describe(&token)),
            )),
            None => Err(SyntaxError::new(column, "表达式不完整")),
        }
    }

    fn parse_call(&mut self, name: &str, column: usize) -> Result<Node, SyntaxError> {
        let function = Function::lookup(name)
            .ok_or_else(|| SyntaxError::new(column, format!("未知函数 '{}'", name)))?;
        // 左括号
        self.next();

        let mut args = Vec::new();
        let mut height = 0;
        if matches!(self.peek(), Some((Token::RParen, _))) {
            self.next();
        } else {
            loop {
                let arg = self.parse_or()?;
                height = height.max(arg.height);
                args.push(arg.expr);
                match self.next() {
                    Some((Token::Comma, _)) => continue,
                    Some((Token::RParen, _)) => break,
                    _ => return Err(SyntaxError::new(column, format!("{}(...) 缺少右括号", name))),
                }
            }
        }

        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            let expected = match max {
                Some(max) if max == min => format!("{}", min),
                Some(max) => format!("{}-{}", min, max),
                None => format!("至少{}", min),
            };
            return Err(SyntaxError::new(
                column,
                format!("{} 需要{}个参数，实际为{}个", name, expected, args.len()),
            ));
        }
        self.node(Expr::Call(function, args), height + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Expr, SyntaxError> {
        parse_expression(input, 64)
    }

    fn num(value: f64) -> Box<Expr> {
        Box::new(Expr::Number(value))
    }

    fn var(name: &str) -> Box<Expr> {
        Box::new(Expr::Var(name.to_string()))
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            parse("1 + 2 * x").unwrap(),
            Expr::Binary(
                BinaryOp::Add,
                num(1.0),
                Box::new(Expr::Binary(BinaryOp::Mul, num(2.0), var("x")))
            )
        );
        assert_eq!(
            parse("-2 ^ 2").unwrap(),
            Expr::Unary(
                UnaryOp::Neg,
                Box::new(Expr::Binary(BinaryOp::Pow, num(2.0), num(2.0)))
            )
        );
        assert_eq!(
            parse("2 ^ 3 ^ 2").unwrap(),
            Expr::Binary(
                BinaryOp::Pow,
                num(2.0),
                Box::new(Expr::Binary(BinaryOp::Pow, num(3.0), num(2.0)))
            )
        );
    }

    #[test]
    fn test_logic_and_comparison() {
        let expr = parse("a > 1 && !b || c == 2").unwrap();
        match expr {
            Expr::Binary(BinaryOp::Or, left, _) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::And, _, _)))
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_numbers_and_literals() {
        assert_eq!(parse("1.5e3").unwrap(), Expr::Number(1500.0));
        assert_eq!(parse(".25").unwrap(), Expr::Number(0.25));
        assert_eq!(parse("true").unwrap(), Expr::Bool(true));
    }

    #[test]
    fn test_function_calls() {
        let expr = parse("clamp(x, 0, max(1, y, 3))").unwrap();
        match expr {
            Expr::Call(Function::Clamp, args) => {
                assert_eq!(args.len(), 3);
                assert!(matches!(args[2], Expr::Call(Function::Max, _)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("(1 + 2").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("a = 1").is_err());
        assert!(parse("x $ 2").is_err());

        let err = parse("foo(1)").unwrap_err();
        assert!(err.message.contains("foo"));
        let err = parse("pow(1)").unwrap_err();
        assert!(err.message.contains("pow"));
        assert!(parse("if(a, 1)").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        let err = parse_expression(&deep, 64).unwrap_err();
        assert!(err.message.contains("嵌套层数"));

        let unary = format!("{}x", "-".repeat(20_000));
        assert!(parse_expression(&unary, 64).is_err());

        // 左结合的长链同样受树高限制
        let chain = vec!["1"; 20_000].join(" + ");
        assert!(parse_expression(&chain, 64).is_err());

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(parse_expression(&shallow, 64).unwrap(), Expr::Number(1.0));
        assert!(parse_expression(&vec!["1"; 20].join(" + "), 64).is_ok());
    }
}
