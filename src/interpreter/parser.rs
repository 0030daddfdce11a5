use super::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use super::value::Value;
use super::ParseError;

/// Deepest expression or block nesting a program may use.
pub const MAX_NESTING: usize = 128;

const KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "in", "return", "and", "or", "not", "true", "false", "null",
];

/// Parse routine script text into a [`Program`].
pub fn parse_program(name: &str, source: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let body = parser.parse_statements(false)?;
    if !parser.at(&Tok::Eof) {
        return Err(parser.error("unexpected '}'"));
    }
    Ok(Program::new(name, source, body))
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Dot,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    line: usize,
    line_start: usize,
    // Newlines are insignificant inside () and [].
    nesting: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
            line: 1,
            line_start: 0,
            nesting: 0,
        }
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek_char(&self) -> Option<u8> {
        self.bytes.get(self.index + 1).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            self.index += 1;
            if ch == b'\n' {
                self.line += 1;
                self.line_start = self.index;
            }
        }
    }

    fn column(&self) -> usize {
        self.index - self.line_start + 1
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError::new(message, self.line, self.column())
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            // skip blanks and comments
            while let Some(ch) = self.current() {
                match ch {
                    b' ' | b'\t' | b'\r' => self.advance(),
                    b'\n' if self.nesting > 0 => self.advance(),
                    b'#' => {
                        while let Some(ch) = self.current() {
                            if ch == b'\n' {
                                break;
                            }
                            self.advance();
                        }
                    }
                    _ => break,
                }
            }

            let (line, column) = (self.line, self.column());
            let Some(ch) = self.current() else {
                tokens.push(Token { tok: Tok::Eof, line, column });
                return Ok(tokens);
            };

            let tok = match ch {
                b'\n' => {
                    self.advance();
                    Tok::Newline
                }
                b'"' | b'\'' => self.lex_string(ch)?,
                b'0'..=b'9' => self.lex_number()?,
                c if c == b'_' || c.is_ascii_alphabetic() => self.lex_ident(),
                _ => self.lex_punct()?,
            };
            tokens.push(Token { tok, line, column });
        }
    }

    fn lex_string(&mut self, quote: u8) -> Result<Tok, ParseError> {
        // consume opening quote
        self.advance();
        let mut buf = Vec::new();
        while let Some(ch) = self.current() {
            self.advance();
            match ch {
                c if c == quote => {
                    return String::from_utf8(buf)
                        .map(Tok::Str)
                        .map_err(|_| self.error("invalid UTF-8 in string literal"));
                }
                b'\n' => return Err(self.error("newline in string literal")),
                b'\\' => {
                    let escaped = self
                        .current()
                        .ok_or_else(|| self.error("incomplete escape"))?;
                    self.advance();
                    let value = match escaped {
                        b'"' => b'"',
                        b'\'' => b'\'',
                        b'\\' => b'\\',
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        other => {
                            return Err(self.error(&format!("unknown escape: \\{}", other as char)));
                        }
                    };
                    buf.push(value);
                }
                other => buf.push(other),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn lex_number(&mut self) -> Result<Tok, ParseError> {
        let start = self.index;
        while matches!(self.current(), Some(b'0'..=b'9')) {
            self.advance();
        }

        let mut is_float = false;
        if self.current() == Some(b'.') && matches!(self.peek_char(), Some(b'0'..=b'9')) {
            is_float = true;
            self.advance();
            while matches!(self.current(), Some(b'0'..=b'9')) {
                self.advance();
            }
        }

        let text = &self.src[start..self.index];
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error("invalid float literal"))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error("invalid integer literal"))
        }
    }

    fn lex_ident(&mut self) -> Tok {
        let start = self.index;
        while let Some(ch) = self.current() {
            if ch == b'_' || ch.is_ascii_alphanumeric() {
                self.advance();
            } else {
                break;
            }
        }
        Tok::Ident(self.src[start..self.index].to_string())
    }

    fn lex_punct(&mut self) -> Result<Tok, ParseError> {
        let ch = self.current().ok_or_else(|| self.error("unexpected end of input"))?;
        let next = self.peek_char();
        let (tok, width) = match (ch, next) {
            (b'=', Some(b'=')) => (Tok::EqEq, 2),
            (b'!', Some(b'=')) => (Tok::NotEq, 2),
            (b'<', Some(b'=')) => (Tok::Le, 2),
            (b'>', Some(b'=')) => (Tok::Ge, 2),
            (b'=', _) => (Tok::Assign, 1),
            (b'<', _) => (Tok::Lt, 1),
            (b'>', _) => (Tok::Gt, 1),
            (b'+', _) => (Tok::Plus, 1),
            (b'-', _) => (Tok::Minus, 1),
            (b'*', _) => (Tok::Star, 1),
            (b'/', _) => (Tok::Slash, 1),
            (b'%', _) => (Tok::Percent, 1),
            (b',', _) => (Tok::Comma, 1),
            (b':', _) => (Tok::Colon, 1),
            (b';', _) => (Tok::Semi, 1),
            (b'.', _) => (Tok::Dot, 1),
            (b'{', _) => (Tok::LBrace, 1),
            (b'}', _) => (Tok::RBrace, 1),
            (b'(', _) | (b'[', _) => {
                self.nesting += 1;
                (if ch == b'(' { Tok::LParen } else { Tok::LBracket }, 1)
            }
            (b')', _) | (b']', _) => {
                self.nesting = self.nesting.saturating_sub(1);
                (if ch == b')' { Tok::RParen } else { Tok::RBracket }, 1)
            }
            (other, _) => {
                return Err(self.error(&format!("unexpected character '{}'", other as char)));
            }
        };
        for _ in 0..width {
            self.advance();
        }
        Ok(tok)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    // Height of the tree under construction; bounds every later recursion
    // over it (lowering, evaluation, encoding, drop).
    depth: usize,
}

type ParseResult<T> = Result<T, ParseError>;

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Tok::Ident(text) if text == word)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> ParseResult<()> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match self.peek().clone() {
            Tok::Ident(text) if !KEYWORDS.contains(&text.as_str()) => {
                self.advance();
                Ok(text)
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Tok::Newline) {}
    }

    fn error(&self, message: &str) -> ParseError {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        ParseError::new(message, token.line, token.column)
    }

    /// Account for one more level of nesting.
    fn nest(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    /// Parse statements until end of input or, inside a block, the closing brace.
    fn parse_statements(&mut self, in_block: bool) -> ParseResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            while self.eat(&Tok::Newline) || self.eat(&Tok::Semi) {}
            if self.at(&Tok::Eof) || self.at(&Tok::RBrace) {
                if in_block && self.at(&Tok::Eof) {
                    return Err(self.error("unterminated block"));
                }
                break;
            }
            stmts.push(self.parse_statement()?);
            match self.peek() {
                Tok::Newline | Tok::Semi | Tok::Eof | Tok::RBrace => {}
                _ => return Err(self.error("expected end of statement")),
            }
        }
        Ok(stmts)
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        let entered = self.depth;
        self.nest()?;
        self.expect(Tok::LBrace, "'{'")?;
        let body = self.parse_statements(true)?;
        self.expect(Tok::RBrace, "'}'")?;
        self.depth = entered;
        Ok(body)
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        if self.at_keyword("return") {
            self.advance();
            return match self.peek() {
                Tok::Newline | Tok::Semi | Tok::Eof | Tok::RBrace => Ok(Stmt::Return(None)),
                _ => Ok(Stmt::Return(Some(self.parse_expr()?))),
            };
        }
        if self.at_keyword("if") {
            self.advance();
            return self.parse_if();
        }
        if self.at_keyword("for") {
            self.advance();
            let var = self.expect_name()?;
            if !self.at_keyword("in") {
                return Err(self.error("expected 'in'"));
            }
            self.advance();
            let iter = self.parse_expr()?;
            let body = self.parse_block()?;
            return Ok(Stmt::For { var, iter, body });
        }
        if let (Tok::Ident(name), Tok::Assign) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            if KEYWORDS.contains(&name.as_str()) {
                return Err(self.error("cannot assign to a keyword"));
            }
            self.advance();
            self.advance();
            return Ok(Stmt::Assign(name, self.parse_expr()?));
        }
        Ok(Stmt::Expr(self.parse_expr()?))
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let mut arms = vec![(self.parse_expr()?, self.parse_block()?)];
        let mut otherwise = None;
        loop {
            // `elif`/`else` may start on the line after the closing brace
            let saved = self.pos;
            self.skip_newlines();
            if self.at_keyword("elif") {
                self.advance();
                arms.push((self.parse_expr()?, self.parse_block()?));
            } else if self.at_keyword("else") {
                self.advance();
                otherwise = Some(self.parse_block()?);
                break;
            } else {
                self.pos = saved;
                break;
            }
        }
        Ok(Stmt::If { arms, otherwise })
    }

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        let entered = self.depth;
        self.nest()?;
        let expr = self.parse_or()?;
        self.depth = entered;
        Ok(expr)
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.at_keyword("or") {
            self.advance();
            self.nest()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_not()?;
        while self.at_keyword("and") {
            self.advance();
            self.nest()?;
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.at_keyword("not") {
            self.advance();
            self.nest()?;
            let operand = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Tok::EqEq => BinaryOp::Eq,
                Tok::NotEq => BinaryOp::Ne,
                Tok::Lt => BinaryOp::Lt,
                Tok::Le => BinaryOp::Le,
                Tok::Gt => BinaryOp::Gt,
                Tok::Ge => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            self.nest()?;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            self.nest()?;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_term(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            self.nest()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&Tok::Minus) {
            self.nest()?;
            return Ok(match self.parse_unary()? {
                Expr::Literal(Value::Integer(num)) => Expr::Literal(Value::Integer(-num)),
                Expr::Literal(Value::Float(num)) => Expr::Literal(Value::Float(-num)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if matches!(self.peek(), Tok::LParen | Tok::LBracket | Tok::Dot) {
                self.nest()?;
            }
            match self.peek() {
                Tok::LParen => {
                    let name = dotted_name(&expr)
                        .ok_or_else(|| self.error("only named functions can be called"))?;
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr::Call { name, args, kwargs };
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Tok::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Tok::Dot => {
                    self.advance();
                    let field = match self.advance() {
                        Tok::Ident(text) => text,
                        _ => return Err(self.error("expected a field name after '.'")),
                    };
                    expr = Expr::Field(Box::new(expr), field);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> ParseResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at(&Tok::RParen) {
            if let (Tok::Ident(name), Tok::Assign) = (self.peek(), self.peek_at(1)) {
                let name = name.clone();
                if kwargs.iter().any(|(existing, _)| existing == &name) {
                    return Err(self.error(&format!("duplicate keyword argument '{}'", name)));
                }
                self.advance();
                self.advance();
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen, "')'")?;
        Ok((args, kwargs))
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.peek().clone() {
            Tok::Int(num) => {
                self.advance();
                Ok(Expr::Literal(Value::Integer(num)))
            }
            Tok::Float(num) => {
                self.advance();
                Ok(Expr::Literal(Value::Float(num)))
            }
            Tok::Str(text) => {
                self.advance();
                Ok(Expr::Literal(Value::String(text)))
            }
            Tok::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Boolean(word == "true")))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Null))
                }
                _ => Ok(Expr::Name(self.expect_name()?)),
            },
            Tok::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.at(&Tok::RBracket) {
                    items.push(self.parse_expr()?);
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                loop {
                    self.skip_newlines();
                    if self.at(&Tok::RBrace) {
                        break;
                    }
                    let key = match self.advance() {
                        Tok::Str(text) | Tok::Ident(text) => text,
                        _ => return Err(self.error("map keys must be strings or names")),
                    };
                    self.expect(Tok::Colon, "':'")?;
                    self.skip_newlines();
                    entries.push((key, self.parse_expr()?));
                    self.skip_newlines();
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.skip_newlines();
                self.expect(Tok::RBrace, "'}'")?;
                Ok(Expr::Map(entries))
            }
            Tok::Eof => Err(self.error("unexpected end of input")),
            _ => Err(self.error("unexpected token")),
        }
    }
}

fn dotted_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Name(name) => Some(name.clone()),
        Expr::Field(inner, field) => dotted_name(inner).map(|prefix| format!("{}.{}", prefix, field)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignment_and_return() {
        let program = parse_program("demo", "x = echo(\"hi\"); return x").expect("parse");
        assert_eq!(program.body.len(), 2);
        assert_eq!(
            program.body[0],
            Stmt::Assign(
                "x".into(),
                Expr::Call {
                    name: "echo".into(),
                    args: vec![Expr::Literal(Value::from("hi"))],
                    kwargs: vec![],
                }
            )
        );
        assert_eq!(program.body[1], Stmt::Return(Some(Expr::Name("x".into()))));
    }

    #[test]
    fn parses_dotted_calls_with_keywords() {
        let program = parse_program("demo", "r = research.summarize(topic, depth=2)").expect("parse");
        match &program.body[0] {
            Stmt::Assign(_, Expr::Call { name, args, kwargs }) => {
                assert_eq!(name, "research.summarize");
                assert_eq!(args.len(), 1);
                assert_eq!(kwargs[0].0, "depth");
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parses_control_flow_across_lines() {
        let src = r#"
# pick a greeting
items = [1, 2,
         3]
total = 0
for item in items {
    total = total + item
}
if total > 5 {
    return "big"
}
elif total == 0 { return "none" }
else {
    return "small"
}
"#;
        let program = parse_program("demo", src).expect("parse");
        assert_eq!(program.body.len(), 4);
        match &program.body[3] {
            Stmt::If { arms, otherwise } => {
                assert_eq!(arms.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parses_multiline_map_literal() {
        let program = parse_program("demo", "m = {\n  \"a\": 1,\n  b: -2\n}\nreturn m.b").expect("parse");
        assert_eq!(program.body.len(), 2);
    }

    #[test]
    fn rejects_malformed_programs() {
        let err = parse_program("demo", "x = (1 + ").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(parse_program("demo", "x = \"open").is_err());
        assert!(parse_program("demo", "(1 + 2)(3)").is_err());
        assert!(parse_program("demo", "f(a=1, 2)").is_err());
        assert!(parse_program("demo", "f(a=1, a=2)").is_err());
        assert!(parse_program("demo", "if x { return 1").is_err());
        assert!(parse_program("demo", "x = 1 y = 2").is_err());
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse_program("demo", "x = 1\ny = $").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 5);
    }

    #[test]
    fn rejects_programs_nested_too_deeply() {
        let parens = format!("return {}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = parse_program("demo", &parens).unwrap_err();
        assert_eq!(err.message, "expression nested too deeply");

        let lists = format!("return {}{}", "[".repeat(MAX_NESTING + 1), "]".repeat(MAX_NESTING + 1));
        assert!(parse_program("demo", &lists).is_err());

        let chain = format!("return 1{}", " + 1".repeat(200_000));
        assert!(parse_program("demo", &chain).is_err());

        let negations = format!("return {}1", "not ".repeat(200_000));
        assert!(parse_program("demo", &negations).is_err());

        let indexes = format!("return x{}", "[0]".repeat(200_000));
        assert!(parse_program("demo", &indexes).is_err());

        let blocks = format!("{}return 1{}", "if true { ".repeat(200_000), " }".repeat(200_000));
        assert!(parse_program("demo", &blocks).is_err());
    }

    #[test]
    fn moderate_nesting_is_accepted() {
        let parens = format!("return {}1{}", "(".repeat(40), ")".repeat(40));
        assert!(parse_program("demo", &parens).is_ok());
        let chain = format!("return 1{}", " + 1".repeat(60));
        assert!(parse_program("demo", &chain).is_ok());
    }
}
