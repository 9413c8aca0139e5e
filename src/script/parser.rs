//! Recursive-descent parser for build scripts
//!
//! Calls may be written Ruby style: `verb a, b, key: value`, `func(a)` or
//! bare `verb`, optionally followed by a `do ... end` block. Calls written
//! without parentheses take the rest of the line as their arguments.

use super::ast::{Call, Expr, Segment, Stmt};
use super::lexer::{tokenize, Spanned, StrPart, Token};
use crate::error::{KilnError, KilnResult};

pub fn parse(source: &str) -> KilnResult<Vec<Stmt>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    let stmts = parser.statements(false)?;
    match parser.peek() {
        None => Ok(stmts),
        Some(_) => Err(parser.error("unexpected `end`")),
    }
}

/// The source stopped inside an open block, string or bracket
pub fn is_incomplete(err: &KilnError) -> bool {
    match err {
        KilnError::Parse { message, .. } => {
            message.starts_with("missing `end`")
                || message.starts_with("unterminated")
                || message.ends_with("end of input")
        }
        _ => false,
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    last_line: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        let last_line = tokens.last().map_or(1, |t| t.line);
        Self {
            tokens,
            pos: 0,
            last_line,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|t| &t.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.last_line, |t| t.line)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> KilnError {
        KilnError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> KilnResult<()> {
        match self.peek() {
            Some(token) if *token == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(token) => Err(self.error(format!("expected {}, found {}", what, describe(token)))),
            None => Err(self.error(format!("expected {}, found end of input", what))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek() == Some(&Token::Newline) {
            self.pos += 1;
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    /// Statements up to end of input, or up to `end` inside a block
    fn statements(&mut self, in_block: bool) -> KilnResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.peek().is_none() || self.at_keyword("end") {
                if in_block && self.peek().is_none() {
                    return Err(self.error("missing `end` for `do` block"));
                }
                return Ok(stmts);
            }

            stmts.push(self.statement()?);

            match self.peek() {
                None | Some(Token::Newline) => {}
                Some(Token::Ident(name)) if name == "end" => {}
                Some(token) => {
                    return Err(self.error(format!("unexpected {}", describe(token))));
                }
            }
        }
    }

    fn statement(&mut self) -> KilnResult<Stmt> {
        if let (Some(Token::Ident(name)), Some(Token::Assign)) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            let line = self.line();
            self.pos += 2;
            let value = self.expression(true)?;
            return Ok(Stmt::Assign { name, value, line });
        }
        Ok(Stmt::Expr(self.expression(true)?))
    }

    /// One value; `command` permits a parenthesis-free call
    fn expression(&mut self, command: bool) -> KilnResult<Expr> {
        let line = self.line();
        let Some(token) = self.advance() else {
            return Err(self.error("expected a value, found end of input"));
        };

        match token {
            Token::Str(parts) => self.string(parts),
            Token::Int(value) => Ok(Expr::Int(value)),
            Token::Symbol(name) => Ok(Expr::string(name)),
            Token::LParen | Token::CallParen => {
                let inner = self.expression(true)?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::LBracket => self.array(),
            Token::LBrace => self.hash(),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "nil" => Ok(Expr::Nil),
                "do" | "end" => Err(KilnError::Parse {
                    line,
                    message: format!("unexpected `{}`", name),
                }),
                _ => self.call(name, line, command),
            },
            other => Err(KilnError::Parse {
                line,
                message: format!("unexpected {}", describe(&other)),
            }),
        }
    }

    fn call(&mut self, name: String, line: usize, command: bool) -> KilnResult<Expr> {
        let mut args = Vec::new();
        let mut bare = false;

        if self.peek() == Some(&Token::CallParen) {
            self.pos += 1;
            if self.peek() == Some(&Token::RParen) {
                self.pos += 1;
            } else {
                args = self.arguments(true)?;
                self.expect(Token::RParen, "`)` after arguments")?;
            }
        } else if command && self.peek().is_some_and(starts_argument) {
            args = self.arguments(true)?;
        } else {
            bare = true;
        }

        let block = if self.at_keyword("do") {
            self.pos += 1;
            let body = self.statements(true)?;
            if !self.at_keyword("end") {
                return Err(self.error("missing `end` for `do` block"));
            }
            self.pos += 1;
            bare = false;
            Some(body)
        } else {
            None
        };

        Ok(Expr::Call(Call {
            name,
            args,
            block,
            bare,
            line,
        }))
    }

    /// Comma-separated arguments; keyword pairs become a trailing hash
    fn arguments(&mut self, command: bool) -> KilnResult<Vec<Expr>> {
        let mut args = Vec::new();
        let mut pairs = Vec::new();

        loop {
            if let Some(Token::Label(key)) = self.peek() {
                let key = Expr::string(key.clone());
                self.pos += 1;
                self.skip_newlines();
                pairs.push((key, self.expression(command)?));
            } else {
                let value = self.expression(command)?;
                if self.peek() == Some(&Token::Arrow) {
                    self.pos += 1;
                    pairs.push((value, self.expression(command)?));
                } else if !pairs.is_empty() {
                    return Err(self.error("positional argument after keyword arguments"));
                } else {
                    args.push(value);
                }
            }

            if self.peek() != Some(&Token::Comma) {
                break;
            }
            self.pos += 1;
            self.skip_newlines();
        }

        if !pairs.is_empty() {
            args.push(Expr::Hash(pairs));
        }
        Ok(args)
    }

    fn array(&mut self) -> KilnResult<Expr> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBracket) {
                self.pos += 1;
                return Ok(Expr::Array(items));
            }
            items.push(self.expression(false)?);
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                Some(Token::RBracket) => {}
                _ => return Err(self.error("expected `,` or `]` in array")),
            }
        }
    }

    fn hash(&mut self) -> KilnResult<Expr> {
        let mut pairs = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBrace) {
                self.pos += 1;
                return Ok(Expr::Hash(pairs));
            }
            let key = if let Some(Token::Label(key)) = self.peek() {
                let key = Expr::string(key.clone());
                self.pos += 1;
                key
            } else {
                let key = self.expression(false)?;
                self.expect(Token::Arrow, "`=>` in hash")?;
                key
            };
            pairs.push((key, self.expression(false)?));
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                Some(Token::RBrace) => {}
                _ => return Err(self.error("expected `,` or `}` in hash")),
            }
        }
    }

    fn string(&mut self, parts: Vec<StrPart>) -> KilnResult<Expr> {
        let mut segments = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                StrPart::Lit(text) => segments.push(Segment::Lit(text)),
                StrPart::Interp(tokens) => {
                    let line = tokens.first().map_or(self.line(), |t| t.line);
                    if tokens.is_empty() {
                        continue;
                    }
                    let mut inner = Parser::new(tokens);
                    let expr = inner.expression(true)?;
                    if inner.peek().is_some() {
                        return Err(KilnError::Parse {
                            line,
                            message: "unexpected tokens in interpolation".into(),
                        });
                    }
                    segments.push(Segment::Interp(Box::new(expr)));
                }
            }
        }
        Ok(Expr::Str(segments))
    }
}

fn starts_argument(token: &Token) -> bool {
    match token {
        Token::Ident(name) => name != "do" && name != "end",
        Token::Str(_)
        | Token::Int(_)
        | Token::Symbol(_)
        | Token::Label(_)
        | Token::LBracket
        | Token::LBrace
        | Token::LParen => true,
        _ => false,
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("`{}`", name),
        Token::Label(name) => format!("`{}:`", name),
        Token::Symbol(name) => format!("`:{}`", name),
        Token::Str(_) => "string".into(),
        Token::Int(value) => format!("`{}`", value),
        Token::Comma => "`,`".into(),
        Token::CallParen | Token::LParen => "`(`".into(),
        Token::RParen => "`)`".into(),
        Token::LBracket => "`[`".into(),
        Token::RBracket => "`]`".into(),
        Token::LBrace => "`{`".into(),
        Token::RBrace => "`}`".into(),
        Token::Arrow => "`=>`".into(),
        Token::Assign => "`=`".into(),
        Token::Newline => "end of line".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_input_is_detected() {
        for source in ["skip do\n  run \"x\"", "run \"unclosed", "cmd [\"a\","] {
            let err = parse(source).unwrap_err();
            assert!(is_incomplete(&err), "{}: {}", source, err);
        }
        assert!(!is_incomplete(&parse("end").unwrap_err()));
    }

    fn call(stmt: &Stmt) -> &Call {
        match stmt {
            Stmt::Expr(Expr::Call(call)) => call,
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn command_calls() {
        let stmts = parse("from \"debian\"\nrun \"make\", output: false\nflatten\n").unwrap();
        assert_eq!(stmts.len(), 3);

        let run = call(&stmts[1]);
        assert_eq!(run.name, "run");
        assert_eq!(run.args.len(), 2);
        assert_eq!(
            run.args[1],
            Expr::Hash(vec![(Expr::string("output"), Expr::Bool(false))])
        );

        let flatten = call(&stmts[2]);
        assert!(flatten.bare);
        assert!(flatten.args.is_empty());
    }

    #[test]
    fn blocks_nest() {
        let source = r#"
with_user "nobody" do
  inside "/tmp" do
    run "touch x"
  end
end
"#;
        let stmts = parse(source).unwrap();
        let outer = call(&stmts[0]);
        let inner = call(&outer.block.as_ref().unwrap()[0]);
        assert_eq!(inner.name, "inside");
        assert_eq!(call(&inner.block.as_ref().unwrap()[0]).name, "run");
        assert_eq!(outer.line, 2);
    }

    #[test]
    fn nested_calls_as_values() {
        let stmts = parse("env HOME: getenv(\"HOME\"), V: var \"v\"").unwrap();
        let env = call(&stmts[0]);
        let Expr::Hash(pairs) = &env.args[0] else {
            panic!("expected hash");
        };
        assert!(matches!(&pairs[0].1, Expr::Call(c) if c.name == "getenv" && c.args.len() == 1));
        assert!(matches!(&pairs[1].1, Expr::Call(c) if c.name == "var"));
    }

    #[test]
    fn arrays_and_hashes_span_lines() {
        let stmts = parse("set_exec cmd: [\n  \"/bin/app\",\n  \"--serve\",\n], entrypoint: []\n").unwrap();
        let set_exec = call(&stmts[0]);
        let Expr::Hash(pairs) = &set_exec.args[0] else {
            panic!("expected hash");
        };
        assert_eq!(pairs.len(), 2);
        assert!(matches!(&pairs[0].1, Expr::Array(items) if items.len() == 2));
    }

    #[test]
    fn assignment_and_interpolation() {
        let stmts = parse("v = var \"version\"\ntag \"app:#{v}\"").unwrap();
        assert!(matches!(&stmts[0], Stmt::Assign { name, .. } if name == "v"));
        let tag = call(&stmts[1]);
        let Expr::Str(segments) = &tag.args[0] else {
            panic!("expected string");
        };
        assert!(matches!(&segments[1], Segment::Interp(e) if matches!(**e, Expr::Call(ref c) if c.bare)));
    }

    #[test]
    fn errors_carry_lines() {
        let err = parse("from \"debian\"\nrun \"a\" \"b\"\n").unwrap_err();
        assert!(matches!(err, KilnError::Parse { line: 2, .. }), "{}", err);

        let err = parse("skip do\n  run \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("missing `end`"));

        let err = parse("end").unwrap_err();
        assert!(err.to_string().contains("unexpected `end`"));
    }
}
