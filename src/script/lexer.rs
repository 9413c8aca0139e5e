//! Tokenizer for build scripts

use crate::error::{KilnError, KilnResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    /// `name:` used as a hash key
    Label(String),
    /// `:name`
    Symbol(String),
    Str(Vec<StrPart>),
    Int(i64),
    Comma,
    /// `(` directly after an identifier: a call's argument list
    CallParen,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Arrow,
    Assign,
    /// End of a statement: a newline or `;`
    Newline,
}

/// Piece of a string literal
#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Lit(String),
    /// Tokens of a `#{...}` interpolation
    Interp(Vec<Spanned>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    depth: usize,
    /// Whitespace separates the previous token from the next
    spaced: bool,
    out: Vec<Spanned>,
}

pub fn tokenize(source: &str) -> KilnResult<Vec<Spanned>> {
    tokenize_from(source, 1)
}

fn tokenize_from(source: &str, line: usize) -> KilnResult<Vec<Spanned>> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line,
        depth: 0,
        spaced: false,
        out: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.out)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '?' || c == '!'
}

impl Lexer<'_> {
    fn error(&self, message: impl Into<String>) -> KilnError {
        KilnError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn push(&mut self, token: Token) {
        self.out.push(Spanned {
            token,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        if self.depth > 0 {
            return;
        }
        if !matches!(self.out.last(), None | Some(Spanned { token: Token::Newline, .. })) {
            self.push(Token::Newline);
        }
    }

    fn run(&mut self) -> KilnResult<()> {
        while let Some(c) = self.chars.next() {
            match c {
                '\n' => {
                    self.push_newline();
                    self.line += 1;
                }
                ';' => self.push_newline(),
                ' ' | '\t' | '\r' => {
                    self.spaced = true;
                    continue;
                }
                '\\' if self.chars.peek() == Some(&'\n') => {
                    self.chars.next();
                    self.line += 1;
                }
                '#' => {
                    while self.chars.peek().is_some_and(|c| *c != '\n') {
                        self.chars.next();
                    }
                }
                ',' => self.push(Token::Comma),
                '(' => {
                    let call = matches!(
                        self.out.last(),
                        Some(Spanned { token: Token::Ident(_), .. })
                    ) && !self.spaced;
                    self.depth += 1;
                    self.push(if call { Token::CallParen } else { Token::LParen });
                }
                ')' => {
                    self.depth = self.depth.saturating_sub(1);
                    self.push(Token::RParen);
                }
                '[' => {
                    self.depth += 1;
                    self.push(Token::LBracket);
                }
                ']' => {
                    self.depth = self.depth.saturating_sub(1);
                    self.push(Token::RBracket);
                }
                '{' => {
                    self.depth += 1;
                    self.push(Token::LBrace);
                }
                '}' => {
                    self.depth = self.depth.saturating_sub(1);
                    self.push(Token::RBrace);
                }
                '=' if self.chars.peek() == Some(&'>') => {
                    self.chars.next();
                    self.push(Token::Arrow);
                }
                '=' => self.push(Token::Assign),
                ':' if self.chars.peek().is_some_and(|c| is_ident_start(*c)) => {
                    let name = self.ident(None);
                    self.push(Token::Symbol(name));
                }
                '"' => {
                    let parts = self.double_quoted()?;
                    self.push(Token::Str(parts));
                }
                '\'' => {
                    let text = self.single_quoted()?;
                    self.push(Token::Str(vec![StrPart::Lit(text)]));
                }
                '-' if self.chars.peek().is_some_and(char::is_ascii_digit) => {
                    let value = self.integer(None)?;
                    self.push(Token::Int(-value));
                }
                c if c.is_ascii_digit() => {
                    let value = self.integer(Some(c))?;
                    self.push(Token::Int(value));
                }
                c if is_ident_start(c) => {
                    let name = self.ident(Some(c));
                    let label = self.chars.peek() == Some(&':') && {
                        let mut ahead = self.chars.clone();
                        ahead.next();
                        ahead.peek() != Some(&':')
                    };
                    if label {
                        self.chars.next();
                        self.push(Token::Label(name));
                    } else {
                        self.push(Token::Ident(name));
                    }
                }
                other => return Err(self.error(format!("unexpected character {:?}", other))),
            }
            self.spaced = false;
        }
        self.push_newline();
        Ok(())
    }

    fn ident(&mut self, first: Option<char>) -> String {
        let mut name: String = first.into_iter().collect();
        while let Some(c) = self.chars.peek().copied().filter(|c| is_ident_char(*c)) {
            name.push(c);
            self.chars.next();
        }
        name
    }

    fn integer(&mut self, first: Option<char>) -> KilnResult<i64> {
        let mut digits: String = first.into_iter().collect();
        while let Some(c) = self
            .chars
            .peek()
            .copied()
            .filter(|c| c.is_ascii_digit() || *c == '_')
        {
            if c != '_' {
                digits.push(c);
            }
            self.chars.next();
        }
        digits
            .parse()
            .map_err(|_| self.error(format!("integer {} is out of range", digits)))
    }

    fn single_quoted(&mut self) -> KilnResult<String> {
        let start = self.line;
        let mut text = String::new();
        loop {
            match self.chars.next() {
                None => {
                    return Err(KilnError::Parse {
                        line: start,
                        message: "unterminated string".into(),
                    })
                }
                Some('\'') => return Ok(text),
                Some('\\') => match self.chars.next() {
                    Some(c @ ('\'' | '\\')) => text.push(c),
                    Some(c) => {
                        text.push('\\');
                        text.push(c);
                    }
                    None => continue,
                },
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    text.push(c);
                }
            }
        }
    }

    fn double_quoted(&mut self) -> KilnResult<Vec<StrPart>> {
        let start = self.line;
        let unterminated = || KilnError::Parse {
            line: start,
            message: "unterminated string".into(),
        };
        let mut parts = Vec::new();
        let mut text = String::new();

        loop {
            match self.chars.next().ok_or_else(unterminated)? {
                '"' => break,
                '\\' => {
                    let escaped = match self.chars.next().ok_or_else(unterminated)? {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        'e' => '\x1b',
                        c => c,
                    };
                    text.push(escaped);
                }
                '#' if self.chars.peek() == Some(&'{') => {
                    self.chars.next();
                    let line = self.line;
                    let source = self.interpolation().ok_or_else(unterminated)?;
                    if !text.is_empty() {
                        parts.push(StrPart::Lit(std::mem::take(&mut text)));
                    }
                    let mut tokens = tokenize_from(&source, line)?;
                    tokens.retain(|t| t.token != Token::Newline);
                    parts.push(StrPart::Interp(tokens));
                }
                c => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    text.push(c);
                }
            }
        }

        if !text.is_empty() || parts.is_empty() {
            parts.push(StrPart::Lit(text));
        }
        Ok(parts)
    }

    /// Source text of a `#{...}` body, braces balanced
    fn interpolation(&mut self) -> Option<String> {
        let mut depth = 1;
        let mut source = String::new();
        loop {
            let c = self.chars.next()?;
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(source);
                    }
                }
                '\n' => self.line += 1,
                _ => {}
            }
            source.push(c);
        }
    }
}
