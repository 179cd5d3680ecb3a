use std::{collections::BTreeMap, str::Chars};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::{
    diag::{Context, Diag},
    frontend::SourceFile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn to(self, other: Span) -> Span {
        Span::new(self.start, other.end)
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // while
    Identifier,       // main

    /* Literals */
    IntegerLiteral, // 1, 0xff
    StringLiteral,  // "hello, world"

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Semicolon,    // ;
    Comma,        // ,
    Dot,          // .

    /* Declarations and assignment */
    Colon,       // :
    DoubleColon, // ::
    ColonEquals, // :=
    Equals,      // = (equality; declarations reuse it after a type)

    /* Unary Ops */
    At,        // @ (deref; also pointer types)
    Ampersand, // & (addressof; also reference types and bitwise and)
    Tilde,     // ~
    Bang,      // ! (only after `as`)

    /* Binary Ops */
    Plus,                 // +
    Minus,                // -
    Asterisk,             // *
    Divide,               // /
    Modulus,              // %
    Pipe,                 // |
    ShiftLeft,            // <<
    ShiftRight,           // >>
    NotEquals,            // !=
    LessThan,             // <
    LessThanOrEqualTo,    // <=
    GreaterThan,          // >
    GreaterThanOrEqualTo, // >=

    /* Compound assignment */
    PlusEquals,       // +=
    MinusEquals,      // -=
    MultiplyEquals,   // *=
    DivideEquals,     // /=
    ModulusEquals,    // %=
    AndEquals,        // &=
    OrEquals,         // |=
    ShiftLeftEquals,  // <<=
    ShiftRightEquals, // >>=
}

impl TokenKind {
    pub fn is_comparison_operator(&self) -> bool {
        matches!(
            self,
            Self::Equals
                | Self::NotEquals
                | Self::LessThan
                | Self::LessThanOrEqualTo
                | Self::GreaterThan
                | Self::GreaterThanOrEqualTo
        )
    }

    pub fn is_bit_shift_operator(&self) -> bool {
        matches!(self, Self::ShiftLeft | Self::ShiftRight)
    }

    pub fn is_term_operator(&self) -> bool {
        matches!(self, Self::Plus | Self::Minus)
    }

    pub fn is_factor_operator(&self) -> bool {
        matches!(self, Self::Asterisk | Self::Divide | Self::Modulus)
    }

    pub fn is_unary_operator(&self) -> bool {
        matches!(
            self,
            Self::At | Self::Ampersand | Self::Tilde | Self::Minus | Self::Plus
        )
    }

    pub fn is_compound_assignment_operator(&self) -> bool {
        matches!(
            self,
            Self::PlusEquals
                | Self::MinusEquals
                | Self::MultiplyEquals
                | Self::DivideEquals
                | Self::ModulusEquals
                | Self::AndEquals
                | Self::OrEquals
                | Self::ShiftLeftEquals
                | Self::ShiftRightEquals
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    If,
    Else,
    While,
    For,
    As,
    Return,
    Struct,
    Enum,
    Extern,
    Export,
    Inline,
    Sizeof,
    Alignof,
    True,
    False,
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (';', TokenKind::Semicolon),
        (',', TokenKind::Comma),
        ('.', TokenKind::Dot),
        (':', TokenKind::Colon),
        ('=', TokenKind::Equals),
        ('@', TokenKind::At),
        ('&', TokenKind::Ampersand),
        ('~', TokenKind::Tilde),
        ('!', TokenKind::Bang),
        ('+', TokenKind::Plus),
        ('-', TokenKind::Minus),
        ('*', TokenKind::Asterisk),
        ('/', TokenKind::Divide),
        ('%', TokenKind::Modulus),
        ('|', TokenKind::Pipe),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
    ])
});

/// Table of multi char tokens, longest first
static MULTI_TOKENS: Lazy<Vec<(&'static str, TokenKind)>> = Lazy::new(|| {
    vec![
        ("<<=", TokenKind::ShiftLeftEquals),
        (">>=", TokenKind::ShiftRightEquals),
        ("::", TokenKind::DoubleColon),
        (":=", TokenKind::ColonEquals),
        ("+=", TokenKind::PlusEquals),
        ("-=", TokenKind::MinusEquals),
        ("*=", TokenKind::MultiplyEquals),
        ("/=", TokenKind::DivideEquals),
        ("%=", TokenKind::ModulusEquals),
        ("&=", TokenKind::AndEquals),
        ("|=", TokenKind::OrEquals),
        ("!=", TokenKind::NotEquals),
        ("<=", TokenKind::LessThanOrEqualTo),
        (">=", TokenKind::GreaterThanOrEqualTo),
        ("<<", TokenKind::ShiftLeft),
        (">>", TokenKind::ShiftRight),
    ]
});

pub struct Lexer<'source> {
    ctx: &'source Context,
    position: usize,
    chars: PeekNth<Chars<'source>>,
}

impl<'source> Lexer<'source> {
    pub fn new(ctx: &'source Context) -> Self {
        Self {
            ctx,
            chars: peek_nth(ctx.source.contents.chars()),
            position: 0,
        }
    }

    pub fn source(&self) -> &SourceFile {
        &self.ctx.source
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.ctx.source.contents.len()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
                self.bump();
            }

            // line comments
            if self.chars.peek() == Some(&'/') && self.chars.peek_nth(1) == Some(&'/') {
                while self.chars.peek().is_some_and(|c| *c != '\n') {
                    self.bump();
                }
                continue;
            }

            break;
        }
    }

    pub fn next_token(&mut self) -> Option<Token> {
        self.skip_trivia();

        let start = self.position;
        let first = *self.chars.peek()?;

        /* Words */

        if first.is_alphabetic() || first == '_' {
            while self
                .chars
                .peek()
                .is_some_and(|c| c.is_alphanumeric() || *c == '_')
            {
                self.bump();
            }

            let span = Span::new(start, self.position);
            let text = self.ctx.source.value_of_span(span);

            let kind = text
                .parse::<Keyword>()
                .map(TokenKind::Keyword)
                .unwrap_or(TokenKind::Identifier);

            return Some(Token { kind, span });
        }

        /* Numbers */

        if first.is_ascii_digit() {
            self.bump();

            // 0x / 0b prefixes
            if first == '0' && matches!(self.chars.peek(), Some('x' | 'b')) {
                self.bump();
            }

            while self
                .chars
                .peek()
                .is_some_and(|c| c.is_ascii_hexdigit() || *c == '_')
            {
                self.bump();
            }

            return Some(Token {
                kind: TokenKind::IntegerLiteral,
                span: Span::new(start, self.position),
            });
        }

        /* Strings */

        if first == '"' {
            self.bump();

            loop {
                match self.bump() {
                    Some('"') => break,
                    Some('\\') => {
                        self.bump();
                    }
                    Some(_) => {}
                    None => {
                        Diag::error(
                            self.ctx,
                            Span::new(start, self.position),
                            "unterminated string literal",
                        )
                        .emit();
                        break;
                    }
                }
            }

            return Some(Token {
                kind: TokenKind::StringLiteral,
                span: Span::new(start, self.position),
            });
        }

        /* Multi char operators */

        for (text, kind) in MULTI_TOKENS.iter() {
            let matches = text
                .chars()
                .enumerate()
                .all(|(i, c)| self.chars.peek_nth(i) == Some(&c));

            if matches {
                for _ in 0..text.len() {
                    self.bump();
                }

                return Some(Token {
                    kind: *kind,
                    span: Span::new(start, self.position),
                });
            }
        }

        /* Single char tokens */

        if let Some(kind) = SINGLE_TOKENS.get(&first) {
            self.bump();

            return Some(Token {
                kind: *kind,
                span: Span::new(start, self.position),
            });
        }

        /* Anything else is an error; skip the character and continue */

        self.bump();
        Diag::error(
            self.ctx,
            Span::new(start, self.position),
            format!("unexpected character {first:?}"),
        )
        .emit();

        self.next_token()
    }

    /// Lexes the whole input up front. The parser operates on the resulting
    /// token buffer.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token() {
            tokens.push(token);
        }

        tokens
    }
}

/// Decodes the escapes of a string literal token (span includes the quotes)
pub fn unescape_string_literal(raw: &str) -> String {
    let inner = &raw[1..raw.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        let ctx = Context::new(SourceFile::in_memory(source));
        Lexer::new(&ctx).tokenize().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_declarations_and_assignment() {
        assert_eq!(
            lex("x : int = 4\nx := x + 1"),
            vec![
                TokenKind::Identifier,
                TokenKind::Colon,
                TokenKind::Identifier,
                TokenKind::Equals,
                TokenKind::IntegerLiteral,
                TokenKind::Identifier,
                TokenKind::ColonEquals,
                TokenKind::Identifier,
                TokenKind::Plus,
                TokenKind::IntegerLiteral,
            ]
        );
    }

    #[test]
    fn longest_match_wins() {
        assert_eq!(
            lex("<<= << <= <"),
            vec![
                TokenKind::ShiftLeftEquals,
                TokenKind::ShiftLeft,
                TokenKind::LessThanOrEqualTo,
                TokenKind::LessThan,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            lex("a // whole line\nb"),
            vec![TokenKind::Identifier, TokenKind::Identifier]
        );
    }

    #[test]
    fn keywords_are_recognized() {
        assert_eq!(
            lex("if else while for as return"),
            vec![
                TokenKind::Keyword(Keyword::If),
                TokenKind::Keyword(Keyword::Else),
                TokenKind::Keyword(Keyword::While),
                TokenKind::Keyword(Keyword::For),
                TokenKind::Keyword(Keyword::As),
                TokenKind::Keyword(Keyword::Return),
            ]
        );
    }

    #[test]
    fn string_escapes_decode() {
        assert_eq!(unescape_string_literal(r#""a\nb\"c""#), "a\nb\"c");
    }
}
