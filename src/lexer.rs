use log::warn;

use crate::token::{KEYWORDS, Token, TokenKind};

/// Comment scanning runs as a small state machine over `/`. A bare `/`
/// is ambiguous until the next character resolves it: `//` starts a line
/// comment, `/*` a block comment, anything else retroactively emits the
/// pending `/` as a division symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentState {
    Pending,
    Line,
    Block,
    BlockClosing,
}

pub struct Lexer {
    tokens: Vec<Token>,
    word: String,
    word_line: usize,
    word_column: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new() -> Self {
        Self {
            tokens: Vec::new(),
            word: String::new(),
            word_line: 1,
            word_column: 1,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self, source: &str) -> Vec<Token> {
        let mut quote: Option<char> = None;
        let mut string_escape = false;
        let mut string_line = 1;
        let mut string_column = 1;
        let mut comment: Option<CommentState> = None;

        for c in source.chars() {
            if let Some(q) = quote {
                if string_escape {
                    self.word.push(unescape(c));
                    string_escape = false;
                } else if c == '\\' {
                    string_escape = true;
                } else if c == q {
                    self.tokens.push(Token::new(
                        TokenKind::Str,
                        std::mem::take(&mut self.word),
                        string_line,
                        string_column,
                    ));
                    quote = None;
                } else {
                    self.word.push(c);
                }
                self.advance(c);
                continue;
            }

            match comment {
                Some(CommentState::Pending) => {
                    if c == '/' {
                        comment = Some(CommentState::Line);
                        self.advance(c);
                        continue;
                    }
                    if c == '*' {
                        comment = Some(CommentState::Block);
                        self.advance(c);
                        continue;
                    }
                    // Not a comment after all: the held-back '/' was a
                    // division symbol, and `c` still needs normal handling.
                    comment = None;
                    self.flush_word();
                    self.tokens.push(Token::new(
                        TokenKind::Symbol,
                        "/",
                        self.line,
                        self.column.saturating_sub(1),
                    ));
                }
                Some(CommentState::Line) => {
                    if c == '\n' {
                        // The terminating newline is consumed with the
                        // comment and emits no newline token.
                        comment = None;
                    }
                    self.advance(c);
                    continue;
                }
                Some(CommentState::Block) => {
                    if c == '*' {
                        comment = Some(CommentState::BlockClosing);
                    }
                    self.advance(c);
                    continue;
                }
                Some(CommentState::BlockClosing) => {
                    comment = match c {
                        '/' => None,
                        '*' => Some(CommentState::BlockClosing),
                        _ => Some(CommentState::Block),
                    };
                    self.advance(c);
                    continue;
                }
                None => {}
            }

            if c == '/' {
                comment = Some(CommentState::Pending);
                self.advance(c);
                continue;
            }

            match c {
                ' ' | '\t' | '\r' => self.flush_word(),
                '\n' => {
                    self.flush_word();
                    self.tokens
                        .push(Token::new(TokenKind::Newline, "\n", self.line, self.column));
                }
                '\'' | '"' => {
                    self.flush_word();
                    quote = Some(c);
                    string_line = self.line;
                    string_column = self.column;
                }
                c if c.is_alphanumeric() || c == '_' => {
                    if self.word.is_empty() {
                        self.word_line = self.line;
                        self.word_column = self.column;
                    }
                    self.word.push(c);
                }
                _ => {
                    self.flush_word();
                    self.tokens
                        .push(Token::new(TokenKind::Symbol, c, self.line, self.column));
                }
            }
            self.advance(c);
        }

        if quote.is_some() {
            warn!(
                "unterminated string literal at line {string_line}, column {string_column}"
            );
            self.tokens.push(Token::new(
                TokenKind::Str,
                std::mem::take(&mut self.word),
                string_line,
                string_column,
            ));
        }
        self.flush_word();
        self.tokens
            .push(Token::new(TokenKind::Eof, "", self.line, self.column));
        self.tokens
    }

    fn flush_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let word = std::mem::take(&mut self.word);
        let kind = if word.chars().all(|c| c.is_ascii_digit()) {
            TokenKind::Number
        } else if KEYWORDS.contains(&word.as_str()) {
            TokenKind::Keyword
        } else {
            TokenKind::Identifier
        };
        self.tokens
            .push(Token::new(kind, word, self.word_line, self.word_column));
    }

    fn advance(&mut self, c: char) {
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
    }
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

fn unescape(c: char) -> char {
    match c {
        'b' => '\u{8}',
        'n' => '\n',
        't' => '\t',
        _ => c,
    }
}

pub fn tokenize(source: &str) -> Vec<Token> {
    Lexer::new().tokenize(source)
}
