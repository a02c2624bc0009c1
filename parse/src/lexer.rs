//! The mkfile lexer: a state machine over the input text producing a lazy
//! stream of tokens through `Iterator`. Indentation is significant: an
//! indented block following a rule line is captured verbatim as a single
//! Recipe token.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};

/// Characters that cannot be part of a bare (unquoted) word.
const NON_BARE_CHARS: &str = " \t\n\r\\=:#'\"$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Error,
    Newline,
    Word,
    PipeInclude,
    RedirInclude,
    Colon,
    Assign,
    Recipe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// The token's source text. Error tokens carry a message instead.
    pub text: String,
    pub line: usize,
    pub col: usize,
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.kind {
            TokenKind::Newline => write!(f, "\\n"),
            _ => write!(f, "{}", self.text),
        }
    }
}

enum State {
    TopLevel,
    Comment,
    Include,
    DoubleQuoted,
    SingleQuoted,
    BackQuoted,
    Recipe,
    BareWord,
    BracketExpansion,
}

pub struct Lexer<'a> {
    input: &'a str,
    pending: VecDeque<Token>,
    state: Option<State>,
    start: usize,     // token beginning
    start_col: usize, // column on which the token begins
    pos: usize,       // position within input
    line: usize,      // line within input
    col: usize,       // column within input
    indented: bool,   // true if only whitespace so far on this line
    bare_words: bool, // lex only a sequence of words, stop at end of line
}

impl<'a> Lexer<'a> {
    /// Lex a whole mkfile.
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            input,
            pending: VecDeque::new(),
            state: Some(State::TopLevel),
            start: 0,
            start_col: 0,
            pos: 0,
            line: 1,
            col: 0,
            indented: true,
            bare_words: false,
        }
    }

    /// Lex a sequence of shell-like words, stopping at the first newline
    /// that ends a non-empty line. Used to split backtick output.
    pub fn words(input: &'a str) -> Lexer<'a> {
        Lexer {
            bare_words: true,
            ..Lexer::new(input)
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_n(&self, n: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(n)
    }

    /// Consume and return the next character.
    fn next_ch(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.col = 0;
            self.line += 1;
            self.indented = true;
        } else {
            self.col += 1;
            if c != ' ' && c != '\t' {
                self.indented = false;
            }
        }
        Some(c)
    }

    /// Consume the next character without including it in the current token.
    fn skip_ch(&mut self) {
        self.next_ch();
        self.start = self.pos;
        self.start_col = self.col;
    }

    fn emit(&mut self, kind: TokenKind) {
        self.pending.push_back(Token {
            kind,
            text: self.input[self.start..self.pos].to_owned(),
            line: self.line,
            col: self.start_col,
        });
        self.start = self.pos;
        self.start_col = self.col;
    }

    fn lex_error(&mut self, what: String) {
        self.pending.push_back(Token {
            kind: TokenKind::Error,
            text: what,
            line: self.line,
            col: self.start_col,
        });
        self.start = self.pos;
    }

    /// Consume the next character if it is in `valid`.
    fn accept(&mut self, valid: &str) -> bool {
        match self.peek() {
            Some(c) if valid.contains(c) => {
                self.next_ch();
                true
            }
            _ => false,
        }
    }

    /// Consume characters from `valid` until the next is not.
    fn accept_run(&mut self, valid: &str) {
        while let Some(c) = self.peek() {
            if !valid.contains(c) {
                break;
            }
            self.next_ch();
        }
    }

    /// Consume until a character from `invalid` or the end of the input.
    fn accept_until(&mut self, invalid: &str) {
        while let Some(c) = self.peek() {
            if invalid.contains(c) {
                break;
            }
            self.next_ch();
        }
    }

    /// Skip characters from `valid` until the next is not.
    fn skip_run(&mut self, valid: &str) {
        while let Some(c) = self.peek() {
            if !valid.contains(c) {
                break;
            }
            self.skip_ch();
        }
    }

    /// Skip until a character from `invalid` or the end of the input.
    fn skip_until(&mut self, invalid: &str) {
        while let Some(c) = self.peek() {
            if invalid.contains(c) {
                break;
            }
            self.skip_ch();
        }
    }

    fn step(&mut self, state: State) -> Option<State> {
        match state {
            State::TopLevel => self.lex_top_level(),
            State::Comment => self.lex_comment(),
            State::Include => self.lex_include(),
            State::DoubleQuoted => self.lex_double_quoted(),
            State::SingleQuoted => self.lex_single_quoted(),
            State::BackQuoted => self.lex_back_quoted(),
            State::Recipe => self.lex_recipe(),
            State::BareWord => self.lex_bare_word(),
            State::BracketExpansion => self.lex_bracket_expansion(),
        }
    }

    fn lex_top_level(&mut self) -> Option<State> {
        loop {
            self.skip_run(" \t\r");
            // Emit a newline token if we are ending a non-empty line.
            if self.peek() == Some('\n') && !self.indented {
                self.next_ch();
                if self.bare_words {
                    return None;
                }
                self.emit(TokenKind::Newline);
            }
            self.skip_run(" \t\r\n");

            if self.peek() == Some('\\') && self.peek_n(1) == Some('\n') {
                self.skip_ch();
                self.skip_ch();
                self.indented = false;
            } else {
                break;
            }
        }

        if self.indented && self.col > 0 {
            return Some(State::Recipe);
        }

        match self.peek()? {
            '#' => Some(State::Comment),
            '<' => Some(State::Include),
            ':' => {
                self.next_ch();
                self.emit(TokenKind::Colon);
                Some(State::TopLevel)
            }
            '=' => {
                self.next_ch();
                self.emit(TokenKind::Assign);
                Some(State::TopLevel)
            }
            '"' => Some(State::DoubleQuoted),
            '\'' => Some(State::SingleQuoted),
            '`' => Some(State::BackQuoted),
            _ => Some(State::BareWord),
        }
    }

    fn lex_comment(&mut self) -> Option<State> {
        self.skip_ch(); // '#'
        self.skip_until("\n");
        Some(State::TopLevel)
    }

    fn lex_include(&mut self) -> Option<State> {
        self.next_ch(); // '<'
        if self.accept("|") {
            self.emit(TokenKind::PipeInclude);
        } else {
            self.emit(TokenKind::RedirInclude);
        }
        Some(State::TopLevel)
    }

    fn lex_double_quoted(&mut self) -> Option<State> {
        let opened = self.line;
        self.next_ch(); // '"'
        while let Some(c) = self.peek() {
            if c == '"' {
                break;
            }
            self.accept_until("\\\"");
            if self.accept("\\") {
                self.accept("\"");
            }
        }

        if self.peek().is_none() {
            self.lex_error(format!(
                "end of file encountered while looking for closing '\"' of a string opened on line {}",
                opened
            ));
            return None;
        }

        self.next_ch(); // '"'
        Some(State::BareWord)
    }

    fn lex_single_quoted(&mut self) -> Option<State> {
        let opened = self.line;
        self.next_ch(); // '\''
        self.accept_until("'");
        if self.peek().is_none() {
            self.lex_error(format!(
                "end of file encountered while looking for closing \"'\" of a string opened on line {}",
                opened
            ));
            return None;
        }
        self.next_ch(); // '\''
        Some(State::BareWord)
    }

    fn lex_back_quoted(&mut self) -> Option<State> {
        let opened = self.line;
        self.next_ch(); // '`'
        self.accept_until("`");
        if self.peek().is_none() {
            self.lex_error(format!(
                "end of file encountered while looking for closing '`' of a command opened on line {}",
                opened
            ));
            return None;
        }
        self.next_ch(); // '`'
        Some(State::BareWord)
    }

    fn lex_recipe(&mut self) -> Option<State> {
        loop {
            self.accept_until("\n");
            self.accept_run(" \t\n\r");
            if !self.indented || self.col == 0 || self.peek().is_none() {
                break;
            }
        }

        let text = &self.input[self.start..self.pos];
        if text.chars().any(|c| !" \t\r\n".contains(c)) {
            self.emit(TokenKind::Recipe);
        } else {
            // An all-whitespace indented block is not a recipe.
            self.start = self.pos;
            self.start_col = self.col;
        }
        Some(State::TopLevel)
    }

    fn lex_bare_word(&mut self) -> Option<State> {
        self.accept_until(NON_BARE_CHARS);
        match self.peek() {
            Some('"') => return Some(State::DoubleQuoted),
            Some('\'') => return Some(State::SingleQuoted),
            Some('`') => return Some(State::BackQuoted),
            Some('\\') => match self.peek_n(1) {
                Some('\n') | Some('\r') => {
                    // A line continuation ends the current word.
                    if self.start < self.pos {
                        self.emit(TokenKind::Word);
                    }
                    self.skip_ch();
                    self.skip_ch();
                    return Some(State::TopLevel);
                }
                _ => {
                    self.next_ch();
                    self.next_ch();
                    return Some(State::BareWord);
                }
            },
            Some('$') => {
                if self.peek_n(1) == Some('{') {
                    return Some(State::BracketExpansion);
                }
                self.next_ch();
                return Some(State::BareWord);
            }
            _ => {}
        }

        if self.start < self.pos {
            self.emit(TokenKind::Word);
        }
        Some(State::TopLevel)
    }

    fn lex_bracket_expansion(&mut self) -> Option<State> {
        let opened = self.line;
        self.next_ch(); // '$'
        self.next_ch(); // '{'
        self.accept_until("}");
        if self.peek().is_none() {
            self.lex_error(format!(
                "end of file encountered while looking for closing '}}' of a reference opened on line {}",
                opened
            ));
            return None;
        }
        self.next_ch(); // '}'
        Some(State::BareWord)
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        while self.pending.is_empty() {
            match self.state.take() {
                None => return None,
                Some(state) => self.state = self.step(state),
            }
        }
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::{Lexer, Token, TokenKind};

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input).map(|t| t.kind).collect()
    }

    fn texts(input: &str) -> Vec<String> {
        Lexer::new(input).map(|t| t.text).collect()
    }

    #[test]
    fn test_simple_rule_tokens() {
        let tokens: Vec<Token> = Lexer::new("foo.o: foo.c\n").collect();
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![
                TokenKind::Word,
                TokenKind::Colon,
                TokenKind::Word,
                TokenKind::Newline
            ]
        );
        assert_eq!(tokens[0].text, "foo.o");
        assert_eq!(tokens[2].text, "foo.c");
        assert_eq!(tokens[0].line, 1);
    }

    #[test]
    fn test_assignment_tokens() {
        assert_eq!(
            kinds("CC = gcc\n"),
            vec![
                TokenKind::Word,
                TokenKind::Assign,
                TokenKind::Word,
                TokenKind::Newline
            ]
        );
    }

    #[test]
    fn test_comment_skipped() {
        assert_eq!(
            kinds("# a comment\nfoo:\n"),
            vec![
                TokenKind::Newline, // comment-only lines still end a line
                TokenKind::Word,
                TokenKind::Colon,
                TokenKind::Newline
            ]
        );
    }

    #[test]
    fn test_includes() {
        assert_eq!(
            kinds("<rules.mk\n"),
            vec![TokenKind::RedirInclude, TokenKind::Word, TokenKind::Newline]
        );
        assert_eq!(
            kinds("<|echo hi\n"),
            vec![
                TokenKind::PipeInclude,
                TokenKind::Word,
                TokenKind::Word,
                TokenKind::Newline
            ]
        );
    }

    #[test]
    fn test_recipe_block() {
        let tokens: Vec<Token> = Lexer::new("all:\n\techo one\n\techo two\nnext:\n").collect();
        let recipe = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Recipe)
            .expect("a recipe token");
        assert_eq!(recipe.text, "echo one\n\techo two\n");
        assert_eq!(recipe.col, 1);
        // The following rule is lexed normally.
        assert!(tokens
            .iter()
            .any(|t| t.kind == TokenKind::Word && t.text == "next"));
    }

    #[test]
    fn test_recipe_spans_blank_lines() {
        let tokens: Vec<Token> = Lexer::new("all:\n\techo one\n\n\techo two\n").collect();
        let recipe = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Recipe)
            .expect("a recipe token");
        assert!(recipe.text.contains("echo one"));
        assert!(recipe.text.contains("echo two"));
    }

    #[test]
    fn test_blank_indented_block_is_no_recipe() {
        let tokens: Vec<Token> = Lexer::new("all:\n   \n").collect();
        assert!(tokens.iter().all(|t| t.kind != TokenKind::Recipe));
    }

    #[test]
    fn test_quoted_words_extend_bare_word() {
        let tokens = texts("name='with space'\n");
        assert_eq!(tokens[0], "name");
        // The quotes stay in the token; expansion strips them later.
        assert_eq!(tokens[2], "'with space'");
    }

    #[test]
    fn test_line_continuation() {
        assert_eq!(
            kinds("a: b \\\nc\n"),
            vec![
                TokenKind::Word,
                TokenKind::Colon,
                TokenKind::Word,
                TokenKind::Word,
                TokenKind::Newline
            ]
        );
    }

    #[test]
    fn test_unterminated_quote_is_error() {
        for input in &["x = 'oops\n", "x = \"oops\n", "x = `oops\n", "x = ${oops\n"] {
            let tokens: Vec<Token> = Lexer::new(input).collect();
            let last = tokens.last().expect("tokens");
            assert_eq!(last.kind, TokenKind::Error, "input: {:?}", input);
            assert!(last.text.contains("line 1"), "message: {}", last.text);
        }
    }

    #[test]
    fn test_words_mode_stops_at_newline() {
        let tokens: Vec<Token> = Lexer::words("a b c\nd e\n").collect();
        assert_eq!(
            tokens.iter().map(|t| t.text.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Word));
    }

    #[test]
    fn test_dollar_stays_in_word() {
        let tokens = texts("out: $OBJS\n");
        assert_eq!(tokens[2], "$OBJS");
    }

    #[test]
    fn test_bracket_reference_spans_colon() {
        // ${X:%.c=%.o} must stay one word despite the ':' and '='.
        let tokens: Vec<Token> = Lexer::new("Y = ${X:%.c=%.o}\n").collect();
        assert_eq!(tokens[2].text, "${X:%.c=%.o}");
        assert_eq!(tokens[2].kind, TokenKind::Word);
    }

    #[test]
    fn test_columns() {
        let tokens: Vec<Token> = Lexer::new("ab cd\n").collect();
        assert_eq!(tokens[0].col, 0);
        assert_eq!(tokens[1].col, 3);
    }
}
