/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The mkfile parser. It executes assignments and includes as it goes and
//! collects rules into a RuleSet. The parser itself is a table of small
//! state functions, each accepting one token and returning the next state.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

use mk_subprocess::subprocess;

use crate::expand::{expand, expand_recipe, Vars};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::rules::{Pattern, Rule, RuleSet};

#[derive(Debug, Error)]
#[error("{file}:{line}: syntax error: {message}")]
pub struct ParseError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn basic<S: Into<String>>(file: &str, line: usize, message: S) -> ParseError {
        ParseError {
            file: file.to_owned(),
            line,
            message: message.into(),
        }
    }
}

/// A parser state function takes the parser and the next token and returns
/// the state for the token after it.
struct StateFn(fn(&mut Parser, Token) -> Result<StateFn, ParseError>);

pub struct Parser<'a> {
    /// Name of the file being parsed, for diagnostics.
    name: String,
    /// Full path of the file being parsed.
    path: PathBuf,
    /// Tokens consumed on the current statement.
    token_buf: Vec<Token>,
    rules: &'a mut RuleSet,
}

/// Parse a mkfile, returning a new RuleSet seeded with `env`.
pub fn parse(input: &str, name: &str, path: &Path, env: Vars) -> Result<RuleSet, ParseError> {
    let mut rules = RuleSet::new(env);
    parse_into(input, name, &mut rules, path)?;
    Ok(rules)
}

/// Parse a mkfile, inserting rules and variables into an existing RuleSet.
/// While parsing, `mkfiledir` is bound to the directory containing `path`
/// and restored afterwards.
pub fn parse_into(
    input: &str,
    name: &str,
    rules: &mut RuleSet,
    path: &Path,
) -> Result<(), ParseError> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_owned());
    let saved = rules.vars.insert("mkfiledir".to_owned(), vec![dir]);

    let mut parser = Parser {
        name: name.to_owned(),
        path: path.to_owned(),
        token_buf: Vec::new(),
        rules,
    };
    let result = parser.run(input);

    match saved {
        Some(old) => {
            parser.rules.vars.insert("mkfiledir".to_owned(), old);
        }
        None => {
            parser.rules.vars.remove("mkfiledir");
        }
    }
    result
}

impl<'a> Parser<'a> {
    fn run(&mut self, input: &str) -> Result<(), ParseError> {
        let mut state = StateFn(Parser::parse_top_level);
        let mut last_line = 1;
        for token in Lexer::new(input) {
            if token.kind == TokenKind::Error {
                return Err(ParseError::basic(&self.name, token.line, token.text));
            }
            last_line = token.line;
            state = (state.0)(self, token)?;
        }

        // Two dummy newlines let a trailing assignment or recipeless rule
        // finish even when the file does not end in a newline.
        for _ in 0..2 {
            let newline = Token {
                kind: TokenKind::Newline,
                text: "\n".to_owned(),
                line: last_line,
                col: 0,
            };
            state = (state.0)(self, newline)?;
        }
        Ok(())
    }

    /// Pretty errors.
    fn syntax_error(&self, context: &str, expected: &str, found: &Token) -> ParseError {
        ParseError::basic(
            &self.name,
            found.line,
            format!(
                "while {}, expected {} but found '{}'.",
                context, expected, found
            ),
        )
    }

    /// Accept a token for use in the current statement.
    fn push(&mut self, t: Token) {
        self.token_buf.push(t);
    }

    /// Clear the accepted tokens. Called when a statement is finished.
    fn clear(&mut self) {
        self.token_buf.clear();
    }

    /// At the top level of a mkfile, expecting rules, assignments, or
    /// includes.
    fn parse_top_level(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Newline => Ok(StateFn(Parser::parse_top_level)),
            TokenKind::PipeInclude => Ok(StateFn(Parser::parse_pipe_include)),
            TokenKind::RedirInclude => Ok(StateFn(Parser::parse_redir_include)),
            TokenKind::Word => {
                p.push(t);
                Ok(StateFn(Parser::parse_equals_or_target))
            }
            _ => Err(p.syntax_error("parsing mkfile", "a rule, include, or assignment", &t)),
        }
    }

    /// Consumed a '<|'.
    fn parse_pipe_include(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Newline => {
                if p.token_buf.is_empty() {
                    return Err(ParseError::basic(&p.name, t.line, "empty pipe include"));
                }

                // Reassemble the command with its original spacing; adjacent
                // tokens on the same line are joined without a separator.
                let mut command = String::new();
                let mut prev: Option<&Token> = None;
                for tok in &p.token_buf {
                    if let Some(prev) = prev {
                        let adjacent = prev.line == tok.line
                            && prev.col + prev.text.chars().count() == tok.col;
                        if !adjacent {
                            command.push(' ');
                        }
                    }
                    command.push_str(&tok.text);
                    prev = Some(tok);
                }

                let line = p.token_buf[0].line;
                let output = match subprocess("sh", &["-c".to_owned(), command], "", true) {
                    Ok((output, true)) => output,
                    Ok((_, false)) => {
                        return Err(ParseError::basic(&p.name, line, "subprocess include failed"))
                    }
                    Err(e) => {
                        return Err(ParseError::basic(
                            &p.name,
                            line,
                            format!("subprocess include failed: {}", e),
                        ))
                    }
                };

                let name = format!("{}:sh", p.name);
                let path = p.path.clone();
                parse_into(&output, &name, p.rules, &path)?;

                p.clear();
                Ok(StateFn(Parser::parse_top_level))
            }

            // Almost anything goes. Let the shell sort it out.
            TokenKind::PipeInclude
            | TokenKind::RedirInclude
            | TokenKind::Colon
            | TokenKind::Assign
            | TokenKind::Word => {
                p.push(t);
                Ok(StateFn(Parser::parse_pipe_include))
            }

            _ => Err(p.syntax_error("parsing piped include", "a shell command", &t)),
        }
    }

    /// Consumed a '<'.
    fn parse_redir_include(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Newline => {
                let mut filename = String::new();
                for tok in &p.token_buf {
                    filename.push_str(&tok.text);
                }
                let expanded = expand(&filename, &p.rules.vars, false)
                    .map_err(|e| ParseError::basic(&p.name, t.line, e.to_string()))?;
                if let Some(first) = expanded.into_iter().next() {
                    filename = first;
                }

                let line = p.token_buf.first().map_or(t.line, |t| t.line);
                let input = std::fs::read_to_string(&filename).map_err(|_| {
                    ParseError::basic(&p.name, line, format!("cannot open {}", filename))
                })?;
                let path = std::fs::canonicalize(&filename).map_err(|_| {
                    ParseError::basic(
                        &p.name,
                        line,
                        format!("unable to find {}'s absolute path", filename),
                    )
                })?;

                parse_into(&input, &filename, p.rules, &path)?;

                p.clear();
                Ok(StateFn(Parser::parse_top_level))
            }

            TokenKind::Word => {
                p.push(t);
                Ok(StateFn(Parser::parse_redir_include))
            }

            _ => Err(p.syntax_error("parsing include", "a file name", &t)),
        }
    }

    /// Consumed one bare string at the beginning of the line.
    fn parse_equals_or_target(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Assign => Ok(StateFn(Parser::parse_assignment)),
            TokenKind::Word => {
                p.push(t);
                Ok(StateFn(Parser::parse_targets))
            }
            TokenKind::Colon => {
                p.push(t);
                Ok(StateFn(Parser::parse_attributes_or_prereqs))
            }
            _ => Err(p.syntax_error(
                "reading a target or assignment",
                "'=', ':', or another target",
                &t,
            )),
        }
    }

    /// Consumed 'foo ='. Everything up to the newline is the value.
    fn parse_assignment(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Newline => {
                let name = p.name.clone();
                p.rules
                    .execute_assignment(&p.token_buf)
                    .map_err(|e| ParseError::basic(&name, e.line, e.what))?;
                p.clear();
                Ok(StateFn(Parser::parse_top_level))
            }
            _ => {
                p.push(t);
                Ok(StateFn(Parser::parse_assignment))
            }
        }
    }

    /// Everything up to the first ':' must be a target.
    fn parse_targets(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Word => {
                p.push(t);
                Ok(StateFn(Parser::parse_targets))
            }
            TokenKind::Colon => {
                p.push(t);
                Ok(StateFn(Parser::parse_attributes_or_prereqs))
            }
            _ => Err(p.syntax_error("reading a rule's targets", "filename or pattern", &t)),
        }
    }

    /// Consumed the targets and the first ':'.
    fn parse_attributes_or_prereqs(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Newline => Ok(StateFn(Parser::parse_recipe)),
            TokenKind::Colon => {
                p.push(t);
                Ok(StateFn(Parser::parse_prereqs))
            }
            TokenKind::Word => {
                p.push(t);
                Ok(StateFn(Parser::parse_attributes_or_prereqs))
            }
            _ => Err(p.syntax_error(
                "reading a rule's attributes or prerequisites",
                "an attribute, pattern, or filename",
                &t,
            )),
        }
    }

    /// Targets, attributes, and the second ':' have been consumed.
    fn parse_prereqs(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        match t.kind {
            TokenKind::Newline => Ok(StateFn(Parser::parse_recipe)),
            TokenKind::Word => {
                p.push(t);
                Ok(StateFn(Parser::parse_prereqs))
            }
            _ => Err(p.syntax_error("reading a rule's prerequisites", "filename or pattern", &t)),
        }
    }

    /// An entire rule line has been consumed; `t` is either its recipe or
    /// the first token of the next statement.
    fn parse_recipe(p: &mut Parser, t: Token) -> Result<StateFn, ParseError> {
        let rule = p.assemble_rule(&t)?;
        p.rules.add(rule);
        p.clear();

        if t.kind == TokenKind::Recipe {
            Ok(StateFn(Parser::parse_top_level))
        } else {
            // The current token doesn't belong to this rule.
            Parser::parse_top_level(p, t)
        }
    }

    fn assemble_rule(&mut self, t: &Token) -> Result<Rule, ParseError> {
        let mut r = Rule::default();
        r.file = self.name.clone();
        r.line = self.token_buf.first().map_or(t.line, |tok| tok.line);

        // Find one or two colons.
        let buf_len = self.token_buf.len();
        let i = self
            .token_buf
            .iter()
            .position(|tok| tok.kind == TokenKind::Colon)
            .unwrap_or(buf_len);
        let j = self
            .token_buf
            .iter()
            .enumerate()
            .skip(i + 1)
            .find(|(_, tok)| tok.kind == TokenKind::Colon)
            .map_or(buf_len, |(k, _)| k);

        // The rule has attributes between the two colons.
        if j < buf_len {
            let mut attribs = Vec::new();
            for k in i + 1..j {
                let tok = &self.token_buf[k];
                let exparts = expand(&tok.text, &self.rules.vars, true)
                    .map_err(|e| ParseError::basic(&self.name, tok.line, e.to_string()))?;
                attribs.extend(exparts);
            }
            if let Err(e) = r.parse_attribs(&attribs) {
                let line = self.token_buf[i + 1].line;
                return Err(ParseError::basic(
                    &self.name,
                    line,
                    format!(
                        "while reading a rule's attributes expected an attribute but found \"{}\".",
                        e.found
                    ),
                ));
            }
            if r.attributes.regex {
                r.is_meta = true;
            }
        }

        // Targets.
        for k in 0..i {
            let tok = &self.token_buf[k];
            let exparts = expand(&tok.text, &self.rules.vars, true)
                .map_err(|e| ParseError::basic(&self.name, tok.line, e.to_string()))?;
            for targetstr in exparts {
                if r.attributes.regex {
                    let rpat = Regex::new(&format!("^{}$", targetstr)).map_err(|err| {
                        ParseError::basic(
                            &self.name,
                            tok.line,
                            format!("invalid regular expression: {}", err),
                        )
                    })?;
                    r.targets.push(Pattern::Regex(rpat));
                } else if let Some(idx) = find_unescaped_percent(&targetstr) {
                    let left = regex::escape(&unescape_percent(&targetstr[..idx]));
                    let right = regex::escape(&unescape_percent(&targetstr[idx + 1..]));
                    let rpat = Regex::new(&format!("^{}(.*){}$", left, right))
                        .expect("quoted suffix pattern");
                    r.targets.push(Pattern::Suffix(rpat));
                    r.is_meta = true;
                } else {
                    r.targets
                        .push(Pattern::Literal(unescape_percent(&targetstr)));
                }
            }
        }

        // Prereqs are kept as raw templates; stems are substituted at graph
        // build time.
        for k in j + 1..buf_len {
            let tok = &self.token_buf[k];
            let exparts = expand(&tok.text, &self.rules.vars, true)
                .map_err(|e| ParseError::basic(&self.name, tok.line, e.to_string()))?;
            r.prereqs.extend(exparts);
        }

        if t.kind == TokenKind::Recipe {
            let unindented = strip_indentation(&t.text, t.col);
            r.recipe = expand_recipe(&unindented, &self.rules.vars, true);
        }

        Ok(r)
    }
}

/// Position of the first '%' not preceded by a backslash.
fn find_unescaped_percent(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '%' => return Some(i),
            _ => {}
        }
    }
    None
}

fn unescape_percent(s: &str) -> String {
    s.replace("\\%", "%")
}

/// Try to unindent a recipe so it begins at column 0. (This is mainly for
/// recipes in python or other indentation-significant languages.)
pub fn strip_indentation(s: &str, min_col: usize) -> String {
    let mut output = String::new();
    for line in s.split_inclusive('\n') {
        let mut col = 0;
        let mut start = 0;
        for (i, c) in line.char_indices() {
            if col >= min_col || (c != ' ' && c != '\t') {
                start = i;
                break;
            }
            col += 1;
            start = i + c.len_utf8();
        }
        output.push_str(&line[start..]);
    }
    output
}
