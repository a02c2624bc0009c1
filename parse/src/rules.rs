//! Mkfiles are parsed into a RuleSet: the rules with their recipes, plus the
//! variable bindings that were in effect, which are the only mutable state
//! while parsing.

use std::collections::HashMap;

use regex::Regex;

use crate::expand::{expand, is_valid_var_name, Vars};
use crate::lexer::{Token, TokenKind};

/// Rule attribute flags, one per attribute letter.
#[derive(Debug, Default, Clone)]
pub struct Attributes {
    pub del_failed: bool,       // D: delete targets when the recipe fails
    pub non_stop: bool,         // E: don't stop if the recipe fails
    pub forced_timestamp: bool, // N: update timestamp whether the recipe does or not
    pub non_virtual: bool,      // n: a meta-rule that will only match files
    pub quiet: bool,            // Q: don't print the recipe
    pub regex: bool,            // R: regular expression meta-rule
    pub update: bool,           // U: treat the targets as if they were updated
    pub is_virtual: bool,       // V: virtual (does not correspond to files)
    pub exclusive: bool,        // X: don't execute concurrently with any other rule
}

/// An unrecognized attribute letter.
#[derive(Debug, PartialEq, Eq)]
pub struct AttribError {
    pub found: char,
}

/// A target or prerequisite pattern.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches exactly this name.
    Literal(String),
    /// A '%' rule; group 1 captures the stem.
    Suffix(Regex),
    /// An explicit regular expression under the R attribute.
    Regex(Regex),
}

impl Pattern {
    /// Match a target name, returning the submatch list (the whole match
    /// followed by capture groups), or None. Literal matches have no
    /// submatches.
    pub fn match_target(&self, target: &str) -> Option<Vec<String>> {
        match self {
            Pattern::Literal(name) => {
                if name == target {
                    Some(Vec::new())
                } else {
                    None
                }
            }
            Pattern::Suffix(re) | Pattern::Regex(re) => re.captures(target).map(|caps| {
                caps.iter()
                    .map(|m| m.map_or_else(String::new, |m| m.as_str().to_owned()))
                    .collect()
            }),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Pattern::Literal(_))
    }
}

/// A single rule.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub targets: Vec<Pattern>,
    pub attributes: Attributes,
    pub prereqs: Vec<String>,
    pub shell: Vec<String>,       // recipe interpreter argv, from S
    pub compare_prog: Vec<String>, // timestamp comparison argv, from P
    pub recipe: String,
    pub is_meta: bool,
    pub file: String,
    pub line: usize,
}

impl Rule {
    /// Two rules are interchangeable if they run the same recipe text under
    /// the same interpreter.
    pub fn equiv_recipe(&self, other: &Rule) -> bool {
        self.recipe == other.recipe && self.shell == other.shell
    }

    /// Read attribute letters, updating the rule. A 'P' or 'S' consumes the
    /// rest of the attribute segment as the program's argv.
    pub fn parse_attribs(&mut self, inputs: &[String]) -> Result<(), AttribError> {
        for (i, input) in inputs.iter().enumerate() {
            let mut chars = input.char_indices();
            while let Some((pos, c)) = chars.next() {
                match c {
                    'D' => self.attributes.del_failed = true,
                    'E' => self.attributes.non_stop = true,
                    'N' => self.attributes.forced_timestamp = true,
                    'n' => self.attributes.non_virtual = true,
                    'Q' => self.attributes.quiet = true,
                    'R' => self.attributes.regex = true,
                    'U' => self.attributes.update = true,
                    'V' => self.attributes.is_virtual = true,
                    'X' => self.attributes.exclusive = true,
                    'P' => {
                        let rest = &input[pos + c.len_utf8()..];
                        if !rest.is_empty() {
                            self.compare_prog.push(rest.to_owned());
                        }
                        self.compare_prog.extend(inputs[i + 1..].iter().cloned());
                        return Ok(());
                    }
                    'S' => {
                        let rest = &input[pos + c.len_utf8()..];
                        if !rest.is_empty() {
                            self.shell.push(rest.to_owned());
                        }
                        self.shell.extend(inputs[i + 1..].iter().cloned());
                        return Ok(());
                    }
                    found => return Err(AttribError { found }),
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AssignmentError {
    pub what: String,
    pub line: usize,
}

/// A set of rules and the variables bound while collecting them.
#[derive(Debug)]
pub struct RuleSet {
    pub vars: Vars,
    pub rules: Vec<Rule>,
    /// Maps a literal target name to indices into `rules`.
    pub target_rules: HashMap<String, Vec<usize>>,
}

impl RuleSet {
    pub fn new(vars: Vars) -> RuleSet {
        RuleSet {
            vars,
            rules: Vec::new(),
            target_rules: HashMap::new(),
        }
    }

    /// Append a rule, indexing its literal targets.
    pub fn add(&mut self, rule: Rule) {
        let k = self.rules.len();
        for target in &rule.targets {
            if let Pattern::Literal(name) = target {
                self.target_rules.entry(name.clone()).or_default().push(k);
            }
        }
        self.rules.push(rule);
    }

    /// Execute an assignment statement. `tokens` is the statement's token
    /// buffer with the assignee first and the '=' already removed.
    pub fn execute_assignment(&mut self, tokens: &[Token]) -> Result<(), AssignmentError> {
        let assignee = &tokens[0];
        if !is_valid_var_name(&assignee.text) {
            return Err(AssignmentError {
                what: format!(
                    "target of assignment is not a valid variable name: \"{}\"",
                    assignee.text
                ),
                line: assignee.line,
            });
        }

        // Interpret the remaining tokens in assignment context: word tokens
        // start new logical words, while punctuation tokens (and whatever
        // follows them) glue onto the previous one.
        let mut input: Vec<String> = Vec::new();
        for (i, t) in tokens.iter().enumerate().skip(1) {
            let glue = t.kind != TokenKind::Word || (i > 1 && tokens[i - 1].kind != TokenKind::Word);
            if glue && !input.is_empty() {
                let last = input.len() - 1;
                input[last].push_str(&t.text);
            } else {
                input.push(t.text.clone());
            }
        }

        let mut vals = Vec::new();
        for word in &input {
            let expanded = expand(word, &self.vars, true).map_err(|e| AssignmentError {
                what: e.to_string(),
                line: assignee.line,
            })?;
            vals.extend(expanded);
        }

        self.vars.insert(assignee.text.clone(), vals);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn word(text: &str) -> Token {
        Token {
            kind: TokenKind::Word,
            text: text.to_owned(),
            line: 1,
            col: 0,
        }
    }

    fn punct(kind: TokenKind, text: &str) -> Token {
        Token {
            kind,
            text: text.to_owned(),
            line: 1,
            col: 0,
        }
    }

    #[test]
    fn test_parse_attribs() {
        let mut r = Rule::default();
        r.parse_attribs(&["QV".into(), "X".into()]).expect("attribs");
        assert!(r.attributes.quiet);
        assert!(r.attributes.is_virtual);
        assert!(r.attributes.exclusive);
        assert!(!r.attributes.regex);
    }

    #[test]
    fn test_parse_attribs_unknown() {
        let mut r = Rule::default();
        let err = r.parse_attribs(&["Qz".into()]).unwrap_err();
        assert_eq!(err, AttribError { found: 'z' });
    }

    #[test]
    fn test_interpreter_attrib_consumes_rest() {
        let mut r = Rule::default();
        r.parse_attribs(&["QSpython3".into(), "-u".into()])
            .expect("attribs");
        assert!(r.attributes.quiet);
        assert_eq!(r.shell, vec!["python3", "-u"]);
    }

    #[test]
    fn test_compare_prog_attrib() {
        let mut r = Rule::default();
        r.parse_attribs(&["Pcmp".into(), "-s".into()]).expect("attribs");
        assert_eq!(r.compare_prog, vec!["cmp", "-s"]);
    }

    #[test]
    fn test_pattern_literal() {
        let p = Pattern::Literal("foo.o".into());
        assert_eq!(p.match_target("foo.o"), Some(vec![]));
        assert_eq!(p.match_target("bar.o"), None);
    }

    #[test]
    fn test_pattern_suffix() {
        let p = Pattern::Suffix(Regex::new("^(.*)\\.o$").expect("pattern"));
        let m = p.match_target("foo.o").expect("match");
        assert_eq!(m[1], "foo");
        assert!(p.match_target("foo.c").is_none());
    }

    #[test]
    fn test_equiv_recipe() {
        let mut a = Rule::default();
        a.recipe = "cc -c".into();
        let mut b = Rule::default();
        b.recipe = "cc -c".into();
        assert!(a.equiv_recipe(&b));
        b.shell = vec!["python3".into()];
        assert!(!a.equiv_recipe(&b));
    }

    #[test]
    fn test_add_indexes_literal_targets() {
        let mut rs = RuleSet::new(Vars::new());
        let mut r = Rule::default();
        r.targets = vec![Pattern::Literal("all".into())];
        rs.add(r);
        let mut r = Rule::default();
        r.targets = vec![Pattern::Literal("all".into()), Pattern::Literal("other".into())];
        rs.add(r);
        assert_eq!(rs.target_rules["all"], vec![0, 1]);
        assert_eq!(rs.target_rules["other"], vec![1]);
    }

    #[test]
    fn test_assignment_simple() {
        let mut rs = RuleSet::new(Vars::new());
        rs.execute_assignment(&[word("NAME"), word("a"), word("b"), word("c")])
            .expect("assignment");
        assert_eq!(rs.vars["NAME"], vec!["a", "b", "c"]);
    }

    #[test]
    fn test_assignment_last_wins() {
        let mut rs = RuleSet::new(Vars::new());
        rs.execute_assignment(&[word("X"), word("one")]).expect("assignment");
        rs.execute_assignment(&[word("X"), word("two")]).expect("assignment");
        assert_eq!(rs.vars["X"], vec!["two"]);
    }

    #[test]
    fn test_assignment_punctuation_glues() {
        // FLAGS = -I=inc path  =>  ["-I=inc", "path"]
        let mut rs = RuleSet::new(Vars::new());
        rs.execute_assignment(&[
            word("FLAGS"),
            word("-I"),
            punct(TokenKind::Assign, "="),
            word("inc"),
            word("path"),
        ])
        .expect("assignment");
        assert_eq!(rs.vars["FLAGS"], vec!["-I=inc", "path"]);
    }

    #[test]
    fn test_assignment_bad_name() {
        let mut rs = RuleSet::new(Vars::new());
        let err = rs.execute_assignment(&[word("2bad"), word("x")]).unwrap_err();
        assert!(err.what.contains("2bad"));
    }

    #[test]
    fn test_assignment_expands_rhs() {
        let mut rs = RuleSet::new(Vars::new());
        rs.execute_assignment(&[word("A"), word("x"), word("y")]).expect("assignment");
        rs.execute_assignment(&[word("B"), word("$A"), word("z")]).expect("assignment");
        assert_eq!(rs.vars["B"], vec!["x", "y", "z"]);
    }
}
