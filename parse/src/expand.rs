//! String substitution and expansion: variable references, quote stripping,
//! backtick command substitution, recipe sigils, and suffix stems.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use mk_subprocess::{subprocess, SpawnError};

use crate::lexer::Lexer;

/// Variable bindings. Every variable holds a list of values.
pub type Vars = HashMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("backtick substitution failed: {0}")]
    Backtick(#[from] SpawnError),
}

/// Matches the inside of `${name:A%B=C%D}`.
static NAMELIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([^:]+)\s*:\s*([^%]*)%([^=]*)\s*=\s*([^%]*)%([^%]*)\s*$")
        .expect("namelist pattern")
});

pub fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand a word into a list of words. This substitutes variables, strips
/// quotes, and (when allowed) executes backtick commands.
pub fn expand(input: &str, vars: &Vars, expand_backticks: bool) -> Result<Vec<String>, ExpandError> {
    let mut parts: Vec<String> = Vec::new();
    let mut expanded = String::new();
    let mut i = 0;

    while i < input.len() {
        let j = match input[i..].find(|c| "\"'`$\\".contains(c)) {
            None => {
                expanded.push_str(&input[i..]);
                break;
            }
            Some(off) => i + off,
        };
        expanded.push_str(&input[i..j]);
        let c = match input[j..].chars().next() {
            Some(c) => c,
            None => break,
        };
        i = j + c.len_utf8();

        let off = match c {
            '\\' => {
                let (out, off) = expand_escape(&input[i..]);
                expanded.push_str(&out);
                off
            }
            '"' => {
                let (out, off) = expand_double_quoted(&input[i..], vars, expand_backticks)?;
                expanded.push_str(&out);
                off
            }
            '\'' => {
                let (out, off) = expand_single_quoted(&input[i..]);
                expanded.push_str(&out);
                off
            }
            '`' => {
                if expand_backticks {
                    let (outparts, off) = expand_back_quoted(&input[i..], vars)?;
                    splice(&mut parts, &mut expanded, outparts);
                    off
                } else {
                    // Keep the backquoted text verbatim.
                    expanded.push('`');
                    expanded.push_str(&input[i..]);
                    input.len() - i
                }
            }
            '$' => {
                let (outparts, off) = expand_sigil(&input[i..], vars);
                splice(&mut parts, &mut expanded, outparts);
                off
            }
            _ => 0,
        };
        i += off;
    }

    if !expanded.is_empty() {
        parts.push(expanded);
    }
    Ok(parts)
}

/// Splice a multi-valued expansion into the word stream: the first value
/// extends the current partial word, the last becomes the new partial.
fn splice(parts: &mut Vec<String>, expanded: &mut String, mut outparts: Vec<String>) {
    if outparts.is_empty() {
        return;
    }
    let last = outparts.len() - 1;
    outparts[0] = format!("{}{}", expanded, outparts[0]);
    *expanded = outparts[last].clone();
    parts.extend(outparts.into_iter().take(last));
}

/// Expand following a '\'.
fn expand_escape(input: &str) -> (String, usize) {
    match input.chars().next() {
        Some(c) if c == ' ' || c == '\t' => (c.to_string(), c.len_utf8()),
        Some(c) => (format!("\\{}", c), c.len_utf8()),
        None => ("\\".to_owned(), 0),
    }
}

/// Expand a double quoted string starting after a '"'. The inside is
/// expanded recursively and joined with single spaces.
fn expand_double_quoted(
    input: &str,
    vars: &Vars,
    expand_backticks: bool,
) -> Result<(String, usize), ExpandError> {
    let mut j = 0;
    while let Some(off) = input[j..].find(|c| c == '"' || c == '\\') {
        let at = j + off;
        let c = match input[at..].chars().next() {
            Some(c) => c,
            None => break,
        };
        if c == '"' {
            let inner = expand(&input[..at], vars, expand_backticks)?;
            return Ok((inner.join(" "), at + c.len_utf8()));
        }
        // Skip the backslash and whatever it escapes.
        j = at + c.len_utf8();
        match input[j..].chars().next() {
            Some(escaped) => j += escaped.len_utf8(),
            None => break,
        }
    }
    Ok((input.to_owned(), input.len()))
}

/// Expand a single quoted string starting after a '\''.
fn expand_single_quoted(input: &str) -> (String, usize) {
    match input.find('\'') {
        Some(j) => (input[..j].to_owned(), j + 1),
        None => (input.to_owned(), input.len()),
    }
}

/// Expand something starting after a '$'. Returns the replacement values
/// and how much of the input was consumed.
fn expand_sigil(input: &str, vars: &Vars) -> (Vec<String>, usize) {
    let first = match input.chars().next() {
        Some(c) => c,
        None => return (vec!["$".to_owned()], 0),
    };

    // "$$" is an escaped '$'.
    if first == '$' {
        return (vec!["$".to_owned()], 1);
    }

    // Bracketed references: ${foo} or ${foo:a%b=c%d}.
    if first == '{' {
        let j = match input[1..].find('}') {
            Some(j) => j,
            None => return (vec![format!("${}", input)], input.len()),
        };
        let varname = &input[1..1 + j];
        let offset = 1 + j + 1;

        if let Some(mat) = NAMELIST.captures(varname) {
            let name = mat.get(1).map_or("", |m| m.as_str());
            if is_valid_var_name(name) {
                let values = match vars.get(name) {
                    Some(values) => values,
                    None => return (Vec::new(), offset),
                };
                let (a, b) = (&mat[2], &mat[3]);
                let (c, d) = (&mat[4], &mat[5]);
                let pat = Regex::new(&format!(
                    "^{}(.*){}$",
                    regex::escape(a),
                    regex::escape(b)
                ))
                .expect("escaped namelist pattern");
                let rewritten = values
                    .iter()
                    .map(|value| match pat.captures(value) {
                        Some(m) => format!("{}{}{}", c, &m[1], d),
                        None => value.clone(),
                    })
                    .collect();
                return (rewritten, offset);
            }
        }

        return lookup(varname, &input[..offset], vars, offset);
    }

    // Bare references: $foo.
    let mut j = 0;
    for c in input.chars() {
        let ok = c.is_ascii_alphabetic() || c == '_' || (j > 0 && c.is_ascii_digit());
        if !ok {
            break;
        }
        j += c.len_utf8();
    }
    if j == 0 {
        return (vec![format!("${}", input)], input.len());
    }
    lookup(&input[..j], &input[..j], vars, j)
}

fn lookup(varname: &str, reference: &str, vars: &Vars, offset: usize) -> (Vec<String>, usize) {
    if is_valid_var_name(varname) {
        match vars.get(varname) {
            Some(values) => (values.clone(), offset),
            // Unbound references are kept verbatim.
            None => (vec![format!("${}", reference)], offset),
        }
    } else {
        (vec![format!("${}", reference)], offset)
    }
}

/// Expand all sigils in a recipe, producing a flat string. Lists are joined
/// with single spaces; no quote handling and no word splitting.
///
/// With `keep_escapes` set, `\$` and `$$` pass through untouched so a later
/// expansion pass still sees them; this is used when recipes are pre-expanded
/// at parse time. Without it `\$` becomes a literal '$'.
pub fn expand_recipe(input: &str, vars: &Vars, keep_escapes: bool) -> String {
    let mut expanded = String::new();
    let mut i = 0;

    while i < input.len() {
        let j = match input[i..].find(|c| c == '$' || c == '\\') {
            None => {
                expanded.push_str(&input[i..]);
                break;
            }
            Some(off) => i + off,
        };
        expanded.push_str(&input[i..j]);
        i = j;

        let c = match input[i..].chars().next() {
            Some(c) => c,
            None => break,
        };
        i += c.len_utf8();
        if c == '$' {
            if keep_escapes && input[i..].starts_with('$') {
                expanded.push_str("$$");
                i += 1;
                continue;
            }
            let (parts, off) = expand_sigil(&input[i..], vars);
            expanded.push_str(&parts.join(" "));
            i += off;
        } else {
            match input[i..].chars().next() {
                Some('$') => {
                    if keep_escapes {
                        expanded.push_str("\\$");
                    } else {
                        expanded.push('$');
                    }
                    i += 1;
                }
                Some(other) => {
                    expanded.push('\\');
                    expanded.push(other);
                    i += other.len_utf8();
                }
                None => expanded.push('\\'),
            }
        }
    }

    expanded
}

/// Replace every unescaped '%' with the stem; `\%` yields a literal '%'.
pub fn expand_suffixes(input: &str, stem: &str) -> String {
    let mut expanded = String::new();
    let mut i = 0;

    while i < input.len() {
        let j = match input[i..].find(|c| c == '%' || c == '\\') {
            None => {
                expanded.push_str(&input[i..]);
                break;
            }
            Some(off) => i + off,
        };
        expanded.push_str(&input[i..j]);
        i = j;

        let c = match input[i..].chars().next() {
            Some(c) => c,
            None => break,
        };
        if c == '%' {
            expanded.push_str(stem);
            i += 1;
        } else {
            // Backslash: '\%' is a literal '%', anything else stays as-is.
            if input[i + 1..].starts_with('%') {
                expanded.push('%');
                i += 2;
            } else {
                expanded.push('\\');
                i += 1;
            }
        }
    }

    expanded
}

/// Expand a backtick quoted command by executing its contents through the
/// platform shell and splitting the output into words.
fn expand_back_quoted(input: &str, _vars: &Vars) -> Result<(Vec<String>, usize), ExpandError> {
    let j = match input.find('`') {
        Some(j) => j,
        None => return Ok((vec![input.to_owned()], input.len())),
    };

    let (output, _) = subprocess("sh", &[], &input[..j], true)?;
    let parts = Lexer::words(&output).map(|t| t.text).collect();
    Ok((parts, j + 1))
}
