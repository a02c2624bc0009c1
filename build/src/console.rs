//! Terminal output. A single process-wide message lock keeps announcement
//! lines from concurrent recipes from interleaving.

use std::io::{self, Write};
use std::sync::Mutex;

use once_cell::sync::Lazy;

static MSG_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Indent each line of `s` after the first by `ind` spaces.
pub fn print_indented(out: &mut dyn Write, s: &str, ind: usize) -> io::Result<()> {
    let indentation = " ".repeat(ind);
    let mut first_line = true;
    for line in s.split_inclusive('\n') {
        if !first_line {
            out.write_all(indentation.as_bytes())?;
        }
        out.write_all(line.as_bytes())?;
        first_line = false;
    }
    Ok(())
}

/// Announce a recipe. Quiet rules print only a `target: ...` header.
pub fn print_recipe(target: &str, recipe: &str, quiet: bool) {
    let _guard = MSG_LOCK.lock();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = write!(out, "{}: ", target);
    if quiet {
        let _ = writeln!(out, "...");
    } else {
        let _ = print_indented(&mut out, recipe, target.len() + 2);
        if recipe.is_empty() || !recipe.ends_with('\n') {
            let _ = writeln!(out);
        }
    }
}

pub fn print_message(msg: &str) {
    let _guard = MSG_LOCK.lock();
    println!("{}", msg);
}

pub fn print_error(msg: &str) {
    let _guard = MSG_LOCK.lock();
    eprintln!("{}", msg);
}

/// Unrecoverable conditions hit on worker threads: report and give up.
pub fn fatal(msg: &str) -> ! {
    print_error(msg);
    std::process::exit(1);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_print_indented() {
        let mut out = Vec::new();
        print_indented(&mut out, "one\ntwo\nthree\n", 4).expect("write");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "one\n    two\n    three\n"
        );
    }

    #[test]
    fn test_print_indented_single_line() {
        let mut out = Vec::new();
        print_indented(&mut out, "only\n", 2).expect("write");
        assert_eq!(String::from_utf8(out).expect("utf8"), "only\n");
    }
}
