//! The mk command line driver: flag parsing, environment capture, and the
//! parse → graph → build pipeline.

use std::collections::HashSet;
use std::io::{BufRead, Write};

use anyhow::Context;
use structopt::StructOpt;

use mk_build::graph::Status;
use mk_build::{build, build_graph, BuildContext};
use mk_parse::parser::parse;
use mk_parse::rules::{Pattern, Rule, RuleSet};
use mk_parse::Vars;

#[derive(Debug, StructOpt)]
#[structopt(name = "mk", about = "maintain (make) related files")]
pub struct Config {
    /// use the given file as the mkfile
    #[structopt(short = "f", name = "PATH", default_value = "mkfile")]
    pub mkfile: String,

    /// print commands without actually executing them
    #[structopt(short = "n")]
    pub dry_run: bool,

    /// force building of just the named targets
    #[structopt(short = "r")]
    pub shallow_rebuild: bool,

    /// force building of the named targets and all their prerequisites
    #[structopt(short = "a")]
    pub rebuild_all: bool,

    /// maximum number of recipes to execute in parallel
    #[structopt(short = "p", name = "N", default_value = "8")]
    pub max_jobs: usize,

    /// show the recipes that would run and prompt before executing them
    #[structopt(short = "i")]
    pub interactive: bool,

    /// don't print recipes before executing them
    #[structopt(short = "q")]
    pub quiet: bool,

    /// targets to bring up to date
    pub targets: Vec<String>,
}

/// Run a build. The returned value is the process exit code: 0 on success,
/// 1 on a parse error, a graph error, or any failed recipe.
pub fn run(config: Config) -> anyhow::Result<i32> {
    if std::env::var_os("MK_METRICS").is_some() {
        mk_metrics::enable();
    }

    let input = std::fs::read_to_string(&config.mkfile)
        .with_context(|| format!("no mkfile found at {}", config.mkfile))?;
    let abspath = std::fs::canonicalize(&config.mkfile)
        .context("unable to find mkfile's absolute path")?;

    // Every environment variable comes in as a single-element value list.
    let mut env = Vars::new();
    for (key, value) in std::env::vars() {
        env.insert(key, vec![value]);
    }

    let mut rules = {
        mk_metrics::scoped_metric!("parse");
        match parse(&input, &config.mkfile, &abspath, env) {
            Ok(rules) => rules,
            Err(err) => {
                eprintln!("mk: {}", err);
                return Ok(1);
            }
        }
    };

    if config.quiet {
        for rule in &mut rules.rules {
            rule.attributes.quiet = true;
        }
    }

    // Build the first non-meta rule's targets when none are given.
    let mut targets = config.targets.clone();
    if targets.is_empty() {
        targets = default_targets(&rules);
    }
    if targets.is_empty() {
        println!("mk: nothing to mk");
        return Ok(0);
    }

    let mut ctx = BuildContext::new(config.max_jobs);
    ctx.rebuild_all = config.rebuild_all;
    ctx.dry_run = config.dry_run;
    if config.shallow_rebuild {
        ctx.rebuild_targets = targets.iter().cloned().collect::<HashSet<_>>();
    }

    // A synthetic virtual rule depending on every requested target; the
    // graph is rooted at its empty name.
    let mut root = Rule::default();
    root.targets = vec![Pattern::Literal(String::new())];
    root.attributes.is_virtual = true;
    root.prereqs = targets;
    rules.add(root);

    if config.interactive {
        let graph = match build_graph(&rules, "", ctx.disk.as_ref(), ctx.rebuild_all) {
            Ok(graph) => graph,
            Err(err) => {
                eprintln!("mk: {}", err);
                return Ok(1);
            }
        };
        let mut dry = BuildContext::new(config.max_jobs);
        dry.rebuild_all = ctx.rebuild_all;
        dry.rebuild_targets = ctx.rebuild_targets.clone();
        dry.dry_run = true;
        build(&graph, &rules, &dry);

        print!("Proceed? ");
        let _ = std::io::stdout().flush();
        if !confirm(std::io::stdin().lock()) {
            return Ok(0);
        }
    }

    let graph = {
        mk_metrics::scoped_metric!("graph");
        match build_graph(&rules, "", ctx.disk.as_ref(), ctx.rebuild_all) {
            Ok(graph) => graph,
            Err(err) => {
                eprintln!("mk: {}", err);
                return Ok(1);
            }
        }
    };

    let status = {
        mk_metrics::scoped_metric!("build");
        build(&graph, &rules, &ctx)
    };

    if mk_metrics::is_enabled() {
        mk_metrics::dump();
    }

    Ok(if status == Status::Failed { 1 } else { 0 })
}

/// The targets of the first non-meta rule in the mkfile.
fn default_targets(rules: &RuleSet) -> Vec<String> {
    for rule in &rules.rules {
        if rule.is_meta {
            continue;
        }
        let names: Vec<String> = rule
            .targets
            .iter()
            .filter_map(|t| match t {
                Pattern::Literal(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            return names;
        }
    }
    Vec::new()
}

/// Read the interactive-mode answer: leading whitespace is skipped, 'y'
/// proceeds, anything else (including EOF) aborts.
pub fn confirm<R: BufRead>(mut input: R) -> bool {
    let mut line = String::new();
    loop {
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => return false,
            Ok(_) => match line.chars().find(|c| !c.is_whitespace()) {
                None => continue,
                Some('y') => return true,
                Some(_) => return false,
            },
        }
    }
}
