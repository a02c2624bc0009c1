//! Recipe execution: bind the per-rule variables, expand the recipe body,
//! and feed it to the configured interpreter on standard input.

use mk_parse::expand::{expand_recipe, Vars};
use mk_parse::rules::RuleSet;
use mk_subprocess::subprocess;

use crate::console;
use crate::graph::{Edge, Graph, NodeId};
use crate::BuildContext;

/// Run the recipe for a node. Returns true on success; a dry run only
/// prints and always succeeds.
pub fn do_recipe(g: &Graph, rules: &RuleSet, ctx: &BuildContext, id: NodeId, e: &Edge) -> bool {
    let node = g.node(id);
    let rule = &rules.rules[e.rule];

    let mut vars = Vars::new();
    vars.insert("target".to_owned(), vec![node.name.clone()]);
    if rule.is_meta {
        if rule.attributes.regex {
            for (i, m) in e.matches.iter().enumerate() {
                vars.insert(format!("stem{}", i), vec![m.clone()]);
            }
        } else {
            vars.insert("stem".to_owned(), vec![e.stem.clone()]);
        }
    }

    // TODO: bind alltarget and newprereq as well.

    // Only the prereqs hanging off the chosen rule belong to $prereq.
    let prereqs: Vec<String> = node
        .prereqs
        .iter()
        .filter(|f| f.rule == e.rule)
        .filter_map(|f| f.tail)
        .map(|v| g.node(v).name.clone())
        .collect();
    vars.insert("prereq".to_owned(), prereqs);

    let input = expand_recipe(&rule.recipe, &vars, false);

    let (sh, args): (&str, &[String]) = if rule.shell.is_empty() {
        ("sh", &[])
    } else {
        (&rule.shell[0], &rule.shell[1..])
    };

    console::print_recipe(&node.name, &input, rule.attributes.quiet);

    if ctx.dry_run {
        return true;
    }

    match subprocess(sh, args, &input, false) {
        Ok((_, success)) => success,
        // The interpreter could not be launched at all.
        Err(err) => console::fatal(&format!("mk: {}", err)),
    }
}
