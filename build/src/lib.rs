//! The parallel build scheduler. Each node builds on its own worker;
//! prerequisites are fanned out and joined through typed completion
//! channels, and per-node status transitions under the node's mutex keep
//! every recipe to at most one execution.

use std::collections::HashSet;
use std::time::SystemTime;

use crossbeam::channel;
use crossbeam::thread::Scope;

use mk_parse::rules::RuleSet;

pub mod console;
pub mod disk;
pub mod graph;
mod recipe;
mod slots;

use disk::DiskInterface;
use graph::{Graph, NodeId, Status};
use recipe::do_recipe;
pub use graph::{build_graph, GraphError};
pub use slots::SlotPool;

/// Process-wide build options and shared resources, threaded through the
/// scheduler instead of living in globals.
pub struct BuildContext {
    /// Rebuild everything regardless of timestamps (-a).
    pub rebuild_all: bool,
    /// Targets whose rebuild is forced (-r).
    pub rebuild_targets: HashSet<String>,
    /// Print recipes without executing them (-n).
    pub dry_run: bool,
    pub slots: SlotPool,
    pub disk: Box<dyn DiskInterface>,
}

impl BuildContext {
    pub fn new(max_jobs: usize) -> BuildContext {
        BuildContext {
            rebuild_all: false,
            rebuild_targets: HashSet::new(),
            dry_run: false,
            slots: SlotPool::new(max_jobs),
            disk: Box::new(disk::SystemDisk),
        }
    }
}

/// Build the graph's root, returning its final status.
pub fn build(g: &Graph, rules: &RuleSet, ctx: &BuildContext) -> Status {
    crossbeam::thread::scope(|scope| mk_node(g, rules, ctx, scope, g.root(), true))
        .expect("build worker panicked")
}

/// Build one node.
///
/// `required` asks for the node to be brought up to date; without it the
/// node is only built if its own prerequisites turn out to be newer.
fn mk_node<'env>(
    g: &'env Graph,
    rules: &'env RuleSet,
    ctx: &'env BuildContext,
    scope: &Scope<'env>,
    id: NodeId,
    required: bool,
) -> Status {
    let node = g.node(id);

    // Claim the node. Whoever moves it out of Ready/NoOp runs the build;
    // everyone else subscribes and receives the single result.
    {
        let mut st = node.state.lock().expect("node lock");
        match st.status {
            Status::Ready | Status::NoOp => st.status = Status::Started,
            other => return other,
        }
    }

    let final_status = build_node(g, rules, ctx, scope, id, required);

    let mut st = node.state.lock().expect("node lock");
    st.status = final_status;
    for listener in st.listeners.drain(..) {
        let _ = listener.send(final_status);
    }
    final_status
}

fn build_node<'env>(
    g: &'env Graph,
    rules: &'env RuleSet,
    ctx: &'env BuildContext,
    scope: &Scope<'env>,
    id: NodeId,
    required: bool,
) -> Status {
    let node = g.node(id);

    // No rule at all: the target must already exist.
    if node.prereqs.is_empty() {
        let exists = node.state.lock().expect("node lock").exists;
        if !exists {
            let wd = std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default();
            console::print_error(&format!(
                "mk: don't know how to make {} in {}",
                node.name, wd
            ));
            return Status::Failed;
        }
        return Status::NoOp;
    }

    // After ambiguity pruning at most one recipe-bearing rule survives;
    // dependency-only rules may contribute further edges.
    let e = node
        .prereqs
        .iter()
        .rev()
        .find(|edge| !rules.rules[edge.rule].recipe.is_empty())
        .unwrap_or(&node.prereqs[node.prereqs.len() - 1]);
    let rule = &rules.rules[e.rule];
    let prereq_ids: Vec<NodeId> = node.prereqs.iter().filter_map(|edge| edge.tail).collect();

    // First, a speculative pass: only prereqs that are clearly wanted are
    // required; the rest build only if out of date themselves.
    let exists = node.state.lock().expect("node lock").exists;
    let prereqs_required = required && (rule.attributes.is_virtual || !exists);
    let mut final_status = mk_node_prereqs(g, rules, ctx, scope, &prereq_ids, prereqs_required);

    // Staleness.
    let mut uptodate = true;
    if !rule.attributes.is_virtual {
        if let Err(err) = update_timestamp(g, id, ctx) {
            console::fatal(&format!("mk: cannot stat {}: {}", node.name, err));
        }
        let (t, exists) = {
            let st = node.state.lock().expect("node lock");
            (st.mtime, st.exists)
        };
        if !exists && required {
            uptodate = false;
        } else if exists || required {
            for &p in &prereq_ids {
                let ps = g.node(p).state.lock().expect("node lock");
                if ps.mtime >= t || ps.status == Status::Done {
                    uptodate = false;
                }
            }
        }
    } else {
        uptodate = false;
    }

    if ctx.rebuild_all || ctx.rebuild_targets.contains(&node.name) {
        uptodate = false;
    }

    // Another pass on the prereqs, since we know we need them now. Prereqs
    // finished by the first pass report their status instantly.
    if !uptodate {
        if mk_node_prereqs(g, rules, ctx, scope, &prereq_ids, true) == Status::Failed {
            final_status = Status::Failed;
        }
    }

    // Execute the recipe, unless a prereq failed.
    if !uptodate && final_status != Status::Failed && !rule.recipe.is_empty() {
        let mut ok = {
            let _slot = if rule.attributes.exclusive {
                ctx.slots.acquire_exclusive()
            } else {
                ctx.slots.acquire()
            };
            do_recipe(g, rules, ctx, id, e)
        };

        if !ok && rule.attributes.non_stop {
            console::print_error(&format!("mk: recipe for {} failed, carrying on", node.name));
            ok = true;
        }
        if !ok && rule.attributes.del_failed && !rule.attributes.is_virtual {
            if std::fs::remove_file(&node.name).is_ok() {
                console::print_error(&format!("mk: deleting {}", node.name));
            }
        }

        if let Err(err) = update_timestamp(g, id, ctx) {
            console::fatal(&format!("mk: cannot stat {}: {}", node.name, err));
        }
        if ok && rule.attributes.forced_timestamp {
            let mut st = node.state.lock().expect("node lock");
            st.mtime = SystemTime::now();
            st.exists = true;
        }

        if ok {
            Status::Done
        } else {
            Status::Failed
        }
    } else if final_status != Status::Failed {
        Status::NoOp
    } else {
        Status::Failed
    }
}

/// Build a node's prereqs, blocking until all of them have reported.
fn mk_node_prereqs<'env>(
    g: &'env Graph,
    rules: &'env RuleSet,
    ctx: &'env BuildContext,
    scope: &Scope<'env>,
    prereqs: &[NodeId],
    required: bool,
) -> Status {
    let (tx, rx) = channel::unbounded();
    let mut pending = 0usize;

    for &p in prereqs {
        let mut st = g.node(p).state.lock().expect("node lock");
        match st.status {
            Status::Ready | Status::NoOp => {
                scope.spawn(move |scope| {
                    mk_node(g, rules, ctx, scope, p, required);
                });
                st.listeners.push(tx.clone());
                pending += 1;
            }
            Status::Started => {
                st.listeners.push(tx.clone());
                pending += 1;
            }
            // Terminal nodes report their status right away.
            Status::Done | Status::Failed => {
                let _ = tx.send(st.status);
                pending += 1;
            }
        }
    }
    drop(tx);

    let mut status = Status::Done;
    for _ in 0..pending {
        match rx.recv() {
            Ok(Status::Failed) => status = Status::Failed,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    status
}

/// Refresh a node's modification time and existence from the disk.
fn update_timestamp(g: &Graph, id: NodeId, ctx: &BuildContext) -> std::io::Result<()> {
    let node = g.node(id);
    let stat = ctx.disk.stat(&node.name)?;
    let mut st = node.state.lock().expect("node lock");
    st.mtime = stat.mtime;
    st.exists = stat.exists;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use mk_parse::expand::Vars;
    use mk_parse::parser::parse;
    use mk_parse::rules::{Pattern, Rule};
    use std::fs;
    use std::path::Path;

    fn rules_with_root(input: &str, targets: &[&str]) -> RuleSet {
        let mut rs = parse(input, "mkfile", Path::new("mkfile"), Vars::new())
            .expect("valid parse");
        let mut root = Rule::default();
        root.targets = vec![Pattern::Literal(String::new())];
        root.attributes.is_virtual = true;
        root.prereqs = targets.iter().map(|t| t.to_string()).collect();
        rs.add(root);
        rs
    }

    fn run(dir: &Path, input: &str, targets: &[&str], ctx: &BuildContext) -> Status {
        let rs = rules_with_root(input, targets);
        let cwd = std::env::current_dir().expect("cwd");
        std::env::set_current_dir(dir).expect("chdir");
        let result = build_graph(&rs, "", ctx.disk.as_ref(), ctx.rebuild_all)
            .map(|g| build(&g, &rs, ctx));
        std::env::set_current_dir(cwd).expect("chdir back");
        result.expect("graph")
    }

    // Serialize tests that change the working directory.
    static CWD_LOCK: once_cell::sync::Lazy<std::sync::Mutex<()>> =
        once_cell::sync::Lazy::new(|| std::sync::Mutex::new(()));

    #[test]
    fn test_single_rule_builds_and_then_noops() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("in"), "payload\n").expect("write");
        // Equal mtimes count as stale, so keep the source strictly older
        // than the output even on coarse-grained filesystems.
        std::thread::sleep(std::time::Duration::from_millis(30));

        let input = "out: in\n\techo ran >> log && cp $prereq $target\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["out"], &ctx);
        assert_ne!(status, Status::Failed);
        assert_eq!(
            fs::read_to_string(dir.path().join("out")).expect("out"),
            "payload\n"
        );

        // A second run over an unchanged workspace does nothing.
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["out"], &ctx);
        assert_eq!(status, Status::NoOp);
        assert_eq!(
            fs::read_to_string(dir.path().join("log")).expect("log"),
            "ran\n"
        );
    }

    #[test]
    fn test_missing_source_fails() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        let input = "out: in\n\tcp $prereq $target\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["out"], &ctx);
        assert_eq!(status, Status::Failed);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_failed_recipe_propagates() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("src"), "x").expect("write");
        let input = "top: mid\n\ttouch $target\nmid: src\n\texit 1\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["top"], &ctx);
        assert_eq!(status, Status::Failed);
        // The dependent recipe never ran.
        assert!(!dir.path().join("top").exists());
    }

    #[test]
    fn test_nonstop_attribute_carries_on() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("src"), "x").expect("write");
        let input = "top: mid\n\ttouch $target\nmid:E: src\n\ttouch $target && exit 1\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["top"], &ctx);
        assert_ne!(status, Status::Failed);
        assert!(dir.path().join("top").exists());
    }

    #[test]
    fn test_del_failed_removes_target() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("src"), "x").expect("write");
        let input = "out:D: src\n\ttouch $target && exit 1\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["out"], &ctx);
        assert_eq!(status, Status::Failed);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_virtual_targets_always_run() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        let input = "all:V:\n\techo ran >> log\n";
        for _ in 0..2 {
            let ctx = BuildContext::new(2);
            let status = run(dir.path(), input, &["all"], &ctx);
            assert_ne!(status, Status::Failed);
        }
        assert_eq!(
            fs::read_to_string(dir.path().join("log")).expect("log"),
            "ran\nran\n"
        );
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("in"), "x").expect("write");
        let input = "out: in\n\tcp $prereq $target\n";
        let mut ctx = BuildContext::new(2);
        ctx.dry_run = true;
        let status = run(dir.path(), input, &["out"], &ctx);
        assert_ne!(status, Status::Failed);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_rebuild_all_forces_fresh_targets() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("in"), "x").expect("write");
        let input = "out: in\n\techo ran >> log && touch $target\n";

        let ctx = BuildContext::new(2);
        assert_ne!(run(dir.path(), input, &["out"], &ctx), Status::Failed);

        let mut ctx = BuildContext::new(2);
        ctx.rebuild_all = true;
        assert_ne!(run(dir.path(), input, &["out"], &ctx), Status::Failed);
        assert_eq!(
            fs::read_to_string(dir.path().join("log")).expect("log"),
            "ran\nran\n"
        );
    }

    #[test]
    fn test_parallel_fanout_with_exclusive() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        let input = "all:V: a b c d x\n\na:V:\n\ttouch a\nb:V:\n\ttouch b\nc:V:\n\ttouch c\nd:V:\n\ttouch d\n\nx:VX:\n\ttouch x\n";
        let ctx = BuildContext::new(4);
        let status = run(dir.path(), input, &["all"], &ctx);
        assert_ne!(status, Status::Failed);
        for name in &["a", "b", "c", "d", "x"] {
            assert!(dir.path().join(name).exists(), "missing {}", name);
        }
    }

    #[test]
    fn test_stem_and_prereq_variables() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("foo.c"), "x").expect("write");
        let input = "%.o: %.c\n\techo stem=$stem prereq=$prereq > $target\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["foo.o"], &ctx);
        assert_ne!(status, Status::Failed);
        assert_eq!(
            fs::read_to_string(dir.path().join("foo.o")).expect("foo.o"),
            "stem=foo prereq=foo.c\n"
        );
    }

    #[test]
    fn test_regex_stems_exposed_to_recipe() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        let input = "(.+)\\.([ab]):RV:\n\techo $stem0 $stem1 $stem2 > out.txt\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["x.a"], &ctx);
        assert_ne!(status, Status::Failed);
        assert_eq!(
            fs::read_to_string(dir.path().join("out.txt")).expect("out.txt"),
            "x.a x a\n"
        );
    }

    #[test]
    fn test_interpreter_attribute() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        // Use sh -e as a stand-in interpreter selected via S.
        let input = "out:VSsh -e:\n\techo custom > out.txt\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["out"], &ctx);
        assert_ne!(status, Status::Failed);
        assert_eq!(
            fs::read_to_string(dir.path().join("out.txt")).expect("out.txt"),
            "custom\n"
        );
    }

    #[test]
    fn test_forced_timestamp_marks_fresh() {
        let _lock = CWD_LOCK.lock().expect("cwd lock");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("foo.c"), "x").expect("write");
        // The recipe does not create foo.o; N pretends it did.
        let input = "%.o:N: %.c\n\techo pretend\n";
        let ctx = BuildContext::new(2);
        let status = run(dir.path(), input, &["foo.o"], &ctx);
        assert_ne!(status, Status::Failed);
        assert!(!dir.path().join("foo.o").exists());
    }
}
