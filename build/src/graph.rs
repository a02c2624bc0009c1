//! The dependency graph. Nodes live in an arena owned by the graph and
//! edges refer to them by index, so the builder can freely share nodes
//! between parents while the per-node mutex lives alongside each slot.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::SystemTime;

use thiserror::Error;

use mk_parse::expand::{expand_recipe, expand_suffixes, Vars};
use mk_parse::rules::RuleSet;

use crate::disk::DiskInterface;

/// The maximum number of times a rule may be applied along a single
/// dependency chain. This is policy, not algorithm: it breaks
/// self-referential meta-rules that would otherwise recurse forever.
const MAX_RULE_CNT: usize = 1;

pub type NodeId = usize;

/// Current status of a node in the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Started,
    NoOp,
    Done,
    Failed,
}

/// An edge in the graph. `tail` is absent for rules without prerequisites.
#[derive(Debug)]
pub struct Edge {
    pub tail: Option<NodeId>,
    /// Index of the matched rule in the RuleSet.
    pub rule: usize,
    /// Stem matched for suffix meta-rule applications.
    pub stem: String,
    /// Submatches for regex meta-rule applications.
    pub matches: Vec<String>,
    /// This edge is going to be pruned.
    togo: bool,
}

/// The parts of a node that change during execution, guarded together.
#[derive(Debug)]
pub struct NodeState {
    pub status: Status,
    pub mtime: SystemTime,
    pub exists: bool,
    pub listeners: Vec<crossbeam::channel::Sender<Status>>,
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub prereqs: Vec<Edge>,
    pub state: Mutex<NodeState>,
    // Graph-construction bookkeeping; untouched once building starts.
    probable: bool,
    ready: bool,
    cycle: bool,
    vacuous: bool,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle in the graph detected at target {0}")]
    Cycle(String),
    #[error("ambiguous recipes for {target}\n{trace}")]
    Ambiguous { target: String, trace: String },
    #[error("cannot stat {name}: {source}")]
    Stat {
        name: String,
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
    root: NodeId,
}

/// Create a dependency graph for the given target.
pub fn build_graph(
    rules: &RuleSet,
    target: &str,
    disk: &dyn DiskInterface,
    rebuild_all: bool,
) -> Result<Graph, GraphError> {
    let mut graph = Graph {
        nodes: Vec::new(),
        index: HashMap::new(),
        root: 0,
    };

    // Track how many times each rule has been applied on the current chain.
    let mut rulecnt = vec![0usize; rules.rules.len()];
    graph.root = graph.apply_rules(rules, target, &mut rulecnt, disk, rebuild_all)?;
    graph.cycle_check(graph.root)?;
    graph.nodes[graph.root].probable = true;
    graph.vacuous(rules, graph.root);
    graph.ambiguous(rules, graph.root)?;

    Ok(graph)
}

impl Graph {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dump the graph in graphviz format.
    pub fn visualize(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "digraph mk {{")?;
        for node in &self.nodes {
            for edge in &node.prereqs {
                if let Some(tail) = edge.tail {
                    writeln!(w, "    \"{}\" -> \"{}\";", node.name, self.nodes[tail].name)?;
                }
            }
        }
        writeln!(w, "}}")
    }

    fn new_node(
        &mut self,
        name: &str,
        disk: &dyn DiskInterface,
        rebuild_all: bool,
    ) -> Result<NodeId, GraphError> {
        let stat = disk.stat(name).map_err(|source| GraphError::Stat {
            name: name.to_owned(),
            source,
        })?;
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_owned(),
            prereqs: Vec::new(),
            probable: stat.exists || rebuild_all,
            ready: false,
            cycle: false,
            vacuous: false,
            state: Mutex::new(NodeState {
                status: Status::Ready,
                mtime: stat.mtime,
                exists: stat.exists,
                listeners: Vec::new(),
            }),
        });
        self.index.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Recursively match the target against the rule set, constructing the
    /// full graph under it.
    fn apply_rules(
        &mut self,
        rules: &RuleSet,
        target: &str,
        rulecnt: &mut [usize],
        disk: &dyn DiskInterface,
        rebuild_all: bool,
    ) -> Result<NodeId, GraphError> {
        if let Some(&id) = self.index.get(target) {
            return Ok(id);
        }
        let u = self.new_node(target, disk, rebuild_all)?;

        // Concrete rules whose literal target set contains the name.
        if let Some(ks) = rules.target_rules.get(target) {
            for &k in ks {
                if rulecnt[k] >= MAX_RULE_CNT {
                    continue;
                }
                let rule = &rules.rules[k];
                if rule.is_meta {
                    continue;
                }
                // Skip rules that have no effect.
                if rule.recipe.is_empty() && rule.prereqs.is_empty() {
                    continue;
                }

                self.nodes[u].probable = true;
                rulecnt[k] += 1;
                if rule.prereqs.is_empty() {
                    self.nodes[u].prereqs.push(Edge {
                        tail: None,
                        rule: k,
                        stem: String::new(),
                        matches: Vec::new(),
                        togo: false,
                    });
                } else {
                    for i in 0..rule.prereqs.len() {
                        let prereq = rule.prereqs[i].clone();
                        let v = self.apply_rules(rules, &prereq, rulecnt, disk, rebuild_all)?;
                        self.nodes[u].prereqs.push(Edge {
                            tail: Some(v),
                            rule: k,
                            stem: String::new(),
                            matches: Vec::new(),
                            togo: false,
                        });
                    }
                }
                rulecnt[k] -= 1;
            }
        }

        // Applicable meta-rules.
        for k in 0..rules.rules.len() {
            if rulecnt[k] >= MAX_RULE_CNT {
                continue;
            }
            let rule = &rules.rules[k];
            if !rule.is_meta {
                continue;
            }
            if rule.recipe.is_empty() && rule.prereqs.is_empty() {
                continue;
            }

            for pattern in &rule.targets {
                let mat = match pattern.match_target(target) {
                    Some(mat) => mat,
                    None => continue,
                };

                let mut stem = String::new();
                let mut matches = Vec::new();
                let mut match_vars = Vars::new();
                if rule.attributes.regex {
                    matches = mat;
                    for (i, m) in matches.iter().enumerate() {
                        match_vars.insert(format!("stem{}", i), vec![m.clone()]);
                    }
                } else {
                    stem = mat.into_iter().nth(1).unwrap_or_default();
                }

                rulecnt[k] += 1;
                if rule.prereqs.is_empty() {
                    self.nodes[u].prereqs.push(Edge {
                        tail: None,
                        rule: k,
                        stem: stem.clone(),
                        matches: matches.clone(),
                        togo: false,
                    });
                } else {
                    for i in 0..rule.prereqs.len() {
                        let prereq = if rule.attributes.regex {
                            expand_recipe(&rule.prereqs[i], &match_vars, false)
                        } else {
                            expand_suffixes(&rule.prereqs[i], &stem)
                        };
                        let v = self.apply_rules(rules, &prereq, rulecnt, disk, rebuild_all)?;
                        self.nodes[u].prereqs.push(Edge {
                            tail: Some(v),
                            rule: k,
                            stem: stem.clone(),
                            matches: matches.clone(),
                            togo: false,
                        });
                    }
                }
                rulecnt[k] -= 1;
            }
        }

        Ok(u)
    }

    /// Depth-first cycle check: the flag colors the path from the root, set
    /// on descent and cleared on ascent.
    fn cycle_check(&mut self, id: NodeId) -> Result<(), GraphError> {
        if self.nodes[id].cycle && !self.nodes[id].prereqs.is_empty() {
            return Err(GraphError::Cycle(self.nodes[id].name.clone()));
        }
        self.nodes[id].cycle = true;
        for i in 0..self.nodes[id].prereqs.len() {
            if let Some(v) = self.nodes[id].prereqs[i].tail {
                self.cycle_check(v)?;
            }
        }
        self.nodes[id].cycle = false;
        Ok(())
    }

    /// Prune vacuous children: speculative meta-rule edges whose subtree
    /// never reaches a file or a concrete rule.
    fn vacuous(&mut self, rules: &RuleSet, id: NodeId) -> bool {
        let mut vac = !self.nodes[id].probable;
        if self.nodes[id].ready {
            return vac;
        }
        self.nodes[id].ready = true;

        for i in 0..self.nodes[id].prereqs.len() {
            let tail = self.nodes[id].prereqs[i].tail;
            let rule = self.nodes[id].prereqs[i].rule;
            let prune = match tail {
                Some(v) => self.vacuous(rules, v) && rules.rules[rule].is_meta,
                None => false,
            };
            if prune {
                self.nodes[id].prereqs[i].togo = true;
            } else {
                vac = false;
            }
        }

        // If a rule generated any surviving edge, keep all of its edges.
        let n = self.nodes[id].prereqs.len();
        for i in 0..n {
            if !self.nodes[id].prereqs[i].togo {
                let rule = self.nodes[id].prereqs[i].rule;
                for j in 0..n {
                    if self.nodes[id].prereqs[j].rule == rule {
                        self.nodes[id].prereqs[j].togo = false;
                    }
                }
            }
        }

        self.remove_togo(id);
        if vac {
            self.nodes[id].vacuous = true;
        }
        vac
    }

    /// Resolve or report ambiguous recipes.
    fn ambiguous(&mut self, rules: &RuleSet, id: NodeId) -> Result<(), GraphError> {
        let n = self.nodes[id].prereqs.len();
        let mut le: Option<usize> = None;
        let mut bad = false;
        let mut trace = String::new();

        for i in 0..n {
            if let Some(v) = self.nodes[id].prereqs[i].tail {
                self.ambiguous(rules, v)?;
            }
            let rule = self.nodes[id].prereqs[i].rule;
            if rules.rules[rule].recipe.is_empty() {
                continue;
            }
            let l = match le {
                None => {
                    le = Some(i);
                    continue;
                }
                Some(l) => l,
            };

            let l_rule = self.nodes[id].prereqs[l].rule;
            if !rules.rules[l_rule].equiv_recipe(&rules.rules[rule]) {
                // A concrete rule wins over a meta-rule.
                if rules.rules[l_rule].is_meta && !rules.rules[rule].is_meta {
                    self.nodes[id].prereqs[l].togo = true;
                    le = Some(i);
                    continue;
                } else if !rules.rules[l_rule].is_meta && rules.rules[rule].is_meta {
                    self.nodes[id].prereqs[i].togo = true;
                    continue;
                }

                if !bad {
                    bad = true;
                    self.trace(rules, id, l, &mut trace);
                }
                self.trace(rules, id, i, &mut trace);
            }
        }

        if bad {
            return Err(GraphError::Ambiguous {
                target: self.nodes[id].name.clone(),
                trace,
            });
        }
        self.remove_togo(id);
        Ok(())
    }

    /// Append one `<-(file:line)-` breadcrumb chain for an edge.
    fn trace(&self, rules: &RuleSet, id: NodeId, edge: usize, out: &mut String) {
        out.push_str(&format!("\t{}", self.nodes[id].name));
        let mut at = (id, edge);
        loop {
            let e = &self.nodes[at.0].prereqs[at.1];
            let rule = &rules.rules[e.rule];
            let prereqname = e.tail.map(|v| self.nodes[v].name.as_str()).unwrap_or("");
            out.push_str(&format!(" <-({}:{})- {}", rule.file, rule.line, prereqname));
            match e.tail {
                Some(v) => {
                    match self.nodes[v]
                        .prereqs
                        .iter()
                        .position(|f| !rules.rules[f.rule].recipe.is_empty())
                    {
                        Some(next) => at = (v, next),
                        None => break,
                    }
                }
                None => break,
            }
        }
        out.push('\n');
    }

    /// Remove edges marked as togo.
    fn remove_togo(&mut self, id: NodeId) {
        self.nodes[id].prereqs.retain(|e| !e.togo);
    }
}
