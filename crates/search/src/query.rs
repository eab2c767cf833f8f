/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! A greedy query parser with no operator precedence at all: every term
//! and operator is applied as it is read, left to right. This will offend
//! mathematicians, but should be relatively accessible to other humans.
//!
//! The language:
//!
//! ```text
//!   term      this term is required (implicit AND)
//!   + term    this term's results are added to the result set
//!   - term    this term's results are subtracted from the result set
//! ```
//!
//! Parentheses group operations; the all-caps words AND, OR and NOT can
//! be used in place of (nothing), `+` and `-`. The word ALL (or `*` on
//! its own) is the universal set. Dangling parentheses are closed at end
//! of input. Quotes are stripped.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    All,
    Keyword(String),
    And(Vec<Term>),
    Or(Vec<Term>),
    Sub(Vec<Term>),
}

/// What a term-magic hook did with a term: kept it as (possibly
/// rewritten) text for further hooks, or replaced it with a subtree,
/// which ends the chain.
pub enum Magic {
    Keep(String),
    Tree(Term),
}

pub type MagicFn<'x> = &'x dyn Fn(&str) -> Magic;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    And,
    Or,
    Sub,
}

struct Frame {
    op: Op,
    terms: Vec<Term>,
}

impl Frame {
    fn new(op: Op) -> Self {
        Frame {
            op,
            terms: Vec::new(),
        }
    }

    /// A single-term group collapses to the term itself.
    fn flatten(self) -> Term {
        if self.terms.len() == 1 {
            self.terms.into_iter().next().unwrap()
        } else {
            self.into_term()
        }
    }

    fn into_term(self) -> Term {
        match self.op {
            Op::And => Term::And(self.terms),
            Op::Or => Term::Or(self.terms),
            Op::Sub => Term::Sub(self.terms),
        }
    }
}

/// Replaces the accumulator's top-level operator unless it already
/// matches; the pending terms collapse into a single child.
fn convert(frame: Frame, op: Op) -> Frame {
    if frame.op == op {
        frame
    } else {
        Frame {
            op,
            terms: vec![frame.flatten()],
        }
    }
}

static QUOTES_AND_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["'\s]+"#).unwrap());

fn tokenize(text: &str) -> Vec<String> {
    let text = text
        .replace('(', " ( ")
        .replace(')', " ) ")
        .replace(" +", " + ")
        .replace("+ ", " + ")
        .replace(" -", " - ")
        .replace("- ", " - ");
    QUOTES_AND_SPACE
        .replace_all(text.trim(), " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Parses a query string into an operator tree, applying term magic
/// hooks. Each hook is tried when its trigger character appears in the
/// term; a hook returning a subtree ends the chain for that term.
pub fn parse(text: &str, magics: &[(char, MagicFn<'_>)]) -> Term {
    let mut stack = vec![Frame::new(Op::And)];
    let mut changed = false;

    for token in tokenize(text) {
        match token.as_str() {
            "(" => {
                changed = false;
                stack.push(Frame::new(Op::And));
            }
            ")" => {
                changed = false;
                if stack.len() > 1 {
                    changed = true;
                    let done = stack.pop().unwrap();
                    stack.last_mut().unwrap().terms.push(done.into_term());
                }
            }
            "*" | "ALL" => {
                stack.last_mut().unwrap().terms.push(Term::All);
                changed = false;
            }
            "AND" => {
                changed = true;
                let frame = stack.pop().unwrap();
                stack.push(convert(frame, Op::And));
            }
            "+" | "OR" => {
                changed = true;
                let frame = stack.pop().unwrap();
                stack.push(convert(frame, Op::Or));
            }
            "-" | "NOT" => {
                changed = true;
                let frame = stack.pop().unwrap();
                stack.push(convert(frame, Op::Sub));
            }
            _ => {
                // No operator between bare terms means AND: if the last
                // token was not an operator but the accumulator is not an
                // AND, convert it before appending.
                if !changed && stack.last().unwrap().op != Op::And {
                    let frame = stack.pop().unwrap();
                    stack.push(convert(frame, Op::And));
                }

                let mut term = token;
                let mut tree = None;
                for (trigger, magic) in magics {
                    if term.contains(*trigger) {
                        match magic(&term) {
                            Magic::Keep(rewritten) => term = rewritten,
                            Magic::Tree(subtree) => {
                                tree = Some(subtree);
                                break;
                            }
                        }
                    }
                }
                let frame = stack.last_mut().unwrap();
                match tree {
                    Some(Term::And(terms)) if terms.len() == 1 => {
                        frame.terms.extend(terms);
                    }
                    Some(Term::Or(terms)) if terms.len() == 1 => {
                        frame.terms.extend(terms);
                    }
                    Some(Term::Sub(terms)) if terms.len() == 1 => {
                        frame.terms.extend(terms);
                    }
                    Some(subtree) => frame.terms.push(subtree),
                    None => frame.terms.push(Term::Keyword(term.to_lowercase())),
                }
                changed = false;
            }
        }
    }

    // Close all dangling parens.
    while stack.len() > 1 {
        let done = stack.pop().unwrap();
        stack.last_mut().unwrap().terms.push(done.into_term());
    }
    stack.pop().unwrap().flatten()
}

/// Renders an operator tree as infix text; the testable inverse of
/// parsing.
pub fn explain(term: &Term) -> String {
    match term {
        Term::All => "ALL".to_string(),
        Term::Keyword(keyword) => keyword.clone(),
        Term::And(terms) => render(terms, " AND "),
        Term::Or(terms) => render(terms, " OR "),
        Term::Sub(terms) => render(terms, " NOT "),
    }
}

fn render(terms: &[Term], op: &str) -> String {
    let mut out = String::from("(");
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            out.push_str(op);
        }
        out.push_str(&explain(term));
    }
    out.push(')');
    out
}
