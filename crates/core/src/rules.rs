//! Rule application primitive.
//!
//! The driver only depends on [`RuleEngine`]: given a cell's neighborhood, decide its next state.
//! [`ConditionEngine`] is the shipped implementation. It compiles each rule's condition text once,
//! then evaluates rules in order; the first matching rule wins and a cell with no matching rule
//! keeps its current state.
//!
//! Condition grammar:
//!
//! ```text
//! condition := conj ("||" conj)*
//! conj      := atom ("&&" atom)*
//! atom      := "any-live-neighbor" | "no-live-neighbor" | "always"
//!            | "self" CMP N | "live" CMP N | "count(" S ")" CMP N
//! ```
//!
//! A live neighbor is any neighbor whose state is not 0.

use thiserror::Error;

use crate::grid::{Cell, Neighborhood};
use crate::model::Rule;

/// A rule set that cannot be compiled. Always a data integrity problem of the simulation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule {index}: malformed condition '{condition}': {reason}")]
    Malformed {
        index: usize,
        condition: String,
        reason: String,
    },

    #[error("rule {index}: {what} {state} is outside 0..{state_count}")]
    StateOutOfRange {
        index: usize,
        what: &'static str,
        state: u16,
        state_count: u16,
    },
}

/// Failure while computing one generation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("cell ({x}, {y}) produced state {state}, state count is {state_count}")]
    InvalidState {
        x: usize,
        y: usize,
        state: Cell,
        state_count: u16,
    },

    #[error("rule engine failure: {0}")]
    Engine(String),
}

/// Contract of the automaton library consumed by the driver.
pub trait RuleEngine: Send + Sync {
    fn next_state(&self, neighborhood: &Neighborhood) -> Result<Cell, StepError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn holds(self, lhs: usize, rhs: usize) -> bool {
        match self {
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Atom {
    Always,
    AnyLive,
    NoLive,
    SelfIs(Cmp, usize),
    Live(Cmp, usize),
    Count(Cell, Cmp, usize),
}

impl Atom {
    fn matches(&self, hood: &Neighborhood) -> bool {
        match *self {
            Atom::Always => true,
            Atom::AnyLive => hood.live() > 0,
            Atom::NoLive => hood.live() == 0,
            Atom::SelfIs(cmp, n) => cmp.holds(hood.center as usize, n),
            Atom::Live(cmp, n) => cmp.holds(hood.live(), n),
            Atom::Count(state, cmp, n) => cmp.holds(hood.count(state), n),
        }
    }
}

/// Disjunction of conjunctions.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Condition(Vec<Vec<Atom>>);

impl Condition {
    fn matches(&self, hood: &Neighborhood) -> bool {
        self.0
            .iter()
            .any(|conj| conj.iter().all(|atom| atom.matches(hood)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledRule {
    condition: Condition,
    target: Cell,
}

/// Rule engine over the condition grammar above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionEngine {
    rules: Vec<CompiledRule>,
}

impl ConditionEngine {
    pub fn compile(rules: &[Rule], state_count: u16) -> Result<Self, RuleError> {
        let compiled = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                if u16::from(rule.target_state) >= state_count {
                    return Err(RuleError::StateOutOfRange {
                        index,
                        what: "target state",
                        state: rule.target_state.into(),
                        state_count,
                    });
                }
                let condition = parse_condition(&rule.condition, state_count).map_err(
                    |reason| match reason {
                        ParseFailure::Syntax(reason) => RuleError::Malformed {
                            index,
                            condition: rule.condition.clone(),
                            reason,
                        },
                        ParseFailure::State(state) => RuleError::StateOutOfRange {
                            index,
                            what: "counted state",
                            state,
                            state_count,
                        },
                    },
                )?;
                Ok(CompiledRule {
                    condition,
                    target: rule.target_state,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules: compiled })
    }
}

impl RuleEngine for ConditionEngine {
    fn next_state(&self, neighborhood: &Neighborhood) -> Result<Cell, StepError> {
        Ok(self
            .rules
            .iter()
            .find(|rule| rule.condition.matches(neighborhood))
            .map(|rule| rule.target)
            .unwrap_or(neighborhood.center))
    }
}

enum ParseFailure {
    Syntax(String),
    State(u16),
}

fn syntax(msg: impl Into<String>) -> ParseFailure {
    ParseFailure::Syntax(msg.into())
}

fn parse_condition(text: &str, state_count: u16) -> Result<Condition, ParseFailure> {
    if text.trim().is_empty() {
        return Err(syntax("empty condition"));
    }
    text.split("||")
        .map(|conj| {
            conj.split("&&")
                .map(|atom| parse_atom(atom.trim(), state_count))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Condition)
}

fn parse_atom(atom: &str, state_count: u16) -> Result<Atom, ParseFailure> {
    match atom {
        "" => return Err(syntax("empty term")),
        "always" => return Ok(Atom::Always),
        "any-live-neighbor" => return Ok(Atom::AnyLive),
        "no-live-neighbor" => return Ok(Atom::NoLive),
        _ => {}
    }

    if let Some(rest) = atom.strip_prefix("count(") {
        let (state, tail) = rest
            .split_once(')')
            .ok_or_else(|| syntax("unterminated count("))?;
        let state: u16 = state
            .trim()
            .parse()
            .map_err(|_| syntax(format!("bad state '{}'", state.trim())))?;
        if state >= state_count || state > u16::from(Cell::MAX) {
            return Err(ParseFailure::State(state));
        }
        let (cmp, n) = parse_comparison(tail)?;
        return Ok(Atom::Count(state as Cell, cmp, n));
    }
    if let Some(rest) = atom.strip_prefix("self") {
        let (cmp, n) = parse_comparison(rest)?;
        return Ok(Atom::SelfIs(cmp, n));
    }
    if let Some(rest) = atom.strip_prefix("live") {
        let (cmp, n) = parse_comparison(rest)?;
        return Ok(Atom::Live(cmp, n));
    }

    Err(syntax(format!("unknown term '{atom}'")))
}

fn parse_comparison(text: &str) -> Result<(Cmp, usize), ParseFailure> {
    const OPS: [(&str, Cmp); 6] = [
        ("==", Cmp::Eq),
        ("!=", Cmp::Ne),
        ("<=", Cmp::Le),
        (">=", Cmp::Ge),
        ("<", Cmp::Lt),
        (">", Cmp::Gt),
    ];

    let text = text.trim();
    let (cmp, rest) = OPS
        .iter()
        .find_map(|(op, cmp)| text.strip_prefix(op).map(|rest| (*cmp, rest)))
        .ok_or_else(|| syntax(format!("expected comparison, found '{text}'")))?;
    let n = rest
        .trim()
        .parse()
        .map_err(|_| syntax(format!("expected number, found '{}'", rest.trim())))?;
    Ok((cmp, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hood(center: Cell, neighbors: [Cell; 8]) -> Neighborhood {
        Neighborhood { center, neighbors }
    }

    fn life() -> ConditionEngine {
        ConditionEngine::compile(
            &[
                Rule::new("self == 0 && live == 3", 1),
                Rule::new("self == 1 && live < 2 || self == 1 && live > 3", 0),
            ],
            2,
        )
        .unwrap()
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = ConditionEngine::compile(
            &[Rule::new("any-live-neighbor", 1), Rule::new("always", 0)],
            2,
        )
        .unwrap();

        assert_eq!(engine.next_state(&hood(0, [0, 0, 0, 0, 1, 0, 0, 0])).unwrap(), 1);
        assert_eq!(engine.next_state(&hood(1, [0; 8])).unwrap(), 0);
    }

    #[test]
    fn unmatched_cell_keeps_its_state() {
        let engine = life();
        assert_eq!(engine.next_state(&hood(1, [1, 1, 0, 0, 0, 0, 0, 0])).unwrap(), 1);
        assert_eq!(engine.next_state(&hood(0, [1, 1, 0, 0, 0, 0, 0, 0])).unwrap(), 0);
    }

    #[test]
    fn life_birth_and_death() {
        let engine = life();
        assert_eq!(engine.next_state(&hood(0, [1, 1, 1, 0, 0, 0, 0, 0])).unwrap(), 1);
        assert_eq!(engine.next_state(&hood(1, [1, 0, 0, 0, 0, 0, 0, 0])).unwrap(), 0);
        assert_eq!(engine.next_state(&hood(1, [1, 1, 1, 1, 0, 0, 0, 0])).unwrap(), 0);
    }

    #[test]
    fn count_atom_counts_one_state() {
        let engine =
            ConditionEngine::compile(&[Rule::new("count(2) >= 2 && no-live-neighbor", 2)], 3);
        // count(2) >= 2 implies live neighbors, so the conjunction never holds.
        let engine = engine.unwrap();
        assert_eq!(engine.next_state(&hood(0, [2, 2, 0, 0, 0, 0, 0, 0])).unwrap(), 0);

        let engine = ConditionEngine::compile(&[Rule::new("count(2) >= 2", 1)], 3).unwrap();
        assert_eq!(engine.next_state(&hood(0, [2, 2, 1, 0, 0, 0, 0, 0])).unwrap(), 1);
        assert_eq!(engine.next_state(&hood(0, [2, 1, 1, 0, 0, 0, 0, 0])).unwrap(), 0);
    }

    #[test]
    fn malformed_conditions_are_rejected() {
        for text in ["", "sometimes", "live ~ 3", "live == x", "count(1 == 2", "self ==", "always &&"] {
            let err = ConditionEngine::compile(&[Rule::new(text, 0)], 2).unwrap_err();
            assert!(matches!(err, RuleError::Malformed { index: 0, .. }), "{text}: {err:?}");
        }
    }

    #[test]
    fn out_of_range_states_are_rejected() {
        let err = ConditionEngine::compile(&[Rule::new("always", 0), Rule::new("always", 2)], 2)
            .unwrap_err();
        assert!(matches!(err, RuleError::StateOutOfRange { index: 1, state: 2, .. }));

        let err = ConditionEngine::compile(&[Rule::new("count(5) > 0", 1)], 2).unwrap_err();
        assert!(matches!(err, RuleError::StateOutOfRange { what: "counted state", .. }));
    }
}
