//! Path-like selectors over a [`RecordStore`].
//!
//! Supported forms: `a/b`, `a//b`, `/root/a`, `//a`, `*`, `.`, `a/@attr`,
//! `a/text()`, and predicates such as `a[@code=2 or @code=3]`,
//! `transaction[transaction-type[@code=3]]`, `a[not(b)]`, `a[@x!='y' and c]`.

use std::collections::BTreeSet;

use crate::store::{NodeId, NodeKind, RecordStore};
use crate::ColabError;

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: String,
    anchored: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: StepTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq)]
enum StepTest {
    Element(Option<String>),
    Attribute(String),
    Text,
    Context,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Exists(Selector),
    Compare { selector: Selector, negated: bool, literal: Literal },
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(f64),
}

impl Literal {
    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Text(text) => value == text,
            Self::Number(number) => value
                .trim()
                .parse::<f64>()
                .is_ok_and(|parsed| (parsed - number).abs() < f64::EPSILON),
        }
    }
}

/// One item produced by a selector: a node, or the string value of an
/// attribute or text step.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Selected {
    Node(NodeId),
    Value(String),
}

impl Selected {
    #[must_use]
    pub fn string_value(&self, store: &RecordStore) -> String {
        match self {
            Self::Node(id) => store.string_value(*id),
            Self::Value(value) => value.clone(),
        }
    }
}

impl Selector {
    /// Parse a selector expression.
    ///
    /// # Errors
    /// Returns [`ColabError::Query`] describing the first syntax problem.
    pub fn parse(input: &str) -> Result<Self, ColabError> {
        let mut parser = Parser { input, chars: input.chars().collect(), pos: 0 };
        let selector = parser.selector()?;
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(selector)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against `context`. A leading `/` ignores the context and starts
    /// at the store root.
    #[must_use]
    pub fn select(&self, store: &RecordStore, context: NodeId) -> Vec<Selected> {
        let mut current = vec![context];
        for (position, step) in self.steps.iter().enumerate() {
            let at_document = position == 0 && self.anchored;
            match &step.test {
                StepTest::Attribute(name) => {
                    return scope(store, &current, step.axis)
                        .into_iter()
                        .filter_map(|id| store.node(id).attribute(name))
                        .map(|value| Selected::Value(value.to_string()))
                        .collect();
                }
                StepTest::Text => {
                    let mut values = Vec::new();
                    for id in &current {
                        let candidates = match step.axis {
                            Axis::Child => store.children(*id).to_vec(),
                            Axis::Descendant => store.descendants(*id),
                        };
                        for candidate in candidates {
                            if let NodeKind::Text(text) = store.kind(candidate) {
                                values.push(Selected::Value(text.clone()));
                            }
                        }
                    }
                    return values;
                }
                StepTest::Context => {
                    if step.axis == Axis::Descendant {
                        current = scope(store, &current, Axis::Descendant);
                    }
                }
                StepTest::Element(name) => {
                    let candidates = if at_document {
                        scope(store, &[store.root()], step.axis)
                    } else {
                        let mut seen = BTreeSet::new();
                        let mut out = Vec::new();
                        for id in &current {
                            let below = match step.axis {
                                Axis::Child => store.children(*id).to_vec(),
                                Axis::Descendant => store.descendants(*id),
                            };
                            for candidate in below {
                                if seen.insert(candidate) {
                                    out.push(candidate);
                                }
                            }
                        }
                        out
                    };
                    current = candidates
                        .into_iter()
                        .filter(|id| match store.kind(*id) {
                            NodeKind::Element { name: element, .. } => {
                                name.as_ref().map_or(true, |wanted| wanted == element)
                            }
                            _ => false,
                        })
                        .filter(|id| step.predicates.iter().all(|expr| expr.holds(store, *id)))
                        .collect();
                }
            }
        }
        current.into_iter().map(Selected::Node).collect()
    }

    #[must_use]
    pub fn matches(&self, store: &RecordStore, context: NodeId) -> bool {
        !self.select(store, context).is_empty()
    }

    /// String values of every selected item, in selection order.
    #[must_use]
    pub fn values(&self, store: &RecordStore, context: NodeId) -> Vec<String> {
        self.select(store, context).iter().map(|item| item.string_value(store)).collect()
    }
}

/// The nodes themselves, plus all their descendants on the descendant axis.
fn scope(store: &RecordStore, nodes: &[NodeId], axis: Axis) -> Vec<NodeId> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for id in nodes {
        let mut push = |candidate: NodeId| {
            if seen.insert(candidate) {
                out.push(candidate);
            }
        };
        push(*id);
        if axis == Axis::Descendant {
            for below in store.descendants(*id) {
                push(below);
            }
        }
    }
    out
}

impl Expr {
    fn holds(&self, store: &RecordStore, context: NodeId) -> bool {
        match self {
            Self::Or(terms) => terms.iter().any(|term| term.holds(store, context)),
            Self::And(terms) => terms.iter().all(|term| term.holds(store, context)),
            Self::Not(inner) => !inner.holds(store, context),
            Self::Exists(selector) => selector.matches(store, context),
            Self::Compare { selector, negated, literal } => selector
                .values(store, context)
                .iter()
                .any(|value| literal.matches(value) != *negated),
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':')
}

impl Parser<'_> {
    fn error(&self, message: &str) -> ColabError {
        ColabError::Query(format!("{message} at offset {} in `{}`", self.pos, self.input))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn rest_starts_with(&self, token: &str) -> bool {
        token.chars().enumerate().all(|(offset, ch)| self.chars.get(self.pos + offset) == Some(&ch))
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest_starts_with(token) {
            self.pos += token.chars().count();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let len = keyword.chars().count();
        let boundary = self.chars.get(self.pos + len).map_or(true, |ch| !is_name_char(*ch));
        if self.rest_starts_with(keyword) && boundary {
            self.pos += len;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), ColabError> {
        self.skip_ws();
        if self.peek() == Some(ch) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected `{ch}`")))
        }
    }

    fn name(&mut self) -> Result<String, ColabError> {
        let start = self.pos;
        if !self.peek().is_some_and(|ch| ch.is_alphabetic() || ch == '_') {
            return Err(self.error("expected a name"));
        }
        while self.peek().is_some_and(is_name_char) {
            self.pos += 1;
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn selector(&mut self) -> Result<Selector, ColabError> {
        self.skip_ws();
        let start = self.pos;
        let mut anchored = false;
        let mut axis = Axis::Child;
        if self.eat("//") {
            axis = Axis::Descendant;
        } else if self.eat("/") {
            anchored = true;
        }

        let mut steps = Vec::new();
        loop {
            let step = self.step(axis)?;
            let terminal = matches!(step.test, StepTest::Attribute(_) | StepTest::Text);
            steps.push(step);
            if self.rest_starts_with("/") && terminal {
                return Err(self.error("`@attribute` and `text()` must be the final step"));
            }
            if self.eat("//") {
                axis = Axis::Descendant;
            } else if self.eat("/") {
                axis = Axis::Child;
            } else {
                break;
            }
        }

        let source: String = self.chars[start..self.pos].iter().collect();
        Ok(Selector { source: source.trim().to_string(), anchored, steps })
    }

    fn step(&mut self, axis: Axis) -> Result<Step, ColabError> {
        let test = if self.eat("@") {
            StepTest::Attribute(self.name()?)
        } else if self.eat("text()") {
            StepTest::Text
        } else if self.eat(".") {
            StepTest::Context
        } else if self.eat("*") {
            StepTest::Element(None)
        } else {
            StepTest::Element(Some(self.name()?))
        };

        let mut predicates = Vec::new();
        while self.peek() == Some('[') {
            if !matches!(test, StepTest::Element(_)) {
                return Err(self.error("predicates are only allowed on element steps"));
            }
            self.pos += 1;
            predicates.push(self.or_expr()?);
            self.expect(']')?;
        }
        Ok(Step { axis, test, predicates })
    }

    fn or_expr(&mut self) -> Result<Expr, ColabError> {
        let mut terms = vec![self.and_expr()?];
        loop {
            self.skip_ws();
            if !self.eat_keyword("or") {
                break;
            }
            terms.push(self.and_expr()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::Or(terms) })
    }

    fn and_expr(&mut self) -> Result<Expr, ColabError> {
        let mut terms = vec![self.unary()?];
        loop {
            self.skip_ws();
            if !self.eat_keyword("and") {
                break;
            }
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::And(terms) })
    }

    fn unary(&mut self) -> Result<Expr, ColabError> {
        self.skip_ws();
        if self.rest_starts_with("not(") {
            self.pos += 3;
            self.expect('(')?;
            let inner = self.or_expr()?;
            self.expect(')')?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat("(") {
            let inner = self.or_expr()?;
            self.expect(')')?;
            return Ok(inner);
        }

        let selector = self.selector()?;
        self.skip_ws();
        let negated = if self.eat("!=") {
            true
        } else if self.eat("=") {
            false
        } else {
            return Ok(Expr::Exists(selector));
        };
        let literal = self.literal()?;
        Ok(Expr::Compare { selector, negated, literal })
    }

    fn literal(&mut self) -> Result<Literal, ColabError> {
        self.skip_ws();
        match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|ch| ch != quote) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("unterminated string literal"));
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Ok(Literal::Text(text))
            }
            Some(ch) if ch.is_ascii_digit() || ch == '-' || ch == '.' => {
                let start = self.pos;
                self.pos += 1;
                while self.peek().is_some_and(|ch| ch.is_ascii_digit() || ch == '.') {
                    self.pos += 1;
                }
                let raw: String = self.chars[start..self.pos].iter().collect();
                raw.parse::<f64>()
                    .map(Literal::Number)
                    .map_err(|_| self.error(&format!("invalid number `{raw}`")))
            }
            _ => Err(self.error("expected a quoted string or a number")),
        }
    }
}
