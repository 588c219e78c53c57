//! Parsed rule form accepted by [`crate::agent::Agent::add_rule`].
//!
//! This is what a rule parser hands to the kernel. Terms are plain strings and
//! numbers, so rule sets can be stored as JSON. A small builder API keeps
//! hand-written rules readable:
//!
//! ```
//! use cognit_kernel::production::ast::{Cond, RuleDef};
//!
//! let rule = RuleDef::new("init*foo")
//!     .when(Cond::state("<s>", "superstate", "nil"))
//!     .then_make("<s>", "foo", "bar");
//! assert_eq!(rule.conditions.len(), 1);
//! ```

use serde::{Deserialize, Serialize};

use super::{PreferenceType, ProductionKind, Relation};

/// An atomic term. `"<x>"` is a variable; digits parse as numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Term {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Term {
    /// The variable name if this is `<name>`.
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Term::Text(s) if s.len() > 2 && s.starts_with('<') && s.ends_with('>') => {
                Some(&s[1..s.len() - 1])
            }
            _ => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.as_variable().is_some()
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        if let Ok(i) = s.parse::<i64>() {
            Term::Int(i)
        } else if s.contains('.') && s.parse::<f64>().is_ok() {
            s.parse::<f64>().map(Term::Float).unwrap_or_else(|_| Term::Text(s.to_string()))
        } else {
            Term::Text(s.to_string())
        }
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::from(s.as_str())
    }
}

impl From<i64> for Term {
    fn from(i: i64) -> Self {
        Term::Int(i)
    }
}

impl From<f64> for Term {
    fn from(x: f64) -> Self {
        Term::Float(x)
    }
}

/// A field test before interning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestDef {
    Eq(Term),
    Rel(Relation, Term),
    /// One of several constants: `<< a b c >>`.
    OneOf(Vec<Term>),
    All(Vec<TestDef>),
    /// The field holds a state (goal) identifier.
    State,
}

impl TestDef {
    pub fn rel(relation: Relation, term: impl Into<Term>) -> Self {
        TestDef::Rel(relation, term.into())
    }

    pub fn not_eq(term: impl Into<Term>) -> Self {
        Self::rel(Relation::NotEqual, term)
    }

    pub fn less(term: impl Into<Term>) -> Self {
        Self::rel(Relation::Less, term)
    }

    pub fn greater(term: impl Into<Term>) -> Self {
        Self::rel(Relation::Greater, term)
    }

    pub fn one_of<T: Into<Term>>(terms: impl IntoIterator<Item = T>) -> Self {
        TestDef::OneOf(terms.into_iter().map(Into::into).collect())
    }

    /// Conjoin with another test.
    pub fn and(self, other: impl Into<TestDef>) -> Self {
        match self {
            TestDef::All(mut ts) => {
                ts.push(other.into());
                TestDef::All(ts)
            }
            t => TestDef::All(vec![t, other.into()]),
        }
    }
}

impl From<&str> for TestDef {
    fn from(s: &str) -> Self {
        TestDef::Eq(Term::from(s))
    }
}

impl From<i64> for TestDef {
    fn from(i: i64) -> Self {
        TestDef::Eq(Term::Int(i))
    }
}

impl From<f64> for TestDef {
    fn from(x: f64) -> Self {
        TestDef::Eq(Term::Float(x))
    }
}

impl From<Term> for TestDef {
    fn from(t: Term) -> Self {
        TestDef::Eq(t)
    }
}

/// One `(id ^attr value)` pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleDef {
    pub id: TestDef,
    pub attr: TestDef,
    pub value: TestDef,
    #[serde(default)]
    pub acceptable: bool,
}

/// A condition before interning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CondDef {
    Positive(TripleDef),
    Negative(TripleDef),
    Ncc(Vec<CondDef>),
}

/// Condition builders.
pub struct Cond;

impl Cond {
    /// `(id ^attr value)`.
    pub fn new(
        id: impl Into<TestDef>,
        attr: impl Into<TestDef>,
        value: impl Into<TestDef>,
    ) -> CondDef {
        CondDef::Positive(TripleDef {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            acceptable: false,
        })
    }

    /// `(state id ^attr value)`: the identifier must be a state.
    pub fn state(
        id: impl Into<TestDef>,
        attr: impl Into<TestDef>,
        value: impl Into<TestDef>,
    ) -> CondDef {
        CondDef::Positive(TripleDef {
            id: TestDef::State.and(id),
            attr: attr.into(),
            value: value.into(),
            acceptable: false,
        })
    }

    /// `(id ^attr value +)`: matches acceptable-preference elements.
    pub fn acceptable(
        id: impl Into<TestDef>,
        attr: impl Into<TestDef>,
        value: impl Into<TestDef>,
    ) -> CondDef {
        CondDef::Positive(TripleDef {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            acceptable: true,
        })
    }

    /// `-(id ^attr value)`.
    pub fn not(
        id: impl Into<TestDef>,
        attr: impl Into<TestDef>,
        value: impl Into<TestDef>,
    ) -> CondDef {
        CondDef::Negative(TripleDef {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            acceptable: false,
        })
    }

    /// `-{ ... }`.
    pub fn none_of(conds: Vec<CondDef>) -> CondDef {
        CondDef::Ncc(conds)
    }
}

/// A right-hand-side value before interning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RhsDef {
    Term(Term),
    Call { function: String, args: Vec<RhsDef> },
}

impl RhsDef {
    pub fn call(function: &str, args: Vec<RhsDef>) -> Self {
        RhsDef::Call {
            function: function.to_string(),
            args,
        }
    }
}

impl From<&str> for RhsDef {
    fn from(s: &str) -> Self {
        RhsDef::Term(Term::from(s))
    }
}

impl From<i64> for RhsDef {
    fn from(i: i64) -> Self {
        RhsDef::Term(Term::Int(i))
    }
}

impl From<f64> for RhsDef {
    fn from(x: f64) -> Self {
        RhsDef::Term(Term::Float(x))
    }
}

impl From<Term> for RhsDef {
    fn from(t: Term) -> Self {
        RhsDef::Term(t)
    }
}

/// An action before interning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionDef {
    Make {
        id: Term,
        attr: RhsDef,
        value: RhsDef,
        preference: PreferenceType,
        #[serde(default)]
        referent: Option<RhsDef>,
    },
    Call { function: String, args: Vec<RhsDef> },
}

/// A whole rule as produced by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub name: String,
    #[serde(default)]
    pub kind: ProductionKind,
    #[serde(default)]
    pub documentation: Option<String>,
    pub conditions: Vec<CondDef>,
    pub actions: Vec<ActionDef>,
}

impl RuleDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProductionKind::User,
            documentation: None,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: ProductionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_documentation(mut self, doc: impl Into<String>) -> Self {
        self.documentation = Some(doc.into());
        self
    }

    pub fn when(mut self, cond: CondDef) -> Self {
        self.conditions.push(cond);
        self
    }

    /// `(id ^attr value)` with an acceptable preference.
    pub fn then_make(
        self,
        id: impl Into<Term>,
        attr: impl Into<RhsDef>,
        value: impl Into<RhsDef>,
    ) -> Self {
        self.then_prefer(id, attr, value, PreferenceType::Acceptable)
    }

    /// `(id ^attr value <pref>)` for unary preferences.
    pub fn then_prefer(
        mut self,
        id: impl Into<Term>,
        attr: impl Into<RhsDef>,
        value: impl Into<RhsDef>,
        preference: PreferenceType,
    ) -> Self {
        self.actions.push(ActionDef::Make {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            preference,
            referent: None,
        });
        self
    }

    /// `(id ^attr value <pref> referent)` for binary and numeric preferences.
    pub fn then_compare(
        mut self,
        id: impl Into<Term>,
        attr: impl Into<RhsDef>,
        value: impl Into<RhsDef>,
        preference: PreferenceType,
        referent: impl Into<RhsDef>,
    ) -> Self {
        self.actions.push(ActionDef::Make {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            preference,
            referent: Some(referent.into()),
        });
        self
    }

    /// A standalone function call such as `(halt)`.
    pub fn then_call(mut self, function: &str, args: Vec<RhsDef>) -> Self {
        self.actions.push(ActionDef::Call {
            function: function.to_string(),
            args,
        });
        self
    }
}
