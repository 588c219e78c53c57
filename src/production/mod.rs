//! Compiled rules.
//!
//! A [`Production`] is the symbol-level form of a rule: conditions already
//! reordered for matching, actions with interned symbols. Rules arrive as a
//! [`ast::RuleDef`] (the parser's output) and are turned into productions by
//! [`compile::compile_rule`]; the chunker builds productions directly.

pub mod ast;
pub mod compile;
pub mod reorder;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::symbol::{Sym, SymbolTable};

/// Stable handle of an installed production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProdId(pub u32);

impl fmt::Display for ProdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Where a rule came from, which also decides its firing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ProductionKind {
    #[default]
    User,
    /// Fallback knowledge; fires after every other kind at the same level.
    Default,
    Chunk,
    Justification,
    /// Each match creates a new user rule instead of firing actions.
    Template,
}

impl ProductionKind {
    /// Lower ranks fire first within one elaboration.
    pub fn firing_rank(self) -> u8 {
        match self {
            ProductionKind::Default => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for ProductionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProductionKind::User => "user",
            ProductionKind::Default => "default",
            ProductionKind::Chunk => "chunk",
            ProductionKind::Justification => "justification",
            ProductionKind::Template => "template",
        };
        f.write_str(s)
    }
}

/// Relational operators usable in condition tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    SameType,
}

impl Relation {
    /// Does `value <rel> referent` hold?
    pub fn holds(self, symbols: &SymbolTable, value: Sym, referent: Sym) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Relation::NotEqual => value != referent,
            Relation::SameType => symbols.same_type(value, referent),
            Relation::Less => symbols.compare(value, referent) == Some(Less),
            Relation::LessOrEqual => matches!(symbols.compare(value, referent), Some(Less | Equal)),
            Relation::Greater => symbols.compare(value, referent) == Some(Greater),
            Relation::GreaterOrEqual => {
                matches!(symbols.compare(value, referent), Some(Greater | Equal))
            }
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Relation::NotEqual => "<>",
            Relation::Less => "<",
            Relation::LessOrEqual => "<=",
            Relation::Greater => ">",
            Relation::GreaterOrEqual => ">=",
            Relation::SameType => "<=>",
        }
    }
}

/// One field test. Symbols may be constants or variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Test {
    Equality(Sym),
    Relational(Relation, Sym),
    /// Value must be one of these constants.
    Disjunction(Vec<Sym>),
    Conjunction(Vec<Test>),
    /// The field must hold a goal identifier.
    Goal,
}

impl Test {
    /// Visit every symbol mentioned by the test.
    pub fn for_each_sym(&self, f: &mut impl FnMut(Sym)) {
        match self {
            Test::Equality(s) | Test::Relational(_, s) => f(*s),
            Test::Disjunction(v) => v.iter().copied().for_each(f),
            Test::Conjunction(ts) => ts.iter().for_each(|t| t.for_each_sym(f)),
            Test::Goal => {}
        }
    }

    /// The equality symbols in this test (one, or several inside a conjunction).
    pub fn equalities(&self) -> Vec<Sym> {
        match self {
            Test::Equality(s) => vec![*s],
            Test::Conjunction(ts) => ts.iter().flat_map(Test::equalities).collect(),
            _ => Vec::new(),
        }
    }

    /// Variables referenced by relational tests.
    pub fn relational_vars(&self, symbols: &SymbolTable) -> Vec<Sym> {
        match self {
            Test::Relational(_, s) if symbols.is_variable(*s) => vec![*s],
            Test::Conjunction(ts) => ts.iter().flat_map(|t| t.relational_vars(symbols)).collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_goal_test(&self) -> bool {
        match self {
            Test::Goal => true,
            Test::Conjunction(ts) => ts.iter().any(Test::has_goal_test),
            _ => false,
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, symbols: &SymbolTable) -> fmt::Result {
        match self {
            Test::Equality(s) => write!(f, "{}", symbols.display(*s)),
            Test::Relational(r, s) => write!(f, "{} {}", r.symbol(), symbols.display(*s)),
            Test::Disjunction(v) => {
                f.write_str("<< ")?;
                for s in v {
                    write!(f, "{} ", symbols.display(*s))?;
                }
                f.write_str(">>")
            }
            Test::Conjunction(ts) => {
                f.write_str("{ ")?;
                for t in ts {
                    t.write(f, symbols)?;
                    f.write_str(" ")?;
                }
                f.write_str("}")
            }
            Test::Goal => f.write_str("state"),
        }
    }
}

/// Tests on the three fields of one working-memory element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub id: Test,
    pub attr: Test,
    pub value: Test,
    /// Match acceptable-preference elements (`+`) instead of ordinary ones.
    pub acceptable: bool,
}

impl Triple {
    pub fn for_each_sym(&self, f: &mut impl FnMut(Sym)) {
        self.id.for_each_sym(f);
        self.attr.for_each_sym(f);
        self.value.for_each_sym(f);
    }

    pub fn equality_vars(&self, symbols: &SymbolTable) -> Vec<Sym> {
        [&self.id, &self.attr, &self.value]
            .into_iter()
            .flat_map(Test::equalities)
            .filter(|s| symbols.is_variable(*s))
            .collect()
    }

    pub fn relational_vars(&self, symbols: &SymbolTable) -> Vec<Sym> {
        [&self.id, &self.attr, &self.value]
            .into_iter()
            .flat_map(|t| t.relational_vars(symbols))
            .collect()
    }
}

/// A left-hand-side condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Positive(Triple),
    Negative(Triple),
    /// Conjunctive negation: satisfied when the inner conditions have no match.
    Ncc(Vec<Condition>),
}

impl Condition {
    pub fn for_each_sym(&self, f: &mut impl FnMut(Sym)) {
        match self {
            Condition::Positive(t) | Condition::Negative(t) => t.for_each_sym(f),
            Condition::Ncc(cs) => cs.iter().for_each(|c| c.for_each_sym(f)),
        }
    }

    /// All variables mentioned anywhere in the condition.
    pub fn variables(&self, symbols: &SymbolTable) -> BTreeSet<Sym> {
        let mut out = BTreeSet::new();
        self.for_each_sym(&mut |s| {
            if symbols.is_variable(s) {
                out.insert(s);
            }
        });
        out
    }
}

/// Preference kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PreferenceType {
    Acceptable,
    Require,
    Reject,
    Prohibit,
    Best,
    Worst,
    Better,
    Worse,
    UnaryIndifferent,
    BinaryIndifferent,
    NumericIndifferent,
}

impl PreferenceType {
    /// Binary preferences relate the value to a referent.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            PreferenceType::Better | PreferenceType::Worse | PreferenceType::BinaryIndifferent
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            PreferenceType::Acceptable => "+",
            PreferenceType::Require => "!",
            PreferenceType::Reject => "-",
            PreferenceType::Prohibit => "~",
            PreferenceType::Best => ">",
            PreferenceType::Worst => "<",
            PreferenceType::Better => ">",
            PreferenceType::Worse => "<",
            PreferenceType::UnaryIndifferent => "=",
            PreferenceType::BinaryIndifferent => "=",
            PreferenceType::NumericIndifferent => "=",
        }
    }
}

/// A right-hand-side value: a symbol (constant or variable) or a function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RhsValue {
    Sym(Sym),
    Call { function: String, args: Vec<RhsValue> },
}

impl RhsValue {
    pub fn for_each_sym(&self, f: &mut impl FnMut(Sym)) {
        match self {
            RhsValue::Sym(s) => f(*s),
            RhsValue::Call { args, .. } => args.iter().for_each(|a| a.for_each_sym(f)),
        }
    }
}

/// A right-hand-side action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Assert a preference `(id ^attr value <pref> [referent])`.
    Make {
        id: Sym,
        attr: RhsValue,
        value: RhsValue,
        preference: PreferenceType,
        referent: Option<RhsValue>,
    },
    /// Call a function for its side effect.
    Call { function: String, args: Vec<RhsValue> },
}

impl Action {
    pub fn for_each_sym(&self, f: &mut impl FnMut(Sym)) {
        match self {
            Action::Make {
                id,
                attr,
                value,
                referent,
                ..
            } => {
                f(*id);
                attr.for_each_sym(f);
                value.for_each_sym(f);
                if let Some(r) = referent {
                    r.for_each_sym(f);
                }
            }
            Action::Call { args, .. } => args.iter().for_each(|a| a.for_each_sym(f)),
        }
    }
}

/// A compiled rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Production {
    pub name: String,
    pub kind: ProductionKind,
    pub documentation: Option<String>,
    /// Conditions in match order.
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// Installation order; breaks firing ties.
    pub ordinal: u64,
    pub firing_count: u64,
}

impl Production {
    /// Every symbol the rule refers to.
    pub fn symbols(&self) -> BTreeSet<Sym> {
        let mut out = BTreeSet::new();
        for c in &self.conditions {
            c.for_each_sym(&mut |s| {
                out.insert(s);
            });
        }
        for a in &self.actions {
            a.for_each_sym(&mut |s| {
                out.insert(s);
            });
        }
        out
    }

    /// Render the rule in the conventional `sp {...}` notation.
    pub fn render(&self, symbols: &SymbolTable) -> String {
        struct View<'a>(&'a Production, &'a SymbolTable);
        impl fmt::Display for View<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let (p, symbols) = (self.0, self.1);
                writeln!(f, "sp {{{}", p.name)?;
                for c in &p.conditions {
                    write_condition(f, c, symbols, "   ")?;
                }
                writeln!(f, "-->")?;
                for a in &p.actions {
                    match a {
                        Action::Make {
                            id,
                            attr,
                            value,
                            preference,
                            referent,
                        } => {
                            write!(
                                f,
                                "   ({} ^{} {} {}",
                                symbols.display(*id),
                                render_rhs(attr, symbols),
                                render_rhs(value, symbols),
                                preference.symbol()
                            )?;
                            if let Some(r) = referent {
                                write!(f, " {}", render_rhs(r, symbols))?;
                            }
                            writeln!(f, ")")?;
                        }
                        Action::Call { function, args } => {
                            let call = RhsValue::Call {
                                function: function.clone(),
                                args: args.clone(),
                            };
                            writeln!(f, "   {}", render_rhs(&call, symbols))?;
                        }
                    }
                }
                write!(f, "}}")
            }
        }
        View(self, symbols).to_string()
    }
}

fn write_condition(
    f: &mut fmt::Formatter<'_>,
    c: &Condition,
    symbols: &SymbolTable,
    indent: &str,
) -> fmt::Result {
    let triple = |f: &mut fmt::Formatter<'_>, t: &Triple| -> fmt::Result {
        f.write_str("(")?;
        t.id.write(f, symbols)?;
        f.write_str(" ^")?;
        t.attr.write(f, symbols)?;
        f.write_str(" ")?;
        t.value.write(f, symbols)?;
        if t.acceptable {
            f.write_str(" +")?;
        }
        f.write_str(")")
    };
    match c {
        Condition::Positive(t) => {
            f.write_str(indent)?;
            triple(f, t)?;
            writeln!(f)
        }
        Condition::Negative(t) => {
            write!(f, "{indent}-")?;
            triple(f, t)?;
            writeln!(f)
        }
        Condition::Ncc(cs) => {
            writeln!(f, "{indent}-{{")?;
            let inner = format!("{indent}   ");
            for c in cs {
                write_condition(f, c, symbols, &inner)?;
            }
            writeln!(f, "{indent}}}")
        }
    }
}

fn render_rhs(v: &RhsValue, symbols: &SymbolTable) -> String {
    match v {
        RhsValue::Sym(s) => symbols.display(*s),
        RhsValue::Call { function, args } => {
            let args: Vec<String> = args.iter().map(|a| render_rhs(a, symbols)).collect();
            if args.is_empty() {
                format!("({function})")
            } else {
                format!("({function} {})", args.join(" "))
            }
        }
    }
}
