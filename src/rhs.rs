//! Built-in right-hand-side functions.
//!
//! Functions receive already-evaluated argument symbols and return a symbol
//! (or nothing, for side-effect functions). Side effects that concern the
//! run loop, such as `halt`, are reported as [`Effect`]s and acted on by the
//! caller after the action list completes.

use crate::error::RhsError;
use crate::symbol::{Sym, SymbolTable, SymbolValue};

/// Every function name the compiler accepts.
pub const FUNCTIONS: &[&str] = &[
    "+",
    "-",
    "*",
    "/",
    "div",
    "mod",
    "abs",
    "concat",
    "make-constant-symbol",
    "int",
    "float",
    "halt",
    "interrupt",
    "wait",
    "write",
    "crlf",
];

pub fn is_known(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

/// Run-loop side effect requested by a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Halt,
    Interrupt,
    Wait,
    Write(String),
}

/// State a function call may touch.
pub(crate) struct RhsContext<'a> {
    pub symbols: &'a mut SymbolTable,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(x) => x,
        }
    }

    fn intern(self, symbols: &mut SymbolTable) -> Sym {
        match self {
            Num::Int(i) => symbols.int(i),
            Num::Float(x) => symbols.float(x),
        }
    }
}

fn num(function: &str, sym: Sym, symbols: &SymbolTable) -> Result<Num, RhsError> {
    match symbols.get(sym) {
        Some(SymbolValue::Int(i)) => Ok(Num::Int(*i)),
        Some(SymbolValue::Float(x)) => Ok(Num::Float(*x)),
        _ => Err(RhsError::NotNumber {
            function: function.to_string(),
            value: symbols.display(sym),
        }),
    }
}

fn arity(function: &str, expected: &str, got: usize) -> RhsError {
    RhsError::Arity {
        function: function.to_string(),
        expected: expected.to_string(),
        got,
    }
}

fn combine(a: Num, b: Num, int_op: fn(i64, i64) -> Option<i64>, float_op: fn(f64, f64) -> f64) -> Num {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => match int_op(x, y) {
            Some(v) => Num::Int(v),
            None => Num::Float(float_op(x as f64, y as f64)),
        },
        _ => Num::Float(float_op(a.as_f64(), b.as_f64())),
    }
}

fn is_zero(n: Num) -> bool {
    match n {
        Num::Int(i) => i == 0,
        Num::Float(x) => x == 0.0,
    }
}

fn text(args: &[Sym], symbols: &SymbolTable) -> String {
    args.iter().map(|a| symbols.display(*a)).collect()
}

/// Call `function` with evaluated arguments.
pub(crate) fn call(function: &str, args: &[Sym], ctx: &mut RhsContext<'_>) -> Result<Option<Sym>, RhsError> {
    let symbols = &mut *ctx.symbols;
    let nums = |symbols: &SymbolTable| -> Result<Vec<Num>, RhsError> {
        args.iter().map(|a| num(function, *a, symbols)).collect()
    };
    let value = match function {
        "+" => {
            let sum = nums(symbols)?
                .into_iter()
                .fold(Num::Int(0), |acc, n| combine(acc, n, i64::checked_add, |a, b| a + b));
            sum.intern(symbols)
        }
        "*" => {
            let product = nums(symbols)?
                .into_iter()
                .fold(Num::Int(1), |acc, n| combine(acc, n, i64::checked_mul, |a, b| a * b));
            product.intern(symbols)
        }
        "-" => {
            let ns = nums(symbols)?;
            let Some((first, rest)) = ns.split_first() else {
                return Err(arity(function, "at least 1", 0));
            };
            let result = if rest.is_empty() {
                combine(Num::Int(0), *first, i64::checked_sub, |a, b| a - b)
            } else {
                rest.iter()
                    .fold(*first, |acc, n| combine(acc, *n, i64::checked_sub, |a, b| a - b))
            };
            result.intern(symbols)
        }
        "/" => {
            let ns = nums(symbols)?;
            let Some((first, rest)) = ns.split_first() else {
                return Err(arity(function, "at least 1", 0));
            };
            let (mut acc, divisors) = if rest.is_empty() {
                (1.0, std::slice::from_ref(first))
            } else {
                (first.as_f64(), rest)
            };
            for d in divisors {
                if is_zero(*d) {
                    return Err(RhsError::DivideByZero {
                        function: function.to_string(),
                    });
                }
                acc /= d.as_f64();
            }
            symbols.float(acc)
        }
        "div" | "mod" => {
            let [a, b] = args else {
                return Err(arity(function, "2", args.len()));
            };
            let (Num::Int(x), Num::Int(y)) = (num(function, *a, symbols)?, num(function, *b, symbols)?)
            else {
                return Err(RhsError::NotNumber {
                    function: function.to_string(),
                    value: format!("{} {}", symbols.display(*a), symbols.display(*b)),
                });
            };
            if y == 0 {
                return Err(RhsError::DivideByZero {
                    function: function.to_string(),
                });
            }
            let v = if function == "div" {
                x.wrapping_div(y)
            } else {
                x.rem_euclid(y)
            };
            symbols.int(v)
        }
        "abs" => {
            let [a] = args else {
                return Err(arity(function, "1", args.len()));
            };
            match num(function, *a, symbols)? {
                Num::Int(i) => symbols.int(i.wrapping_abs()),
                Num::Float(x) => symbols.float(x.abs()),
            }
        }
        "int" | "float" => {
            let [a] = args else {
                return Err(arity(function, "1", args.len()));
            };
            let n = match symbols.get(*a) {
                Some(SymbolValue::Int(i)) => Num::Int(*i),
                Some(SymbolValue::Float(x)) => Num::Float(*x),
                Some(SymbolValue::Str(s)) => match (s.parse::<i64>(), s.parse::<f64>()) {
                    (Ok(i), _) => Num::Int(i),
                    (_, Ok(x)) => Num::Float(x),
                    _ => {
                        return Err(RhsError::NotNumber {
                            function: function.to_string(),
                            value: s.clone(),
                        });
                    }
                },
                _ => {
                    return Err(RhsError::NotNumber {
                        function: function.to_string(),
                        value: symbols.display(*a),
                    });
                }
            };
            if function == "int" {
                match n {
                    Num::Int(i) => symbols.int(i),
                    Num::Float(x) => symbols.int(x.trunc() as i64),
                }
            } else {
                symbols.float(n.as_f64())
            }
        }
        "concat" => {
            let s = text(args, symbols);
            symbols.string(&s)
        }
        "make-constant-symbol" => {
            let prefix = if args.is_empty() {
                "constant".to_string()
            } else {
                text(args, symbols)
            };
            let mut n = 1u64;
            let name = loop {
                let candidate = format!("{prefix}{n}");
                if symbols.find_string(&candidate).is_none() {
                    break candidate;
                }
                n += 1;
            };
            symbols.string(&name)
        }
        "crlf" => symbols.string("\n"),
        "write" => {
            let s = text(args, symbols);
            ctx.effects.push(Effect::Write(s));
            return Ok(None);
        }
        "halt" => {
            ctx.effects.push(Effect::Halt);
            return Ok(None);
        }
        "interrupt" => {
            ctx.effects.push(Effect::Interrupt);
            return Ok(None);
        }
        "wait" => {
            ctx.effects.push(Effect::Wait);
            return Ok(None);
        }
        _ => {
            return Err(RhsError::Unknown {
                function: function.to_string(),
            });
        }
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(symbols: &mut SymbolTable, f: &str, args: &[Sym]) -> Result<Option<Sym>, RhsError> {
        let mut ctx = RhsContext {
            symbols,
            effects: Vec::new(),
        };
        call(f, args, &mut ctx)
    }

    #[test]
    fn arithmetic_promotes_ints_to_floats() {
        let mut s = SymbolTable::new();
        let (two, three) = (s.int(2), s.int(3));
        let half = s.float(0.5);
        let r = eval(&mut s, "+", &[two, three]).unwrap().unwrap();
        assert_eq!(s.value(r).unwrap(), &SymbolValue::Int(5));
        let r = eval(&mut s, "*", &[two, half]).unwrap().unwrap();
        assert_eq!(s.value(r).unwrap(), &SymbolValue::Float(1.0));
        let r = eval(&mut s, "-", &[three]).unwrap().unwrap();
        assert_eq!(s.value(r).unwrap(), &SymbolValue::Int(-3));
        let r = eval(&mut s, "/", &[three, two]).unwrap().unwrap();
        assert_eq!(s.value(r).unwrap(), &SymbolValue::Float(1.5));
    }

    #[test]
    fn integer_division_and_errors() {
        let mut s = SymbolTable::new();
        let (seven, two, zero) = (s.int(7), s.int(2), s.int(0));
        let r = eval(&mut s, "div", &[seven, two]).unwrap().unwrap();
        assert_eq!(s.value(r).unwrap(), &SymbolValue::Int(3));
        let r = eval(&mut s, "mod", &[seven, two]).unwrap().unwrap();
        assert_eq!(s.value(r).unwrap(), &SymbolValue::Int(1));
        assert!(matches!(
            eval(&mut s, "div", &[seven, zero]),
            Err(RhsError::DivideByZero { .. })
        ));
        let word = s.string("seven");
        assert!(matches!(
            eval(&mut s, "+", &[word]),
            Err(RhsError::NotNumber { .. })
        ));
        assert!(matches!(eval(&mut s, "abs", &[]), Err(RhsError::Arity { .. })));
    }

    #[test]
    fn symbol_functions() {
        let mut s = SymbolTable::new();
        let (a, one) = (s.string("block"), s.int(1));
        let r = eval(&mut s, "concat", &[a, one]).unwrap().unwrap();
        assert_eq!(s.display(r), "block1");
        let r = eval(&mut s, "make-constant-symbol", &[a]).unwrap().unwrap();
        assert_eq!(s.display(r), "block2", "block1 already exists");
        let text = s.string("42");
        let r = eval(&mut s, "int", &[text]).unwrap().unwrap();
        assert_eq!(s.value(r).unwrap(), &SymbolValue::Int(42));
    }

    #[test]
    fn side_effects_are_collected() {
        let mut s = SymbolTable::new();
        let hi = s.string("hi");
        let mut ctx = RhsContext {
            symbols: &mut s,
            effects: Vec::new(),
        };
        assert_eq!(call("write", &[hi], &mut ctx).unwrap(), None);
        assert_eq!(call("halt", &[], &mut ctx).unwrap(), None);
        assert_eq!(ctx.effects, vec![Effect::Write("hi".into()), Effect::Halt]);
        assert!(is_known("make-constant-symbol"));
        assert!(!is_known("launch"));
    }
}
