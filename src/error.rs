//! Rich diagnostic error types for the cognit kernel.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so callers know exactly what went wrong
//! and how to fix it. Impasses are not errors: they are ordinary decision
//! outcomes and never surface here.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the kernel.
///
/// Each variant wraps a subsystem-specific error, preserving the full
/// diagnostic chain (error codes, help text) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum KernelError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Wm(#[from] WmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rhs(#[from] RhsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience alias for functions returning kernel errors.
pub type KernelResult<T> = std::result::Result<T, KernelError>;

// ---------------------------------------------------------------------------
// Symbol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SymbolError {
    #[error("symbol {display} is not an identifier")]
    #[diagnostic(
        code(cognit::symbol::not_identifier),
        help("Only identifiers (letter + number, like S1) can head a working-memory element.")
    )]
    NotIdentifier { display: String },

    #[error("unknown symbol handle {handle}")]
    #[diagnostic(
        code(cognit::symbol::unknown),
        help(
            "The handle does not belong to this agent's symbol table, or it was \
             reclaimed by `initialize()`. Symbols are per-agent and must not be \
             shared between agents."
        )
    )]
    Unknown { handle: u32 },
}

// ---------------------------------------------------------------------------
// Compile errors (rule ingestion)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("rule \"{rule}\" has no positive conditions")]
    #[diagnostic(
        code(cognit::compile::no_positive),
        help("Every rule needs at least one positive condition to anchor its bindings.")
    )]
    NoPositiveConditions { rule: String },

    #[error("rule \"{rule}\": variable <{var}> in a negated condition is never bound")]
    #[diagnostic(
        code(cognit::compile::unbound_negation),
        help(
            "The identifier of a negated condition must be bound by a positive \
             condition. Add a positive condition that binds <{var}>."
        )
    )]
    UnboundNegationVariable { rule: String, var: String },

    #[error("rule \"{rule}\": relational test refers to unbound variable <{var}>")]
    #[diagnostic(
        code(cognit::compile::unbound_relational),
        help("Variables used on the right side of <, >, <> and friends must be bound elsewhere.")
    )]
    UnboundRelationalVariable { rule: String, var: String },

    #[error("rule \"{rule}\": condition on <{var}> is not connected to any state")]
    #[diagnostic(
        code(cognit::compile::unconnected),
        help(
            "Each condition's identifier must be reachable from a condition that \
             tests a state (`Cond::state`). Link <{var}> to a state through an \
             attribute chain."
        )
    )]
    Unconnected { rule: String, var: String },

    #[error("rule \"{rule}\": malformed test: {detail}")]
    #[diagnostic(
        code(cognit::compile::malformed_test),
        help("Disjunctions may only list constants, and state tests belong in the identifier field.")
    )]
    MalformedTest { rule: String, detail: String },

    #[error("rule \"{rule}\": invalid action: {detail}")]
    #[diagnostic(
        code(cognit::compile::invalid_action),
        help(
            "Action identifiers must be variables. Binary preferences \
             (better, worse, binary indifferent) need a referent."
        )
    )]
    InvalidAction { rule: String, detail: String },

    #[error("rule \"{rule}\" calls unknown function \"{function}\"")]
    #[diagnostic(
        code(cognit::compile::unknown_function),
        help("See `rhs::FUNCTIONS` for the built-in right-hand-side functions.")
    )]
    UnknownFunction { rule: String, function: String },

    #[error("a rule named \"{rule}\" already exists")]
    #[diagnostic(
        code(cognit::compile::duplicate_name),
        help("Learned rule names must be unique; excise the existing rule first.")
    )]
    DuplicateName { rule: String },

    #[error("no rule named \"{rule}\"")]
    #[diagnostic(
        code(cognit::compile::unknown_rule),
        help("List installed rules with `Agent::rule_names()`.")
    )]
    UnknownRule { rule: String },
}

// ---------------------------------------------------------------------------
// Working-memory / network invariant errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WmError {
    #[error("reference count underflow on {what} {key}")]
    #[diagnostic(
        code(cognit::wm::refcount),
        help(
            "A working-memory element, preference or instantiation was released \
             more often than it was acquired. The agent is no longer trustworthy; \
             initialize it or discard it."
        )
    )]
    RefCountUnderflow { what: &'static str, key: u64 },

    #[error("working-memory invariant violated: {detail}")]
    #[diagnostic(
        code(cognit::wm::invariant),
        help("This is a kernel bug. Capture the agent snapshot and file a report.")
    )]
    Invariant { detail: String },

    #[error("no working-memory element with timetag {timetag}")]
    #[diagnostic(
        code(cognit::wm::unknown_wme),
        help("The element was already removed or never existed.")
    )]
    UnknownWme { timetag: u64 },
}

// ---------------------------------------------------------------------------
// Right-hand-side function errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RhsError {
    #[error("{function}: expected {expected} argument(s), got {got}")]
    #[diagnostic(
        code(cognit::rhs::arity),
        help("Check the argument list of the function call in the rule's actions.")
    )]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("{function}: argument {value} is not a number")]
    #[diagnostic(
        code(cognit::rhs::not_number),
        help("Arithmetic functions only accept integer and float constants.")
    )]
    NotNumber { function: String, value: String },

    #[error("{function}: division by zero")]
    #[diagnostic(code(cognit::rhs::div_zero), help("Guard the rule with a `<> 0` test."))]
    DivideByZero { function: String },

    #[error("action identifier {value} is not an identifier")]
    #[diagnostic(
        code(cognit::rhs::not_identifier),
        help("The first field of a make action must evaluate to an identifier.")
    )]
    NotIdentifier { value: String },

    #[error("{function} returns no value but was used as one")]
    #[diagnostic(
        code(cognit::rhs::no_value),
        help("Functions such as halt, write and wait can only appear as standalone actions.")
    )]
    NoValue { function: String },

    #[error("unknown right-hand-side function \"{function}\"")]
    #[diagnostic(code(cognit::rhs::unknown), help("See `rhs::FUNCTIONS`."))]
    Unknown { function: String },

    #[error("numeric indifferent preference needs a numeric referent, got {value}")]
    #[diagnostic(
        code(cognit::rhs::numeric_referent),
        help("Write the preference as `= <number>`.")
    )]
    NumericReferent { value: String },
}

// ---------------------------------------------------------------------------
// Run-control errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error("agent state is corrupted: {detail}")]
    #[diagnostic(
        code(cognit::run::corrupted),
        help(
            "An internal invariant was violated and matching state can no longer \
             be trusted. Other agents are unaffected. Call `initialize()` or drop \
             this agent."
        )
    )]
    Corrupted { detail: String },

    #[error("agent is halted")]
    #[diagnostic(
        code(cognit::run::halted),
        help("A rule called (halt). Call `initialize()` before running again.")
    )]
    Halted,

    #[error("agent thread is gone")]
    #[diagnostic(
        code(cognit::run::disconnected),
        help("The background agent thread exited; its command queue is closed.")
    )]
    Disconnected,

    #[error("operation not allowed while a run is in progress")]
    #[diagnostic(
        code(cognit::run::busy),
        help("Save, load and initialize only between runs.")
    )]
    Busy,
}

// ---------------------------------------------------------------------------
// Persistence errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PersistError {
    #[error("snapshot encoding failed: {message}")]
    #[diagnostic(code(cognit::persist::encode), help("This is a kernel bug; please report it."))]
    Encode { message: String },

    #[error("snapshot decoding failed: {message}")]
    #[diagnostic(
        code(cognit::persist::decode),
        help(
            "The bytes are not a snapshot written by this kernel version. \
             Snapshots are not portable across versions."
        )
    )]
    Decode { message: String },

    #[error("snapshot store error: {message}")]
    #[diagnostic(
        code(cognit::persist::redb),
        help(
            "The embedded snapshot database reported an error. Check the file \
             path and permissions, or start with a fresh store."
        )
    )]
    Redb { message: String },

    #[error("no snapshot named \"{name}\"")]
    #[diagnostic(code(cognit::persist::not_found), help("List snapshots with `SnapshotStore::names()`."))]
    NotFound { name: String },

    #[error("I/O error: {source}")]
    #[diagnostic(code(cognit::persist::io), help("Check that the directory exists and is writable."))]
    Io {
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(cognit::config::parse),
        help("The file must be TOML matching `AgentConfig`; unknown keys are rejected.")
    )]
    Parse { message: String },

    #[error("cannot read configuration: {source}")]
    #[diagnostic(code(cognit::config::io), help("Check the configuration path."))]
    Io {
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_errors_convert_to_kernel_error() {
        let err: KernelError = CompileError::NoPositiveConditions {
            rule: "r".into(),
        }
        .into();
        assert!(matches!(err, KernelError::Compile(_)));

        let err: KernelError = RunError::Halted.into();
        assert!(matches!(err, KernelError::Run(RunError::Halted)));
    }

    #[test]
    fn diagnostic_codes_are_namespaced() {
        let err = CompileError::UnboundNegationVariable {
            rule: "r".into(),
            var: "x".into(),
        };
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("cognit::compile::unbound_negation"));
        assert!(err.to_string().contains("<x>"));
    }

    #[test]
    fn transparent_wrapping_keeps_message() {
        let inner = RhsError::DivideByZero {
            function: "/".into(),
        };
        let msg = inner.to_string();
        let outer: KernelError = inner.into();
        assert_eq!(outer.to_string(), msg);
    }
}
