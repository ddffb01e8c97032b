//! Policy transformer: validates and rewrites script source before
//! execution.
//!
//! All rules are enforced on the parsed syntax tree (never on raw text), so
//! a script that runs correctly cannot probe for unguarded escape hatches:
//!
//! - `require` targets must be string literals; wrapped and library names
//!   are rehomed under the private sandbox prefix, denied names fail here,
//!   before any execution.
//! - Indexing straight into a `require(...)` result is rejected: a denied
//!   module must not be exfiltrable through a member of an allowed one.
//! - Dotted `X.init(self, ...)` superclass calls are rejected; the
//!   transformer injects the resolved `X.super_init(self)` form itself at
//!   the start of every `init` method body.
//! - Constructors must use method syntax: `function Class.init(...)`
//!   declarations are rejected, since only colon-form bodies receive the
//!   injected super call.
//!
//! Decisions are made on the AST; the rewrites are applied to the source as
//! byte-range splices derived from token positions, and the result is what
//! the execution engine compiles.

use full_moon::ast::{Call, Expression, FunctionArgs, FunctionCall, FunctionDeclaration, Index, Prefix, Suffix, VarExpression};
use full_moon::tokenizer::{TokenReference, TokenType};
use full_moon::visitors::Visitor;

use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::registry::CapabilityRegistry;

/// Validate `source` against the policy rules and return the rewritten
/// source ready for compilation.
pub fn transform(source: &str, registry: &CapabilityRegistry) -> SandboxResult<String> {
    let ast = full_moon::parse(source).map_err(|errors| SandboxError::Parse {
        reason: errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    })?;

    let mut pass = PolicyPass {
        source,
        registry,
        edits: Vec::new(),
        violation: None,
    };
    pass.visit_ast(&ast);

    if let Some(violation) = pass.violation {
        return Err(violation);
    }
    Ok(apply_edits(source, pass.edits))
}

struct Edit {
    start: usize,
    end: usize,
    replacement: String,
}

struct PolicyPass<'a> {
    source: &'a str,
    registry: &'a CapabilityRegistry,
    edits: Vec<Edit>,
    violation: Option<SandboxError>,
}

impl PolicyPass<'_> {
    fn record_violation(&mut self, line: usize, reason: String) {
        if self.violation.is_none() {
            self.violation = Some(SandboxError::PolicyViolation { line, reason });
        }
    }

    fn deny(&mut self, err: SandboxError) {
        if self.violation.is_none() {
            self.violation = Some(err);
        }
    }

    /// Shared check for `require` calls and by-name super calls over a
    /// prefix-expression (statement calls and value-position calls have the
    /// same prefix/suffix shape).
    fn check_call_chain(&mut self, prefix: &Prefix, suffixes: Vec<&Suffix>) {
        if let Some((name_tok, args, call_idx)) = require_call(prefix, &suffixes) {
            self.check_require(name_tok, args, &suffixes, call_idx);
        }
        self.check_by_name_super(&suffixes);
    }

    fn check_require(
        &mut self,
        require_tok: &TokenReference,
        args: &FunctionArgs,
        suffixes: &[&Suffix],
        call_idx: usize,
    ) {
        let line = require_tok.token().start_position().line();

        // Anything after the call itself pulls a member straight out of the
        // module expression.
        if suffixes.len() > call_idx + 1 {
            self.record_violation(
                line,
                "indexing into a require(...) result is not allowed; bind the module first"
                    .to_string(),
            );
            return;
        }

        let Some(name_tok) = literal_string_arg(args) else {
            self.record_violation(line, "require target must be a string literal".to_string());
            return;
        };
        let Some(module) = string_literal_text(name_tok) else {
            self.record_violation(line, "require target must be a string literal".to_string());
            return;
        };

        // Relative library imports are resolved (and checked) by the
        // importer once the importing module's name is known.
        if module.starts_with('.') {
            return;
        }

        match self.registry.require_allowed(&module) {
            Err(err) => self.deny(err),
            Ok(_) => {
                if let Some(rehomed) = self.registry.rehome(&module) {
                    self.edits.push(Edit {
                        start: name_tok.token().start_position().bytes(),
                        end: name_tok.token().end_position().bytes(),
                        replacement: format!("\"{rehomed}\""),
                    });
                }
            }
        }
    }

    fn check_by_name_super(&mut self, suffixes: &[&Suffix]) {
        for window in suffixes.windows(2) {
            let [first, second] = window else { continue };
            let Suffix::Index(Index::Dot { name, .. }) = first else {
                continue;
            };
            if token_text(name) != "init" {
                continue;
            }
            if matches!(second, Suffix::Call(Call::AnonymousCall(_))) {
                self.record_violation(
                    name.token().start_position().line(),
                    "calling a superclass constructor by class name is not allowed".to_string(),
                );
            }
        }
    }
}

impl Visitor for PolicyPass<'_> {
    fn visit_function_call(&mut self, call: &FunctionCall) {
        let suffixes: Vec<&Suffix> = call.suffixes().collect();
        self.check_call_chain(call.prefix(), suffixes);
    }

    fn visit_var_expression(&mut self, var: &VarExpression) {
        let suffixes: Vec<&Suffix> = var.suffixes().collect();
        self.check_call_chain(var.prefix(), suffixes);
    }

    fn visit_function_declaration(&mut self, decl: &FunctionDeclaration) {
        let names: Vec<&TokenReference> = decl.name().names().iter().collect();
        let Some(method) = decl.name().method_name() else {
            // `function Class.init(...)` never receives the injected super
            // call, so the base-init chain could not complete at runtime.
            if names.len() > 1 {
                if let Some(last) = names.last() {
                    if token_text(last) == "init" {
                        self.record_violation(
                            last.token().start_position().line(),
                            "init must be declared with method syntax (Class:init)".to_string(),
                        );
                    }
                }
            }
            return;
        };
        if token_text(method) != "init" {
            return;
        }

        // Class prefix as written: every dotted name before the colon.
        let (Some(first), Some(last)) = (names.first(), names.last()) else {
            return;
        };
        let class_start = first.token().start_position().bytes();
        let class_end = last.token().end_position().bytes();
        let class_text = &self.source[class_start..class_end];

        // Insert the resolved super call right after the parameter list.
        let (_, close_paren) = decl.body().parameters_parentheses().tokens();
        let insert_at = close_paren.token().end_position().bytes();
        self.edits.push(Edit {
            start: insert_at,
            end: insert_at,
            replacement: format!(" {class_text}.super_init(self);"),
        });
    }
}

/// Apply edits back-to-front so earlier byte offsets stay valid.
fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    let mut out = source.to_string();
    edits.sort_by_key(|e| std::cmp::Reverse(e.start));
    for edit in edits {
        out.replace_range(edit.start..edit.end, &edit.replacement);
    }
    out
}

/// If the chain is a call of the bare name `require`, return the name
/// token, the call arguments, and the index of the call suffix.
fn require_call<'a>(
    prefix: &'a Prefix,
    suffixes: &[&'a Suffix],
) -> Option<(&'a TokenReference, &'a FunctionArgs, usize)> {
    let Prefix::Name(name) = prefix else {
        return None;
    };
    if token_text(name) != "require" {
        return None;
    }
    match suffixes.first() {
        Some(Suffix::Call(Call::AnonymousCall(args))) => Some((name, args, 0)),
        _ => None,
    }
}

/// The single string-literal argument of a call, if that is what it is.
fn literal_string_arg(args: &FunctionArgs) -> Option<&TokenReference> {
    match args {
        FunctionArgs::String(tok) => Some(tok),
        FunctionArgs::Parentheses { arguments, .. } => {
            if arguments.len() != 1 {
                return None;
            }
            match arguments.iter().next() {
                Some(Expression::String(tok)) => Some(tok),
                _ => None,
            }
        }
        _ => None,
    }
}

fn string_literal_text(tok: &TokenReference) -> Option<String> {
    match tok.token().token_type() {
        TokenType::StringLiteral { literal, .. } => Some(literal.to_string()),
        _ => None,
    }
}

fn token_text(tok: &TokenReference) -> String {
    tok.token().to_string()
}
