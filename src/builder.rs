//! Mutable DSL that produces a [`Rules`] tree.
//!
//! Scopes are kept in insertion-ordered maps so `build()` is deterministic.
//! `build()` runs a reduction pass: any sub-scope whose state equals the
//! enclosing default is dropped. `validate()` checks every named member
//! against a [`ClassIndex`] before the rules go live.

use std::fmt;

use fxhash::FxHashMap;
use indexmap::IndexMap;
use thiserror::Error;

use crate::finder::ClassIndex;
use crate::rules::{ClassScope, Decision, DenyAction, MethodScope, PackageScope, Rules};
use jclass::descriptors;

/// Which side of a call the denials of one class scope are enforced on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckKind {
    /// Rewrite call sites in caller classes (the default).
    Caller,
    /// Insert a check prologue into the target class itself.
    Target,
}

/// Raised by [`RulesBuilder::validate`] only; never at transform time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnknownMember {
    #[error("unknown class {0}")]
    Class(String),
    #[error("unknown member {class}.{member}")]
    Member { class: String, member: String },
}

#[derive(Clone, Debug, PartialEq)]
enum Rule {
    Allow,
    Deny(DenyAction),
}

impl Rule {
    fn decide(&self, kind: CheckKind) -> Decision {
        match (self, kind) {
            (Rule::Allow, _) => Decision::Allow,
            (Rule::Deny(action), CheckKind::Caller) => Decision::DenyCaller(action.clone()),
            (Rule::Deny(action), CheckKind::Target) => Decision::DenyTarget(action.clone()),
        }
    }
}

pub struct RulesBuilder {
    default: Rule,
    packages: IndexMap<String, PackageBuilder>,
}

pub struct PackageBuilder {
    default: Option<Rule>,
    classes: IndexMap<String, ClassBuilder>,
}

pub struct ClassBuilder {
    check_kind: CheckKind,
    methods_default: Option<Rule>,
    constructors_default: Option<Rule>,
    methods: IndexMap<String, MethodBuilder>,
}

pub struct MethodBuilder {
    default: Option<Rule>,
    variants: IndexMap<String, Rule>,
}

impl RulesBuilder {
    /// Start from an allow-everything default.
    pub fn allow_all() -> RulesBuilder {
        RulesBuilder { default: Rule::Allow, packages: IndexMap::new() }
    }

    /// Start from a deny-everything default with the standard action.
    pub fn deny_all() -> RulesBuilder {
        Self::deny_all_with(DenyAction::Standard)
    }

    pub fn deny_all_with(action: DenyAction) -> RulesBuilder {
        RulesBuilder { default: Rule::Deny(action), packages: IndexMap::new() }
    }

    /// Scope for one package; dotted and internal-form names are both
    /// accepted.
    pub fn for_package(&mut self, name: &str) -> &mut PackageBuilder {
        let key = name.replace('.', "/");
        self.packages.entry(key).or_insert_with(|| PackageBuilder {
            default: None,
            classes: IndexMap::new(),
        })
    }

    /// Verify that every class and member the rules name actually exists.
    pub fn validate(&self, index: &dyn ClassIndex) -> Result<(), UnknownMember> {
        for (pkg_name, pkg) in &self.packages {
            for (class_name, class) in &pkg.classes {
                let binary = format!("{pkg_name}/{class_name}");
                let Some(summary) = index.class_summary(binary.as_bytes()) else {
                    return Err(UnknownMember::Class(binary.replace('/', ".")));
                };
                for (method_name, method) in &class.methods {
                    let declared: Vec<_> = summary
                        .declared
                        .iter()
                        .filter(|m| m.name.as_slice() == method_name.as_bytes())
                        .collect();
                    if declared.is_empty() {
                        return Err(UnknownMember::Member {
                            class: binary.replace('/', "."),
                            member: method_name.clone(),
                        });
                    }
                    for params in method.variants.keys() {
                        let found = declared.iter().any(|m| {
                            descriptors::parameters_slice(&m.descriptor)
                                .map(|p| p == params.as_bytes())
                                .unwrap_or(false)
                        });
                        if !found {
                            return Err(UnknownMember::Member {
                                class: binary.replace('/', "."),
                                member: format!("{method_name}({params})"),
                            });
                        }
                    }
                }
                if class.constructors_default.is_some()
                    && !summary.declared.iter().any(|m| m.name.as_slice() == b"<init>")
                {
                    return Err(UnknownMember::Member {
                        class: binary.replace('/', "."),
                        member: "<init>".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Materialize the immutable tree, dropping every sub-scope whose
    /// decisions match the enclosing default (post-order, so children are
    /// reduced before their parents).
    pub fn build(self) -> Rules {
        let global = self.default.decide(CheckKind::Caller);
        let mut packages = FxHashMap::default();
        for (pkg_name, pkg) in self.packages {
            let pkg_default = pkg
                .default
                .map(|r| r.decide(CheckKind::Caller))
                .unwrap_or_else(|| global.clone());
            let mut classes = FxHashMap::default();
            for (class_name, class) in pkg.classes {
                let kind = class.check_kind;
                let methods_default = class
                    .methods_default
                    .map(|r| r.decide(kind))
                    .unwrap_or_else(|| pkg_default.clone());
                let constructors_default = class
                    .constructors_default
                    .map(|r| r.decide(kind))
                    .unwrap_or_else(|| pkg_default.clone());
                let mut methods = FxHashMap::default();
                for (method_name, method) in class.methods {
                    let enclosing = if method_name == "<init>" {
                        &constructors_default
                    } else {
                        &methods_default
                    };
                    let default = method
                        .default
                        .map(|r| r.decide(kind))
                        .unwrap_or_else(|| enclosing.clone());
                    let mut variants = FxHashMap::default();
                    for (params, rule) in method.variants {
                        let decision = rule.decide(kind);
                        if decision != default {
                            variants
                                .insert(params.into_bytes().into_boxed_slice(), decision);
                        }
                    }
                    if variants.is_empty() && default == *enclosing {
                        continue;
                    }
                    methods.insert(
                        method_name.into_bytes().into_boxed_slice(),
                        MethodScope { default, variants },
                    );
                }
                if methods.is_empty()
                    && methods_default == pkg_default
                    && constructors_default == pkg_default
                {
                    continue;
                }
                classes.insert(
                    class_name.into_bytes().into_boxed_slice(),
                    ClassScope { methods_default, constructors_default, methods },
                );
            }
            if classes.is_empty() && pkg_default == global {
                continue;
            }
            packages.insert(
                pkg_name.into_bytes().into_boxed_slice(),
                PackageScope { default: pkg_default, classes },
            );
        }
        let mut rules = Rules {
            default: global,
            packages,
            has_caller_checks: false,
            has_target_checks: false,
        };
        let (caller, target) = scan_checks(&rules);
        rules.has_caller_checks = caller;
        rules.has_target_checks = target;
        rules
    }
}

fn note(decision: &Decision, caller: &mut bool, target: &mut bool) {
    match decision {
        Decision::Allow => {}
        Decision::DenyCaller(_) => *caller = true,
        Decision::DenyTarget(_) => *target = true,
    }
}

fn scan_checks(rules: &Rules) -> (bool, bool) {
    let (mut caller, mut target) = (false, false);
    note(&rules.default, &mut caller, &mut target);
    for pkg in rules.packages.values() {
        note(&pkg.default, &mut caller, &mut target);
        for class in pkg.classes.values() {
            note(&class.methods_default, &mut caller, &mut target);
            note(&class.constructors_default, &mut caller, &mut target);
            for method in class.methods.values() {
                note(&method.default, &mut caller, &mut target);
                for variant in method.variants.values() {
                    note(variant, &mut caller, &mut target);
                }
            }
        }
    }
    (caller, target)
}

impl PackageBuilder {
    pub fn allow_all(&mut self) -> &mut Self {
        self.default = Some(Rule::Allow);
        self
    }

    pub fn deny_all(&mut self) -> &mut Self {
        self.deny_all_with(DenyAction::Standard)
    }

    pub fn deny_all_with(&mut self, action: DenyAction) -> &mut Self {
        self.default = Some(Rule::Deny(action));
        self
    }

    pub fn for_class(&mut self, name: &str) -> &mut ClassBuilder {
        self.classes.entry(name.to_owned()).or_insert_with(|| ClassBuilder {
            check_kind: CheckKind::Caller,
            methods_default: None,
            constructors_default: None,
            methods: IndexMap::new(),
        })
    }
}

impl ClassBuilder {
    pub fn caller_checked(&mut self) -> &mut Self {
        self.check_kind = CheckKind::Caller;
        self
    }

    pub fn target_checked(&mut self) -> &mut Self {
        self.check_kind = CheckKind::Target;
        self
    }

    pub fn allow_all(&mut self) -> &mut Self {
        self.methods_default = Some(Rule::Allow);
        self.constructors_default = Some(Rule::Allow);
        self
    }

    pub fn deny_all(&mut self) -> &mut Self {
        self.deny_all_with(DenyAction::Standard)
    }

    pub fn deny_all_with(&mut self, action: DenyAction) -> &mut Self {
        self.methods_default = Some(Rule::Deny(action.clone()));
        self.constructors_default = Some(Rule::Deny(action));
        self
    }

    pub fn allow_constructors(&mut self) -> &mut Self {
        self.constructors_default = Some(Rule::Allow);
        self
    }

    pub fn deny_constructors(&mut self) -> &mut Self {
        self.deny_constructors_with(DenyAction::Standard)
    }

    pub fn deny_constructors_with(&mut self, action: DenyAction) -> &mut Self {
        self.constructors_default = Some(Rule::Deny(action));
        self
    }

    pub fn allow_method(&mut self, name: &str) -> &mut Self {
        self.for_method(name).default = Some(Rule::Allow);
        self
    }

    pub fn deny_method(&mut self, name: &str) -> &mut Self {
        self.deny_method_with(name, DenyAction::Standard)
    }

    pub fn deny_method_with(&mut self, name: &str, action: DenyAction) -> &mut Self {
        self.for_method(name).default = Some(Rule::Deny(action));
        self
    }

    pub fn for_method(&mut self, name: &str) -> &mut MethodBuilder {
        self.methods.entry(name.to_owned()).or_insert_with(|| MethodBuilder {
            default: None,
            variants: IndexMap::new(),
        })
    }

    /// Variant scope for the constructors of this class.
    pub fn for_constructors(&mut self) -> &mut MethodBuilder {
        self.for_method("<init>")
    }
}

impl MethodBuilder {
    pub fn allow_all(&mut self) -> &mut Self {
        self.default = Some(Rule::Allow);
        self
    }

    pub fn deny_all(&mut self) -> &mut Self {
        self.deny_all_with(DenyAction::Standard)
    }

    pub fn deny_all_with(&mut self, action: DenyAction) -> &mut Self {
        self.default = Some(Rule::Deny(action));
        self
    }

    pub fn allow_variant(&mut self, params: &str) -> &mut Self {
        self.variants.insert(normalize_params(params), Rule::Allow);
        self
    }

    pub fn deny_variant(&mut self, params: &str) -> &mut Self {
        self.deny_variant_with(params, DenyAction::Standard)
    }

    pub fn deny_variant_with(&mut self, params: &str, action: DenyAction) -> &mut Self {
        self.variants.insert(normalize_params(params), Rule::Deny(action));
        self
    }
}

/// Variant keys are the bytes between the parens of a descriptor; the
/// parens themselves are optional in the DSL.
fn normalize_params(params: &str) -> String {
    params.trim_start_matches('(').trim_end_matches(')').to_owned()
}

/// Render a parameter slice as source-level type names: `int,
/// java.lang.String, long[]`.
fn variant_display(params: &[u8]) -> String {
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < params.len() {
        let mut dims = 0;
        while params.get(pos) == Some(&b'[') {
            dims += 1;
            pos += 1;
        }
        let base = match params.get(pos) {
            Some(b'B') => "byte".to_owned(),
            Some(b'C') => "char".to_owned(),
            Some(b'D') => "double".to_owned(),
            Some(b'F') => "float".to_owned(),
            Some(b'I') => "int".to_owned(),
            Some(b'J') => "long".to_owned(),
            Some(b'S') => "short".to_owned(),
            Some(b'Z') => "boolean".to_owned(),
            Some(b'L') => {
                let Some(end) = params[pos..].iter().position(|&b| b == b';') else {
                    break;
                };
                let name = &params[pos + 1..pos + end];
                pos += end;
                String::from_utf8_lossy(name).replace('/', ".")
            }
            _ => break,
        };
        pos += 1;
        names.push(format!("{base}{}", "[]".repeat(dims)));
    }
    names.join(", ")
}

fn rule_word(decision: &Decision) -> &'static str {
    if decision.is_allow() {
        "allow"
    } else {
        "deny"
    }
}

fn sorted<'m, V>(map: &'m FxHashMap<Box<[u8]>, V>) -> Vec<(&'m Box<[u8]>, &'m V)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

/// The DSL text form; siblings are sorted by name for stable output.
impl fmt::Display for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} all;", rule_word(&self.default))?;
        for (pkg_name, pkg) in sorted(&self.packages) {
            let dotted = String::from_utf8_lossy(pkg_name).replace('/', ".");
            writeln!(f, "for package {dotted} {{")?;
            writeln!(f, "    {} all;", rule_word(&pkg.default))?;
            for (class_name, class) in sorted(&pkg.classes) {
                writeln!(f, "    for class {} {{", String::from_utf8_lossy(class_name))?;
                writeln!(f, "        {} all;", rule_word(&class.methods_default))?;
                if class.constructors_default != class.methods_default {
                    writeln!(f, "        {} constructors;", rule_word(&class.constructors_default))?;
                }
                for (method_name, method) in sorted(&class.methods) {
                    writeln!(
                        f,
                        "        for method {} {{",
                        String::from_utf8_lossy(method_name)
                    )?;
                    writeln!(f, "            {} all;", rule_word(&method.default))?;
                    for (params, decision) in sorted(&method.variants) {
                        writeln!(
                            f,
                            "            {} variant ({});",
                            rule_word(decision),
                            variant_display(params)
                        )?;
                    }
                    writeln!(f, "        }}")?;
                }
                writeln!(f, "    }}")?;
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}
