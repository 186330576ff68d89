//! The immutable rule tree.
//!
//! Built once by [`crate::builder::RulesBuilder`], then shared read-only
//! across every classfile transformation. Lookup descends package → class →
//! method → descriptor variant; a missing level inherits the enclosing
//! default.

use fxhash::FxHashMap;

use jclass::descriptors;
use jclass::member::MemberRef;

/// Binary name of the root object type; its members stay callable even
/// under a deny-all rule set.
pub const OBJECT_CLASS: &[u8] = b"java/lang/Object";

/// The public and protected members the root object type declares. Only
/// these are blanket-allowed; any other `(name, descriptor)` attributed to
/// `java/lang/Object` goes through normal lookup.
pub fn object_declares(name: &[u8], descriptor: &[u8]) -> bool {
    matches!(
        (name, descriptor),
        (b"<init>", b"()V")
            | (b"getClass", b"()Ljava/lang/Class;")
            | (b"hashCode", b"()I")
            | (b"equals", b"(Ljava/lang/Object;)Z")
            | (b"clone", b"()Ljava/lang/Object;")
            | (b"toString", b"()Ljava/lang/String;")
            | (b"notify", b"()V")
            | (b"notifyAll", b"()V")
            | (b"wait", b"()V")
            | (b"wait", b"(J)V")
            | (b"wait", b"(JI)V")
            | (b"finalize", b"()V")
    )
}

/// A constant a denied call site can be made to return.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Null,
}

/// A static method named by rules configuration: the receiver of `Custom`
/// and `Checked` deny actions. Owner is in internal form (`p/C`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodTarget {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// What a firing denial does at runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum DenyAction {
    /// Throw the standard security exception.
    Standard,
    /// Throw a configured exception class, optionally with a message.
    Exception { class_name: String, message: Option<String> },
    /// Return zero/null/nothing according to the return type.
    Empty,
    /// Return a fixed constant.
    Value(ConstValue),
    /// Tail-call a user-supplied static method with the same signature.
    Custom(MethodTarget),
    /// Ask a user predicate; when it returns false, apply the fallback.
    Checked { predicate: MethodTarget, fallback: Box<DenyAction> },
}

/// Outcome of rule lookup for one member reference.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Allow,
    /// Guard the target method itself with a check-callback prologue.
    DenyTarget(DenyAction),
    /// Reroute call sites in caller classes through a proxy.
    DenyCaller(DenyAction),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn deny_caller_action(&self) -> Option<&DenyAction> {
        match self {
            Decision::DenyCaller(action) => Some(action),
            _ => None,
        }
    }

    pub fn is_deny_target(&self) -> bool {
        matches!(self, Decision::DenyTarget(_))
    }
}

static ALLOW: Decision = Decision::Allow;

pub(crate) struct MethodScope {
    pub(crate) default: Decision,
    /// Keyed by the parameter slice of the descriptor (between the parens);
    /// for fields, by the field descriptor.
    pub(crate) variants: FxHashMap<Box<[u8]>, Decision>,
}

pub(crate) struct ClassScope {
    pub(crate) methods_default: Decision,
    pub(crate) constructors_default: Decision,
    pub(crate) methods: FxHashMap<Box<[u8]>, MethodScope>,
}

pub(crate) struct PackageScope {
    pub(crate) default: Decision,
    pub(crate) classes: FxHashMap<Box<[u8]>, ClassScope>,
}

pub struct Rules {
    pub(crate) default: Decision,
    pub(crate) packages: FxHashMap<Box<[u8]>, PackageScope>,
    pub(crate) has_caller_checks: bool,
    pub(crate) has_target_checks: bool,
}

impl Rules {
    /// Whether any `DenyCaller` decision exists anywhere in the tree.
    pub fn has_caller_checks(&self) -> bool {
        self.has_caller_checks
    }

    /// Whether any `DenyTarget` decision exists anywhere in the tree.
    pub fn has_target_checks(&self) -> bool {
        self.has_target_checks
    }

    fn class_scope(&self, package: &[u8], plain: &[u8]) -> Option<&ClassScope> {
        self.packages.get(package)?.classes.get(plain)
    }

    fn decision_at(
        &self,
        package: &[u8],
        plain: &[u8],
        name: &[u8],
        variant_key: &[u8],
        constructor: bool,
    ) -> &Decision {
        let Some(pkg) = self.packages.get(package) else {
            return &self.default;
        };
        let Some(class) = pkg.classes.get(plain) else {
            return &pkg.default;
        };
        let class_default = if constructor {
            &class.constructors_default
        } else {
            &class.methods_default
        };
        let Some(method) = class.methods.get(name) else {
            return class_default;
        };
        method.variants.get(variant_key).unwrap_or(&method.default)
    }

    /// Decision for a method invocation. Members of the root object type
    /// are always allowed.
    pub fn decision_for_method(&self, member: &MemberRef) -> &Decision {
        if member.owner_class() == OBJECT_CLASS
            && object_declares(member.name(), member.descriptor())
        {
            return &ALLOW;
        }
        if member.is_constructor() {
            return self.decision_for_constructor(member);
        }
        let variant_key =
            descriptors::parameters_slice(member.descriptor()).unwrap_or(member.descriptor());
        self.decision_at(member.package(), member.plain_class(), member.name(), variant_key, false)
    }

    pub fn decision_for_constructor(&self, member: &MemberRef) -> &Decision {
        let variant_key =
            descriptors::parameters_slice(member.descriptor()).unwrap_or(member.descriptor());
        self.decision_at(member.package(), member.plain_class(), b"<init>", variant_key, true)
    }

    /// Decision for a field access; the variant key is the field descriptor.
    pub fn decision_for_field(&self, member: &MemberRef) -> &Decision {
        self.decision_at(
            member.package(),
            member.plain_class(),
            member.name(),
            member.descriptor(),
            false,
        )
    }

    /// Target-side view of one class, used by the processor to decide which
    /// methods receive a check prologue.
    pub fn for_target_class<'r>(&'r self, package: &[u8], plain: &[u8]) -> TargetQuery<'r> {
        let Some(pkg) = self.packages.get(package) else {
            return TargetQuery { class: None, fallback: &self.default };
        };
        match pkg.classes.get(plain) {
            Some(class) => TargetQuery { class: Some(class), fallback: &pkg.default },
            None => TargetQuery { class: None, fallback: &pkg.default },
        }
    }
}

/// Per-class answer to "which of this class's own members are
/// target-checked".
pub struct TargetQuery<'r> {
    class: Option<&'r ClassScope>,
    fallback: &'r Decision,
}

impl TargetQuery<'_> {
    /// Whether anything in this class can be target-checked at all.
    pub fn any_checked(&self) -> bool {
        match self.class {
            None => self.fallback.is_deny_target(),
            Some(class) => {
                class.methods_default.is_deny_target()
                    || class.constructors_default.is_deny_target()
                    || class.methods.values().any(|m| {
                        m.default.is_deny_target()
                            || m.variants.values().any(Decision::is_deny_target)
                    })
            }
        }
    }

    /// Whether any constructor of the class is target-denied; when true,
    /// every constructor gets the prologue.
    pub fn any_constructor_checked(&self) -> bool {
        match self.class {
            None => self.fallback.is_deny_target(),
            Some(class) => {
                class.constructors_default.is_deny_target()
                    || class.methods.get(&b"<init>"[..]).is_some_and(|m| {
                        m.default.is_deny_target()
                            || m.variants.values().any(Decision::is_deny_target)
                    })
            }
        }
    }

    /// Whether this exact `(name, descriptor)` is target-checked.
    pub fn method_checked(&self, name: &[u8], descriptor: &[u8]) -> bool {
        let Some(class) = self.class else {
            return self.fallback.is_deny_target();
        };
        let Some(method) = class.methods.get(name) else {
            return class.methods_default.is_deny_target();
        };
        let variant_key = descriptors::parameters_slice(descriptor).unwrap_or(descriptor);
        method
            .variants
            .get(variant_key)
            .unwrap_or(&method.default)
            .is_deny_target()
    }
}
