//! Class summaries and the member finder cache.
//!
//! The checker never touches a live JVM: everything it needs about a loaded
//! class arrives as a [`ClassSummary`] through the [`ClassIndex`] lookup
//! function, which keeps the whole inheritance walk testable in isolation.

use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::RwLock;

use jclass::descriptors;

/// Opaque identity of the module a class belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(Arc<str>);

impl ModuleId {
    pub fn new(name: &str) -> ModuleId {
        ModuleId(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Field,
}

/// One public or protected member declared by a class (not inherited).
#[derive(Clone, Debug)]
pub struct DeclaredMember {
    pub name: Vec<u8>,
    pub descriptor: Vec<u8>,
    pub kind: MemberKind,
    pub varargs: bool,
}

/// Everything the checker needs to know about one loaded class.
#[derive(Clone, Debug)]
pub struct ClassSummary {
    /// Binary name in internal form.
    pub name: Vec<u8>,
    pub module: ModuleId,
    pub super_name: Option<Vec<u8>>,
    /// Direct superinterfaces in declaration order.
    pub interface_names: Vec<Vec<u8>>,
    pub declared: Vec<DeclaredMember>,
}

/// Lookup function from binary class name to summary. Implementations may
/// block (class loading); `None` means the class could not be resolved.
pub trait ClassIndex: Send + Sync {
    fn class_summary(&self, binary_name: &[u8]) -> Option<Arc<ClassSummary>>;
}

/// In-memory [`ClassIndex`], used by tests and by hosts that pre-resolve
/// their class graph.
#[derive(Default)]
pub struct MapIndex {
    classes: FxHashMap<Vec<u8>, Arc<ClassSummary>>,
}

impl MapIndex {
    pub fn insert(&mut self, summary: ClassSummary) {
        self.classes.insert(summary.name.clone(), Arc::new(summary));
    }
}

impl ClassIndex for MapIndex {
    fn class_summary(&self, binary_name: &[u8]) -> Option<Arc<ClassSummary>> {
        self.classes.get(binary_name).cloned()
    }
}

const METHOD_HANDLE_CLASS: &[u8] = b"java/lang/invoke/MethodHandle";
const VAR_HANDLE_CLASS: &[u8] = b"java/lang/invoke/VarHandle";
const OBJECT_ARRAY_PARAMS: &[u8] = b"[Ljava/lang/Object;";

/// Immutable `(name, descriptor)` index over the members one class
/// declares.
///
/// Signature-polymorphic exception: on the VM's `MethodHandle` and
/// `VarHandle` types, a varargs method whose only parameter is an `Object[]`
/// is indexed under the empty descriptor and matches any call-site
/// descriptor. `invokeWithArguments` is the named exception and is indexed
/// normally. This is the only descriptor-agnostic match in the system.
pub struct MemberFinder {
    members: FxHashSet<Vec<u8>>,
    polymorphic: FxHashSet<Vec<u8>>,
}

fn member_key(name: &[u8], descriptor: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + descriptor.len() + 1);
    key.extend_from_slice(name);
    key.push(b';');
    key.extend_from_slice(descriptor);
    key
}

impl MemberFinder {
    pub fn for_class(summary: &ClassSummary) -> MemberFinder {
        let polymorphic_owner =
            summary.name == METHOD_HANDLE_CLASS || summary.name == VAR_HANDLE_CLASS;
        let mut members = FxHashSet::default();
        let mut polymorphic = FxHashSet::default();
        for member in &summary.declared {
            let is_polymorphic = polymorphic_owner
                && member.kind == MemberKind::Method
                && member.varargs
                && member.name != b"invokeWithArguments"
                && descriptors::parameters_slice(&member.descriptor)
                    .map(|p| p == OBJECT_ARRAY_PARAMS)
                    .unwrap_or(false);
            if is_polymorphic {
                polymorphic.insert(member.name.clone());
            } else {
                members.insert(member_key(&member.name, &member.descriptor));
            }
        }
        MemberFinder { members, polymorphic }
    }

    pub fn contains(&self, name: &[u8], descriptor: &[u8]) -> bool {
        if self.polymorphic.contains(name) {
            return true;
        }
        self.members.contains(&member_key(name, descriptor))
    }
}

/// Process-wide `class name → MemberFinder` cache. A lost entry is simply
/// re-derived; duplicate computation is acceptable.
#[derive(Default)]
pub struct MemberFinderCache {
    map: RwLock<FxHashMap<Vec<u8>, Arc<MemberFinder>>>,
}

impl MemberFinderCache {
    pub fn finder_for(&self, summary: &ClassSummary) -> Arc<MemberFinder> {
        if let Some(finder) = self.map.read().get(&summary.name) {
            return finder.clone();
        }
        let finder = Arc::new(MemberFinder::for_class(summary));
        self.map.write().insert(summary.name.clone(), finder.clone());
        finder
    }
}
