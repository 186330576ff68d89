//! Per-caller-module allow/deny decisions with caching.
//!
//! A checker answers "may code in my module use this member" by consulting
//! the rules on the class that declares the member, walking up the
//! inheritance graph for virtual invocations. Results are cached per
//! question kind; a class that cannot be resolved is a deny and is never
//! cached.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use jclass::member::MemberRef;

use crate::finder::{ClassIndex, MemberFinderCache, ModuleId};
use crate::rules::{object_declares, Rules, OBJECT_CLASS};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Question {
    Constructor,
    Method,
    VirtualMethod,
    Field,
}

type ResultCache = RwLock<FxHashMap<Box<[u8]>, bool>>;

pub struct Checker {
    module: ModuleId,
    rules: Arc<Rules>,
    index: Arc<dyn ClassIndex>,
    finders: Arc<MemberFinderCache>,
    constructor_cache: ResultCache,
    method_cache: ResultCache,
    virtual_cache: ResultCache,
    field_cache: ResultCache,
}

impl Checker {
    pub fn new(
        module: ModuleId,
        rules: Arc<Rules>,
        index: Arc<dyn ClassIndex>,
        finders: Arc<MemberFinderCache>,
    ) -> Checker {
        Checker {
            module,
            rules,
            index,
            finders,
            constructor_cache: ResultCache::default(),
            method_cache: ResultCache::default(),
            virtual_cache: ResultCache::default(),
            field_cache: ResultCache::default(),
        }
    }

    pub fn module(&self) -> &ModuleId {
        &self.module
    }

    pub fn is_constructor_allowed(&self, member: &MemberRef) -> bool {
        self.cached(&self.constructor_cache, member, Question::Constructor)
    }

    /// Non-virtual invocation (`invokestatic` / `invokespecial`).
    pub fn is_method_allowed(&self, member: &MemberRef) -> bool {
        self.cached(&self.method_cache, member, Question::Method)
    }

    /// Virtual invocation: a deny on the declaring class can still be
    /// overridden by an allow inherited from a supertype.
    pub fn is_virtual_method_allowed(&self, member: &MemberRef) -> bool {
        self.cached(&self.virtual_cache, member, Question::VirtualMethod)
    }

    pub fn is_field_allowed(&self, member: &MemberRef) -> bool {
        self.cached(&self.field_cache, member, Question::Field)
    }

    fn cached(&self, cache: &ResultCache, member: &MemberRef, question: Question) -> bool {
        let key = member.encode_full();
        if let Some(&answer) = cache.read().get(key.as_slice()) {
            return answer;
        }
        let (allowed, cacheable) = self.resolve(member.owner_class(), member, question);
        if cacheable {
            cache.write().insert(key.into_boxed_slice(), allowed);
        }
        allowed
    }

    /// Returns `(allowed, cacheable)`; a failed class lookup anywhere in
    /// the walk is a deny that must not be cached.
    fn resolve(&self, owner: &[u8], member: &MemberRef, question: Question) -> (bool, bool) {
        if owner == OBJECT_CLASS {
            return (object_declares(member.name(), member.descriptor()), true);
        }
        let Some(summary) = self.index.class_summary(owner) else {
            return (false, false);
        };
        if summary.module == self.module {
            return (true, true);
        }
        let finder = self.finders.finder_for(&summary);
        if finder.contains(member.name(), member.descriptor()) {
            let here = MemberRef::new(owner, member.name(), member.descriptor(), false);
            let decision = match question {
                Question::Constructor => self.rules.decision_for_constructor(&here),
                Question::Field => self.rules.decision_for_field(&here),
                Question::Method | Question::VirtualMethod => {
                    self.rules.decision_for_method(&here)
                }
            };
            if decision.is_allow() {
                return (true, true);
            }
            if question != Question::VirtualMethod {
                return (false, true);
            }
            // Denied here, but "inherited-as" access may still allow it.
        } else if question == Question::Constructor {
            // Constructors are never inherited.
            return (false, true);
        }
        let mut cacheable = true;
        let supertypes = summary
            .super_name
            .iter()
            .chain(summary.interface_names.iter());
        for supertype in supertypes {
            let (allowed, sub_cacheable) = self.resolve(supertype, member, question);
            if allowed {
                return (true, sub_cacheable);
            }
            cacheable &= sub_cacheable;
        }
        (false, cacheable)
    }
}
