//! The process-wide controller registry and the transform entry point the
//! instrumentation agent drives.
//!
//! The agent itself (premain plumbing, retransform triggers, the runtime
//! `check` callback) lives outside this crate; what it needs from the core
//! is exactly this surface: install a controller once, hand every offered
//! classfile to [`Controller::transform`], and let the fail-secure path
//! substitute a sealed class when anything goes wrong.

use std::sync::{Arc, OnceLock};

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, error, warn};
use parking_lot::RwLock;
use thiserror::Error;

use jclass::member::OwnedMember;

use crate::checker::Checker;
use crate::finder::{ClassIndex, MemberFinderCache, ModuleId};
use crate::processor::{self, ClassFileProcessor};
use crate::rules::{Decision, Rules};

/// Where the bytes being transformed were defined. Bootstrap classes are
/// never transformed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderKind {
    Bootstrap,
    Defined(u64),
}

/// `@CallerSensitive` families with no agreed-upon default handling; the
/// policy layer may hook each one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SensitiveFamily {
    ReflectionLookup,
    MethodHandleLookup,
    CallerClassQuery,
}

pub type SensitiveHook = Arc<dyn Fn(&OwnedMember) -> Option<Decision> + Send + Sync>;

#[derive(Debug, Error)]
#[error("a controller is already installed")]
pub struct AlreadyInstalled;

pub struct Controller {
    rules: Arc<Rules>,
    index: Arc<dyn ClassIndex>,
    trusted: FxHashSet<ModuleId>,
    finders: Arc<MemberFinderCache>,
    checkers: RwLock<FxHashMap<ModuleId, Arc<Checker>>>,
    sensitive_hooks: FxHashMap<SensitiveFamily, SensitiveHook>,
}

impl Controller {
    pub fn new(rules: Rules, index: Arc<dyn ClassIndex>) -> Controller {
        Controller {
            rules: Arc::new(rules),
            index,
            trusted: FxHashSet::default(),
            finders: Arc::new(MemberFinderCache::default()),
            checkers: RwLock::new(FxHashMap::default()),
            sensitive_hooks: FxHashMap::default(),
        }
    }

    /// Mark a module as trusted: its classes are handed back untouched.
    pub fn trust(&mut self, module: ModuleId) -> &mut Self {
        self.trusted.insert(module);
        self
    }

    /// Install a policy hook for one caller-sensitive family. There are no
    /// defaults.
    pub fn sensitive_hook(&mut self, family: SensitiveFamily, hook: SensitiveHook) -> &mut Self {
        self.sensitive_hooks.insert(family, hook);
        self
    }

    pub fn rules(&self) -> &Arc<Rules> {
        &self.rules
    }

    pub fn hook_for(&self, family: SensitiveFamily) -> Option<&SensitiveHook> {
        self.sensitive_hooks.get(&family)
    }

    /// The per-module checker backing the runtime check callback; created
    /// on first use, then shared.
    pub fn checker_for(&self, module: &ModuleId) -> Arc<Checker> {
        if let Some(checker) = self.checkers.read().get(module) {
            return checker.clone();
        }
        let checker = Arc::new(Checker::new(
            module.clone(),
            self.rules.clone(),
            self.index.clone(),
            self.finders.clone(),
        ));
        self.checkers
            .write()
            .entry(module.clone())
            .or_insert(checker)
            .clone()
    }

    /// Transform entry point. `None` means the bytes are to be used as-is.
    ///
    /// Re-entrant: hidden-class bytes intercepted at runtime can be routed
    /// back through here from inside another transformation.
    pub fn transform(
        &self,
        bytes: &[u8],
        module: &ModuleId,
        loader: LoaderKind,
    ) -> Option<Vec<u8>> {
        if loader == LoaderKind::Bootstrap {
            return None;
        }
        if self.trusted.contains(module) {
            return None;
        }
        match ClassFileProcessor::new(bytes).transform(&self.rules) {
            Ok(result) => {
                debug!(
                    "transform for module {}: {}",
                    module.as_str(),
                    if result.is_some() { "rewritten" } else { "unchanged" }
                );
                result
            }
            Err(cause) => {
                // Returning the input untransformed would be a bypass, so
                // the failed class is replaced by one that throws from
                // every method.
                warn!("transformation failed ({cause}); substituting sealed class");
                match processor::seal(bytes) {
                    Ok(sealed) => Some(sealed),
                    Err(seal_cause) => {
                        // The bytes do not even parse as a classfile; the
                        // host VM will reject them on its own.
                        error!("could not seal class: {seal_cause}");
                        None
                    }
                }
            }
        }
    }
}

static CONTROLLER: OnceLock<Arc<Controller>> = OnceLock::new();

/// Install the process-wide controller. Happens once, at agent start,
/// before the first user classfile is offered; re-installation is a
/// security error and teardown is not supported.
pub fn install(controller: Arc<Controller>) -> Result<(), AlreadyInstalled> {
    CONTROLLER.set(controller).map_err(|_| AlreadyInstalled)
}

pub fn installed() -> Option<&'static Arc<Controller>> {
    CONTROLLER.get()
}
