//! Protocol helper registration and lookup.
//!
//! A helper knows how to find embedded addresses in one application
//! protocol. The registry maps tuple patterns to helpers; connections are
//! bound to a helper when they are created and keep only a weak reference,
//! so unregistering a helper never has to wait for its connections.

use crate::conntrack::Connection;
use crate::error::{NotFound, RegistryError};
use crate::mangle::MangleRequest;
use natmangle_core::{Direction, Tuple, TuplePattern};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

/// What a helper wants done with the packet it inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelpAction {
    /// Forward unchanged.
    Pass,
    /// Rewrite part of the payload, then forward.
    Mangle(MangleRequest),
    /// The helper could not make sense of the packet.
    Drop,
}

/// Protocol-specific payload inspection.
pub trait HelperOps: Send + Sync {
    fn help(&self, conn: &Connection, dir: Direction, payload: &[u8]) -> HelpAction;
}

impl<F> HelperOps for F
where
    F: Fn(&Connection, Direction, &[u8]) -> HelpAction + Send + Sync,
{
    fn help(&self, conn: &Connection, dir: Direction, payload: &[u8]) -> HelpAction {
        self(conn, dir, payload)
    }
}

/// A named helper and the flows it serves.
#[derive(Clone)]
pub struct Helper {
    name: String,
    pattern: TuplePattern,
    ops: Arc<dyn HelperOps>,
    standalone: bool,
}

impl Helper {
    /// A helper that needs its companion connection-tracking module.
    pub fn new(
        name: impl Into<String>,
        pattern: TuplePattern,
        ops: impl HelperOps + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            pattern,
            ops: Arc::new(ops),
            standalone: false,
        }
    }

    /// Mark the helper as not depending on a companion module.
    pub fn standalone(mut self) -> Self {
        self.standalone = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &TuplePattern {
        &self.pattern
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    pub fn help(&self, conn: &Connection, dir: Direction, payload: &[u8]) -> HelpAction {
        self.ops.help(conn, dir, payload)
    }
}

impl std::fmt::Debug for Helper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Helper")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("standalone", &self.standalone)
            .finish_non_exhaustive()
    }
}

/// A pinned reference on a companion module; released on drop.
#[derive(Debug)]
pub struct DependencyHandle {
    name: String,
    refs: Arc<AtomicUsize>,
}

impl DependencyHandle {
    /// Take a reference on the module counted by `refs`.
    pub fn acquire(name: impl Into<String>, refs: &Arc<AtomicUsize>) -> Self {
        refs.fetch_add(1, Ordering::AcqRel);
        Self {
            name: name.into(),
            refs: refs.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DependencyHandle {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Finds (and if necessary loads) the companion module a helper needs.
pub trait DependencyResolver: Send + Sync {
    fn resolve_dependency(&self, name: &str) -> Result<DependencyHandle, NotFound>;
}

/// Resolver over a fixed set of already-available companion modules.
#[derive(Debug, Default)]
pub struct StaticResolver {
    modules: HashMap<String, Arc<AtomicUsize>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, name: impl Into<String>) -> Self {
        self.modules.insert(name.into(), Arc::new(AtomicUsize::new(0)));
        self
    }

    /// Current number of handles held on `name`.
    pub fn ref_count(&self, name: &str) -> usize {
        self.modules
            .get(name)
            .map_or(0, |refs| refs.load(Ordering::Acquire))
    }
}

impl DependencyResolver for StaticResolver {
    fn resolve_dependency(&self, name: &str) -> Result<DependencyHandle, NotFound> {
        self.modules
            .get(name)
            .map(|refs| DependencyHandle::acquire(name, refs))
            .ok_or_else(|| NotFound(name.to_string()))
    }
}

/// A registered helper together with the connections bound to it.
pub(crate) struct Registration {
    helper: Arc<Helper>,
    companion: Mutex<Option<DependencyHandle>>,
    /// `None` once the helper has been unregistered.
    bound: Mutex<Option<Vec<Weak<Connection>>>>,
}

impl Registration {
    pub(crate) fn helper(&self) -> &Arc<Helper> {
        &self.helper
    }

    fn lock_bound(&self) -> MutexGuard<'_, Option<Vec<Weak<Connection>>>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `conn` unless the helper is already on its way out.
    fn attach(self: &Arc<Self>, conn: &Arc<Connection>) -> bool {
        let mut bound = self.lock_bound();
        let Some(list) = bound.as_mut() else {
            return false;
        };
        if !conn.bind(Arc::downgrade(self)) {
            return false;
        }
        list.retain(|weak| weak.strong_count() > 0);
        list.push(Arc::downgrade(conn));
        true
    }

    fn detach(&self, conn: &Connection) {
        if let Some(list) = self.lock_bound().as_mut() {
            let target: *const Connection = conn;
            list.retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), target));
        }
    }

    /// Close the registration and hand back everything still bound.
    fn retire(&self) -> Vec<Weak<Connection>> {
        self.lock_bound().take().unwrap_or_default()
    }

    fn release_companion(&self) {
        let handle = self
            .companion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            tracing::debug!("NAT: released companion module {}", handle.name());
        }
    }
}

/// Process-wide table of helpers, most recently registered first.
pub struct HelperRegistry {
    helpers: RwLock<Vec<Arc<Registration>>>,
    resolver: Arc<dyn DependencyResolver>,
}

impl HelperRegistry {
    pub fn new(resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            helpers: RwLock::new(Vec::new()),
            resolver,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Registration>>> {
        self.helpers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Registration>>> {
        self.helpers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a helper.
    ///
    /// Fails if a helper of the same name is installed, if an existing
    /// pattern already covers the new helper's tuple, or if a non-standalone
    /// helper's companion module is unavailable.
    pub fn register(&self, helper: Helper) -> Result<(), RegistryError> {
        // Resolve outside the table lock; loading may be slow.
        let companion = if helper.is_standalone() {
            None
        } else {
            let handle = self
                .resolver
                .resolve_dependency(helper.name())
                .map_err(|source| {
                    tracing::warn!(
                        "NAT: cannot register helper {}: {}",
                        helper.name(),
                        source
                    );
                    RegistryError::DependencyUnavailable {
                        helper: helper.name().to_string(),
                        source,
                    }
                })?;
            Some(handle)
        };

        let mut helpers = self.write();
        // Unregistration is by name, so names must stay unique.
        if helpers.iter().any(|existing| {
            existing.helper.name() == helper.name()
                || existing.helper.pattern().matches(&helper.pattern().tuple)
        }) {
            return Err(RegistryError::AlreadyRegistered(helper.name().to_string()));
        }

        tracing::debug!(
            "NAT: registered helper {} for {:?}",
            helper.name(),
            helper.pattern()
        );
        helpers.insert(
            0,
            Arc::new(Registration {
                helper: Arc::new(helper),
                companion: Mutex::new(companion),
                bound: Mutex::new(Some(Vec::new())),
            }),
        );
        Ok(())
    }

    /// Remove a helper and terminate every connection still using it.
    ///
    /// Returns the number of connections terminated.
    pub fn unregister(&self, name: &str) -> usize {
        let removed = {
            let mut helpers = self.write();
            helpers
                .iter()
                .position(|r| r.helper.name() == name)
                .map(|index| helpers.remove(index))
        };

        let Some(registration) = removed else {
            tracing::warn!("NAT: unregister of unknown helper {}", name);
            return 0;
        };

        let mut terminated = 0;
        for conn in registration.retire().iter().filter_map(Weak::upgrade) {
            conn.terminate();
            terminated += 1;
        }
        registration.release_companion();

        tracing::debug!(
            "NAT: unregistered helper {}, terminated {} connections",
            name,
            terminated
        );
        terminated
    }

    /// First helper whose pattern matches `tuple`.
    pub fn lookup(&self, tuple: &Tuple) -> Option<Arc<Helper>> {
        self.read()
            .iter()
            .find(|r| r.helper.pattern().matches(tuple))
            .map(|r| r.helper.clone())
    }

    pub fn find(&self, name: &str) -> Option<Arc<Helper>> {
        self.read()
            .iter()
            .find(|r| r.helper.name() == name)
            .map(|r| r.helper.clone())
    }

    /// Names in lookup order.
    pub fn names(&self) -> Vec<String> {
        self.read()
            .iter()
            .map(|r| r.helper.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Bind a freshly created connection to the helper matching its tuple.
    pub fn bind(&self, conn: &Arc<Connection>) -> Option<Arc<Helper>> {
        let registration = self
            .read()
            .iter()
            .find(|r| r.helper.pattern().matches(conn.tuple()))
            .cloned()?;

        if registration.attach(conn) {
            Some(registration.helper.clone())
        } else {
            // Lost a race with unregister.
            conn.terminate();
            None
        }
    }

    /// Forget a connection that is going away, so unregistering its helper
    /// no longer has to terminate it.
    pub fn unbind(&self, conn: &Connection) {
        if let Some(registration) = conn.registration() {
            registration.detach(conn);
        }
    }
}

impl std::fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperRegistry")
            .field("helpers", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status_code;
    use crate::testutil::{CLIENT, SERVER};
    use natmangle_core::{Protocol, TupleMask};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn pass(_: &Connection, _: Direction, _: &[u8]) -> HelpAction {
        HelpAction::Pass
    }

    fn ftp() -> Helper {
        Helper::new("ftp", TuplePattern::service(Protocol::Tcp, 21), pass)
    }

    fn registry_with(resolver: StaticResolver) -> (HelperRegistry, Arc<StaticResolver>) {
        let resolver = Arc::new(resolver);
        (HelperRegistry::new(resolver.clone()), resolver)
    }

    #[test]
    fn register_and_lookup() {
        let (registry, resolver) = registry_with(StaticResolver::new().with_module("ftp"));
        registry.register(ftp()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(resolver.ref_count("ftp"), 1);
        let helper = registry.lookup(&Tuple::tcp(CLIENT, SERVER)).unwrap();
        assert_eq!(helper.name(), "ftp");
        assert!(registry.lookup(&Tuple::udp(CLIENT, SERVER)).is_none());
        assert!(registry.find("ftp").is_some());
    }

    #[test]
    fn duplicate_pattern_is_rejected() {
        let (registry, resolver) = registry_with(StaticResolver::new().with_module("ftp"));
        registry.register(ftp()).unwrap();

        let result = registry.register(ftp());
        assert_eq!(
            result,
            Err(RegistryError::AlreadyRegistered("ftp".to_string()))
        );
        assert_eq!(status_code(&result), -17);
        // The handle taken for the rejected attempt was released again.
        assert_eq!(resolver.ref_count("ftp"), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (registry, resolver) = registry_with(StaticResolver::new().with_module("ftp"));
        registry.register(ftp()).unwrap();

        let alt_port = Helper::new("ftp", TuplePattern::service(Protocol::Tcp, 2121), pass);
        let result = registry.register(alt_port);
        assert_eq!(
            result,
            Err(RegistryError::AlreadyRegistered("ftp".to_string()))
        );
        assert_eq!(status_code(&result), -17);
        assert_eq!(resolver.ref_count("ftp"), 1);

        registry.unregister("ftp");
        assert!(registry.is_empty());
        assert_eq!(resolver.ref_count("ftp"), 0);
    }

    #[test]
    fn missing_dependency_fails_registration() {
        let (registry, _) = registry_with(StaticResolver::new());
        let result = registry.register(ftp());

        assert!(matches!(
            result,
            Err(RegistryError::DependencyUnavailable { .. })
        ));
        assert_eq!(status_code(&result), -16);
        assert!(registry.is_empty());
        assert!(registry.lookup(&Tuple::tcp(CLIENT, SERVER)).is_none());
    }

    #[test]
    fn standalone_skips_dependency() {
        let (registry, _) = registry_with(StaticResolver::new());
        let sip = Helper::new("sip", TuplePattern::service(Protocol::Udp, 5060), pass).standalone();
        assert_eq!(status_code(&registry.register(sip)), 0);
    }

    #[test]
    fn most_recent_registration_wins() {
        let (registry, _) = registry_with(StaticResolver::new());
        let broad = Helper::new(
            "any-tcp-21",
            TuplePattern::new(
                Tuple::tcp(
                    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
                    SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 0), 21),
                ),
                TupleMask {
                    dst_ip: Ipv4Addr::new(255, 255, 255, 0),
                    ..TupleMask::service()
                },
            ),
            pass,
        )
        .standalone();
        registry.register(broad).unwrap();

        let narrow = Helper::new(
            "exact",
            TuplePattern::new(Tuple::tcp(CLIENT, SERVER), TupleMask::exact()),
            pass,
        )
        .standalone();
        // The narrow tuple is covered by the broad pattern.
        assert!(registry.register(narrow).is_err());

        let other = Helper::new(
            "other-net",
            TuplePattern::service(Protocol::Tcp, 2121),
            pass,
        )
        .standalone();
        registry.register(other).unwrap();
        assert_eq!(registry.names(), vec!["other-net", "any-tcp-21"]);
    }

    #[test]
    fn unregister_terminates_bound_connections() {
        let (registry, resolver) = registry_with(StaticResolver::new().with_module("ftp"));
        registry.register(ftp()).unwrap();

        let bound = Connection::new(Tuple::tcp(CLIENT, SERVER));
        let unrelated = Connection::new(Tuple::tcp(
            CLIENT,
            SocketAddrV4::new(*SERVER.ip(), 80),
        ));
        assert!(registry.bind(&bound).is_some());
        assert!(registry.bind(&unrelated).is_none());
        assert_eq!(bound.helper().unwrap().name(), "ftp");

        assert_eq!(registry.unregister("ftp"), 1);
        assert!(bound.is_terminated());
        assert!(bound.helper().is_none());
        assert!(!unrelated.is_terminated());
        assert_eq!(resolver.ref_count("ftp"), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn detached_connections_survive_unregister() {
        let (registry, _) = registry_with(StaticResolver::new().with_module("ftp"));
        registry.register(ftp()).unwrap();

        let conn = Connection::new(Tuple::tcp(CLIENT, SERVER));
        registry.bind(&conn).unwrap();
        registry.unbind(&conn);

        assert_eq!(registry.unregister("ftp"), 0);
        assert!(!conn.is_terminated());
    }

    #[test]
    fn dropped_connections_are_not_counted() {
        let (registry, _) = registry_with(StaticResolver::new().with_module("ftp"));
        registry.register(ftp()).unwrap();

        let conn = Connection::new(Tuple::tcp(CLIENT, SERVER));
        registry.bind(&conn).unwrap();
        drop(conn);

        assert_eq!(registry.unregister("ftp"), 0);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let (registry, _) = registry_with(StaticResolver::new());
        assert_eq!(registry.unregister("nope"), 0);
    }

    #[test]
    fn closure_helpers() {
        let helper = Helper::new(
            "rewrite-all",
            TuplePattern::service(Protocol::Tcp, 21),
            |_: &Connection, _: Direction, payload: &[u8]| {
                HelpAction::Mangle(MangleRequest::new(0, payload.len(), "x"))
            },
        );
        let conn = Connection::new(Tuple::tcp(CLIENT, SERVER));
        assert_eq!(
            helper.help(&conn, Direction::Original, b"abc"),
            HelpAction::Mangle(MangleRequest::new(0, 3, "x"))
        );
    }
}
