//! Process level registry of domains.
//!
//! Owns the id allocator and the id -> domain map behind one lock, and keeps
//! the permanent default domain alive until [`DomainRegistry::shutdown`].
//! A registry that has been shut down refuses to create or destroy domains.
use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    Domain, DomainError, DomainId, DomainKind, DomainSnapshot, IdAllocator, RegistrySettings,
    Result,
};

#[derive(Debug)]
struct RegistryState {
    ids: IdAllocator,
    domains: HashMap<DomainId, Arc<Domain>, ahash::RandomState>,
    shut_down: bool,
}

#[derive(Debug)]
pub struct DomainRegistry {
    settings: RegistrySettings,
    default_id: DomainId,
    state: Mutex<RegistryState>,
}

impl DomainRegistry {
    /// Creates a registry together with its default domain.
    pub fn init(settings: RegistrySettings) -> Result<Arc<Self>> {
        let settings = settings.checked()?;
        let mut ids = IdAllocator::new(settings.id_page_size, settings.max_id_pages);
        let default_id = ids.allocate()?;
        let default = Arc::new(Domain::new(
            default_id,
            Some(settings.default_domain_name.as_str()),
            DomainKind::Default,
            settings.domain.clone(),
        ));

        let mut domains = HashMap::default();
        domains.insert(default_id, default);
        log::debug!(
            "registry: up, default domain {default_id} '{}'",
            settings.default_domain_name
        );

        Ok(Arc::new(Self {
            settings,
            default_id,
            state: Mutex::new(RegistryState {
                ids,
                domains,
                shut_down: false,
            }),
        }))
    }

    #[inline]
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn create_domain(&self, name: Option<&str>) -> Result<Arc<Domain>> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(DomainError::ShutDown);
        }
        let id = state.ids.allocate()?;
        let domain = Arc::new(Domain::new(
            id,
            name,
            DomainKind::Normal,
            self.settings.domain.clone(),
        ));
        state.domains.insert(id, domain.clone());
        log::debug!("registry: created domain {id} '{}'", domain.name());
        Ok(domain)
    }

    pub fn lookup(&self, id: DomainId) -> Result<Arc<Domain>> {
        self.state
            .lock()
            .domains
            .get(&id)
            .cloned()
            .ok_or(DomainError::UnknownId(id))
    }

    pub fn default_domain(&self) -> Result<Arc<Domain>> {
        self.lookup(self.default_id)
    }

    /// Tears `domain` down and forgets it.
    ///
    /// The default domain is refused. Other failures to release the domain
    /// (threads still executing in it, surviving root objects) are bugs in
    /// the caller and panic.
    pub fn destroy_domain(&self, domain: &Arc<Domain>) -> Result<()> {
        if domain.kind() == DomainKind::Default {
            return Err(DomainError::PermanentDomain);
        }
        let id = domain.id();
        {
            let state = self.state.lock();
            if state.shut_down {
                return Err(DomainError::ShutDown);
            }
            match state.domains.get(&id) {
                Some(registered) if Arc::ptr_eq(registered, domain) => {}
                _ => return Err(DomainError::UnknownId(id)),
            }
        }

        domain.teardown();
        self.forget(id)
    }

    fn forget(&self, id: DomainId) -> Result<()> {
        let mut state = self.state.lock();
        if state.domains.remove(&id).is_none() {
            return Err(DomainError::UnknownId(id));
        }
        state.ids.release(id)?;
        log::debug!("registry: destroyed domain {id}");
        Ok(())
    }

    /// Destroys every domain, the default one included. Later calls do
    /// nothing.
    pub fn shutdown(&self) {
        let mut domains: Vec<_> = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.domains.values().cloned().collect()
        };
        // default last
        domains.sort_by_key(|d| (d.kind() == DomainKind::Default, d.id()));
        let count = domains.len();

        for domain in domains {
            domain.teardown();
            if let Err(err) = self.forget(domain.id()) {
                log::warn!("registry: shutdown raced on {}: {err}", domain.id());
            }
        }
        log::debug!("registry: shut down {count} domains");
    }

    /// Diagnostic view of every live domain, ordered by id.
    pub fn snapshots(&self) -> Vec<DomainSnapshot> {
        let domains: Vec<_> = self.state.lock().domains.values().cloned().collect();
        let mut snapshots: Vec<_> = domains.iter().map(|d| d.snapshot()).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn len(&self) -> usize {
        self.state.lock().domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
