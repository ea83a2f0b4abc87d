//! Process-wide registry of stack instances.
//!
//! Control paths (startup, shutdown, stats readers) go through the registry
//! mutex. The data path never touches it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::info;

use crate::config::{CnetConfig, CoreConfig};
use crate::stack::{InitError, Stack, StackHandle, StackName, StopError};

#[derive(Debug, Default)]
pub(crate) struct RegistryInner {
    stacks: Vec<Arc<StackHandle>>,
    /// Indexes held by `initialize` calls still building their stacks.
    reserved: HashSet<u16>,
}

impl RegistryInner {
    pub(crate) fn remove(&mut self, handle: &Arc<StackHandle>) -> bool {
        let before = self.stacks.len();
        self.stacks.retain(|h| !Arc::ptr_eq(h, handle));
        self.stacks.len() != before
    }

    fn check_free(&self, cores: &[CoreConfig]) -> Result<(), InitError> {
        for core in cores {
            if self.stacks.iter().any(|h| h.lcore() == core.lcore) {
                return Err(InitError::DuplicateCore(core.lcore));
            }
            let name = core.instance_name();
            if self.stacks.iter().any(|h| h.name() == name) {
                return Err(InitError::DuplicateName(name));
            }
        }
        Ok(())
    }

    /// Take the `n` lowest indexes neither registered nor reserved.
    fn reserve(&mut self, n: usize) -> Result<Vec<u16>, InitError> {
        let used: HashSet<u16> = self
            .stacks
            .iter()
            .map(|h| h.idx())
            .chain(self.reserved.iter().copied())
            .collect();
        let idxs: Vec<u16> = (0..=u16::MAX)
            .filter(|i| !used.contains(i))
            .take(n)
            .collect();
        if idxs.len() < n {
            return Err(InitError::TooMany);
        }
        self.reserved.extend(idxs.iter().copied());
        Ok(idxs)
    }

    fn unreserve(&mut self, idxs: &[u16]) {
        for i in idxs {
            self.reserved.remove(i);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and register one stack per configured core. Either every
    /// instance is registered or none is.
    pub fn initialize(&self, cfg: &CnetConfig) -> Result<Vec<Stack>, InitError> {
        if cfg.cores.is_empty() {
            return Err(InitError::NoCores);
        }
        if cfg.timers.tick_ms == 0 || cfg.timers.slow_timeout_ticks == 0 {
            return Err(InitError::BadTimer);
        }
        let mut lcores = HashSet::new();
        let mut names = Vec::with_capacity(cfg.cores.len());
        for core in &cfg.cores {
            if !lcores.insert(core.lcore) {
                return Err(InitError::DuplicateCore(core.lcore));
            }
            let name = StackName::new(core.instance_name())?;
            if names.contains(&name) {
                return Err(InitError::DuplicateName(name.as_str().to_string()));
            }
            names.push(name);
        }

        let idxs = {
            let mut inner = self.lock();
            inner.check_free(&cfg.cores)?;
            inner.reserve(cfg.cores.len())?
        };

        // Pools are allocated outside the lock.
        let built = self.build(cfg, names, &idxs);

        let mut inner = self.lock();
        inner.unreserve(&idxs);
        let stacks = built?;
        // Another initialize may have raced us for the same cores.
        inner.check_free(&cfg.cores)?;
        for stack in &stacks {
            stack.handle.activate();
            inner.stacks.push(Arc::clone(&stack.handle));
        }
        drop(inner);
        for stack in &stacks {
            info!(name = %stack.name(), lcore = stack.lcore(), idx = stack.idx(), "stack registered");
        }
        Ok(stacks)
    }

    fn build(
        &self,
        cfg: &CnetConfig,
        names: Vec<StackName>,
        idxs: &[u16],
    ) -> Result<Vec<Stack>, InitError> {
        let sizes = cfg.pool_sizes();
        let mut stacks = Vec::with_capacity(cfg.cores.len());
        for ((core, name), &idx) in cfg.cores.iter().zip(names).zip(idxs) {
            stacks.push(Stack::new(
                idx,
                core,
                name,
                cfg,
                sizes,
                Arc::downgrade(&self.inner),
            )?);
        }
        Ok(stacks)
    }

    pub fn lookup_by_core(&self, lcore: u16) -> Option<Arc<StackHandle>> {
        self.lock().stacks.iter().find(|h| h.lcore() == lcore).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<StackHandle>> {
        self.lock().stacks.iter().find(|h| h.name() == name).cloned()
    }

    pub fn handles(&self) -> Vec<Arc<StackHandle>> {
        self.lock().stacks.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask the named instance to stop. The owner thread observes this at its
    /// next batch boundary and finishes with [`Stack::stop`].
    pub fn stop(&self, name: &str) -> Result<Arc<StackHandle>, StopError> {
        let handle = self
            .lookup_by_name(name)
            .ok_or_else(|| StopError::Unknown(name.to_string()))?;
        handle.request_stop()?;
        info!(name, "stop requested");
        Ok(handle)
    }

    /// Ask every registered instance to stop; returns the handles that were
    /// running.
    pub fn stop_all(&self) -> Vec<Arc<StackHandle>> {
        self.handles()
            .into_iter()
            .filter(|h| h.request_stop().is_ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::RunState;

    #[test]
    fn one_instance_per_core() {
        let reg = Registry::new();
        let stacks = reg.initialize(&CnetConfig::with_cores(&[0, 1, 5])).unwrap();
        assert_eq!(stacks.len(), 3);
        assert_eq!(reg.len(), 3);
        for lcore in [0u16, 1, 5] {
            let h = reg.lookup_by_core(lcore).unwrap();
            assert_eq!(h.lcore(), lcore);
            assert!(h.is_running());
        }
        assert!(reg.lookup_by_core(2).is_none());
        let idx: Vec<u16> = stacks.iter().map(|s| s.idx()).collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert_eq!(reg.lookup_by_name("cnet-stk5").unwrap().lcore(), 5);
    }

    #[test]
    fn duplicate_core_in_request_registers_nothing() {
        let reg = Registry::new();
        let err = reg.initialize(&CnetConfig::with_cores(&[3, 3])).unwrap_err();
        assert!(matches!(err, InitError::DuplicateCore(3)));
        assert!(reg.is_empty());
    }

    #[test]
    fn core_already_registered_is_rejected() {
        let reg = Registry::new();
        let _first = reg.initialize(&CnetConfig::with_cores(&[1])).unwrap();
        let err = reg.initialize(&CnetConfig::with_cores(&[2, 1])).unwrap_err();
        assert!(matches!(err, InitError::DuplicateCore(1)));
        assert_eq!(reg.len(), 1);
        assert!(reg.lookup_by_core(2).is_none());
    }

    #[test]
    fn pool_failure_registers_nothing() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0, 1]);
        cfg.pools.segments = Some(0);
        assert!(matches!(reg.initialize(&cfg), Err(InitError::Pool(_))));
        assert!(reg.is_empty());
        assert!(reg.lookup_by_core(0).is_none());
    }

    #[test]
    fn empty_core_list_rejected() {
        let reg = Registry::new();
        assert!(matches!(
            reg.initialize(&CnetConfig::default()),
            Err(InitError::NoCores)
        ));
    }

    #[test]
    fn names_must_be_unique() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0, 1]);
        cfg.cores[0].name = Some("edge".into());
        cfg.cores[1].name = Some("edge".into());
        assert!(matches!(reg.initialize(&cfg), Err(InitError::DuplicateName(_))));
        cfg.cores[1].name = Some("y".repeat(40));
        assert!(matches!(reg.initialize(&cfg), Err(InitError::BadName(_))));
        assert!(reg.is_empty());
    }

    #[test]
    fn control_stop_flips_once() {
        let reg = Registry::new();
        let _stacks = reg.initialize(&CnetConfig::with_cores(&[0, 1])).unwrap();
        let h = reg.stop("cnet-stk1").unwrap();
        assert_eq!(h.run_state(), RunState::Stopping);
        assert!(!h.is_running());
        assert!(matches!(reg.stop("cnet-stk1"), Err(StopError::AlreadyStopped(_))));
        assert!(matches!(reg.stop("nope"), Err(StopError::Unknown(_))));
        let rest = reg.stop_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].lcore(), 0);
    }

    #[test]
    fn disjoint_concurrent_initialize_shares_no_pool() {
        let reg = Registry::new();
        let (a, b) = std::thread::scope(|s| {
            let a = s.spawn(|| reg.initialize(&CnetConfig::with_cores(&[0, 1])));
            let b = s.spawn(|| reg.initialize(&CnetConfig::with_cores(&[2, 3])));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });
        assert_eq!(reg.len(), 4);
        let mut ids = HashSet::new();
        let mut idxs = HashSet::new();
        for stk in a.iter().chain(b.iter()) {
            assert!(idxs.insert(stk.idx()));
            for id in [
                stk.tcb_objs.id(),
                stk.seg_objs.id(),
                stk.pcb_objs.id(),
                stk.chnl_objs.id(),
            ] {
                assert!(ids.insert(id), "pool {id:?} shared");
            }
        }
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn stopped_instances_give_back_their_index() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0, 1]);
        cfg.pools.segments = Some(0);
        assert!(reg.initialize(&cfg).is_err());

        let mut stacks = reg.initialize(&CnetConfig::with_cores(&[0, 1])).unwrap();
        let idx: Vec<u16> = stacks.iter().map(|s| s.idx()).collect();
        assert_eq!(idx, vec![0, 1]);

        let first = stacks.remove(0);
        first.stop().unwrap();
        let again = reg.initialize(&CnetConfig::with_cores(&[4])).unwrap();
        assert_eq!(again[0].idx(), 0);
        let next = reg.initialize(&CnetConfig::with_cores(&[5])).unwrap();
        assert_eq!(next[0].idx(), 2);
    }

    #[test]
    fn zero_intervals_rejected() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0]);
        cfg.timers.tick_ms = 0;
        assert!(matches!(reg.initialize(&cfg), Err(InitError::BadTimer)));
        cfg.timers.tick_ms = 10;
        cfg.timers.slow_timeout_ticks = 0;
        assert!(matches!(reg.initialize(&cfg), Err(InitError::BadTimer)));
        assert!(reg.is_empty());
    }

    #[test]
    fn concurrent_initialize_is_all_or_nothing() {
        let reg = Registry::new();
        let results = std::thread::scope(|s| {
            let a = s.spawn(|| reg.initialize(&CnetConfig::with_cores(&[7, 8])));
            let b = s.spawn(|| reg.initialize(&CnetConfig::with_cores(&[8, 9])));
            vec![a.join().unwrap(), b.join().unwrap()]
        });
        let won: Vec<&Vec<Stack>> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(won.len(), 1);
        assert_eq!(reg.len(), 2);
        let lcores: Vec<u16> = won[0].iter().map(|s| s.lcore()).collect();
        for lcore in lcores {
            assert!(reg.lookup_by_core(lcore).is_some());
        }
    }
}
