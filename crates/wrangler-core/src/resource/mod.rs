//! Host and slot resource accounting.
//!
//! A [`Host`] owns a fixed pool of memory and CPU threads and tracks which
//! thread indices are currently claimed by which task. A [`Slot`] is the
//! atom of placement: a (worker-rank, host) pair handed to the coordinator
//! at registration time and never recreated for the life of the run.

use std::collections::HashMap;

use crate::dag::TaskId;

/// A CPU thread index on a host, 0..threads-1.
pub type CpuIndex = u16;

/// A registered host contributing one or more slots.
#[derive(Debug)]
pub struct Host {
    name: String,
    memory: u32,
    threads: u16,
    cores: u16,
    sockets: u16,
    slots: u32,

    memory_free: u32,
    cpus_free: u16,
    slots_free: u32,

    /// Owner of each CPU thread, indexed 0..threads-1. `None` means free.
    cpu_owner: Vec<Option<TaskId>>,
    running_tasks: usize,
}

/// Panics on a resource-accounting invariant violation: per the error design
/// in the specification, this indicates a coordinator bug, not a user error.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            panic!($($arg)*);
        }
    };
}

impl Host {
    pub fn new(name: impl Into<String>, memory: u32, threads: u16, cores: u16, sockets: u16) -> Self {
        Host {
            name: name.into(),
            memory,
            threads,
            cores,
            sockets,
            slots: 0,
            memory_free: memory,
            cpus_free: threads,
            slots_free: 0,
            cpu_owner: vec![None; threads as usize],
            running_tasks: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> u16 {
        self.threads
    }

    pub fn cores(&self) -> u16 {
        self.cores
    }

    pub fn sockets(&self) -> u16 {
        self.sockets
    }

    pub fn memory(&self) -> u32 {
        self.memory
    }

    pub fn memory_free(&self) -> u32 {
        self.memory_free
    }

    pub fn cpus_free(&self) -> u16 {
        self.cpus_free
    }

    pub fn slots_free(&self) -> u32 {
        self.slots_free
    }

    pub fn running_tasks(&self) -> usize {
        self.running_tasks
    }

    /// Load factor used by the placement policy: used-cpus / threads.
    pub fn load_factor(&self) -> f64 {
        if self.threads == 0 {
            return 1.0;
        }
        let used = self.threads - self.cpus_free;
        used as f64 / self.threads as f64
    }

    /// Register one worker slot on this host. Called once per Registration.
    pub fn add_slot(&mut self) {
        self.slots += 1;
        self.slots_free += 1;
    }

    /// Whether this host could ever run a task with these requirements,
    /// ignoring current load (used for infeasibility detection).
    pub fn could_ever_run(&self, memory: u32, cpus: u16) -> bool {
        memory <= self.memory && cpus <= self.threads && self.slots > 0
    }

    /// Whether the host can run the task right now.
    pub fn can_run(&self, memory: u32, cpus: u16) -> bool {
        self.memory_free >= memory && self.cpus_free >= cpus && self.slots_free >= 1
    }

    /// Claim `cpus` thread indices for `task`, scanning 0..threads in order
    /// and taking the first free ones. Panics if the host cannot satisfy the
    /// request -- callers must check [`Host::can_run`] first.
    pub fn allocate_resources(&mut self, task: TaskId, memory: u32, cpus: u16) -> Vec<CpuIndex> {
        invariant!(
            self.can_run(memory, cpus),
            "allocate_resources called on host {} that cannot satisfy memory={} cpus={}",
            self.name,
            memory,
            cpus
        );

        let mut bindings = Vec::with_capacity(cpus as usize);
        for (idx, owner) in self.cpu_owner.iter_mut().enumerate() {
            if bindings.len() == cpus as usize {
                break;
            }
            if owner.is_none() {
                *owner = Some(task);
                bindings.push(idx as CpuIndex);
            }
        }

        invariant!(
            bindings.len() == cpus as usize,
            "host {} claimed {} of {} requested cpus",
            self.name,
            bindings.len(),
            cpus
        );

        self.memory_free -= memory;
        self.cpus_free -= cpus;
        self.slots_free -= 1;
        self.running_tasks += 1;
        bindings
    }

    /// Release the resources held by `task`, given the exact binding and
    /// memory it was allocated. This is the precise inverse of
    /// [`Host::allocate_resources`].
    pub fn release_resources(&mut self, task: TaskId, memory: u32, bindings: &[CpuIndex]) {
        for &idx in bindings {
            let owner = self.cpu_owner.get_mut(idx as usize).unwrap_or_else(|| {
                panic!(
                    "host {} release_resources: cpu index {} out of range",
                    self.name, idx
                )
            });
            invariant!(
                *owner == Some(task),
                "host {} release_resources: cpu index {} not owned by releasing task",
                self.name,
                idx
            );
            *owner = None;
        }

        self.memory_free = self.memory_free.checked_add(memory).unwrap_or_else(|| {
            panic!(
                "host {} release_resources: memory_free overflow releasing {} MiB",
                self.name, memory
            )
        });
        invariant!(
            self.memory_free <= self.memory,
            "host {} release_resources: memory_free {} exceeds total {}",
            self.name,
            self.memory_free,
            self.memory
        );

        self.cpus_free += bindings.len() as u16;
        invariant!(
            self.cpus_free <= self.threads,
            "host {} release_resources: cpus_free {} exceeds threads {}",
            self.name,
            self.cpus_free,
            self.threads
        );

        self.slots_free += 1;
        self.running_tasks -= 1;
    }
}

/// A (worker-rank, host) pair: the atom of placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

#[derive(Debug)]
pub struct Slot {
    pub id: SlotId,
    /// Host-local rank, 0-based, stable by registration order within the host.
    pub rank: u32,
    pub host: String,
}

/// Live binding of a task to the slot and host resources it is occupying,
/// kept so [`release_resources`](Host::release_resources) can be called
/// with the exact allocation it needs to invert.
#[derive(Debug, Clone)]
pub struct Binding {
    pub slot: SlotId,
    pub host: String,
    pub memory: u32,
    pub cpus: Vec<CpuIndex>,
}

/// Owns every registered host and slot and implements the placement policy
/// of choosing which free slot should receive a ready task.
#[derive(Debug, Default)]
pub struct ResourcePool {
    hosts: HashMap<String, Host>,
    slots: Vec<Slot>,
    free_slots: Vec<SlotId>,
    next_slot_id: u32,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host on first sight, or return the existing one.
    pub fn host_or_insert(
        &mut self,
        name: &str,
        memory: u32,
        threads: u16,
        cores: u16,
        sockets: u16,
    ) -> &mut Host {
        self.hosts
            .entry(name.to_string())
            .or_insert_with(|| Host::new(name, memory, threads, cores, sockets))
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn max_threads(&self) -> u16 {
        self.hosts.values().map(Host::threads).max().unwrap_or(0)
    }

    /// Add a new slot on `host`, returning its id and host-local rank.
    pub fn add_slot(&mut self, host: &str) -> (SlotId, u32) {
        let rank = self
            .slots
            .iter()
            .filter(|s| s.host == host)
            .count() as u32;
        let id = SlotId(self.next_slot_id);
        self.next_slot_id += 1;
        self.slots.push(Slot {
            id,
            rank,
            host: host.to_string(),
        });
        self.free_slots.push(id);
        if let Some(h) = self.hosts.get_mut(host) {
            h.add_slot();
        }
        (id, rank)
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        self.slots.iter().find(|s| s.id == id).expect("unknown slot id")
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }

    /// Whether any currently registered host could ever run a task with
    /// these requirements, regardless of current load. Used to detect
    /// infeasible tasks once registration has completed.
    pub fn any_host_could_run(&self, memory: u32, cpus: u16) -> bool {
        self.hosts.values().any(|h| h.could_ever_run(memory, cpus))
    }

    /// Find the best free slot for a task, bind it, and return the binding.
    ///
    /// Placement policy: among free slots whose host `can_run` the task,
    /// prefer the lowest host load factor, then fewest running tasks on the
    /// host, then lowest host name (lexicographic) to break remaining ties.
    pub fn try_place(&mut self, task: TaskId, memory: u32, cpus: u16) -> Option<Binding> {
        let mut best: Option<(usize, f64, usize, &str)> = None;

        for (idx, slot) in self.free_slots.iter().enumerate() {
            let slot_host = &self.slots.iter().find(|s| s.id == *slot).unwrap().host;
            let host = self.hosts.get(slot_host)?;
            if !host.can_run(memory, cpus) {
                continue;
            }
            let key = (host.load_factor(), host.running_tasks(), host.name());
            let better = match &best {
                None => true,
                Some((_, load, running, name)) => {
                    (key.0, key.1, key.2) < (*load, *running, *name)
                }
            };
            if better {
                best = Some((idx, key.0, key.1, key.2));
            }
        }

        let (free_idx, _, _, _) = best?;
        let slot_id = self.free_slots.remove(free_idx);
        let host_name = self.slots.iter().find(|s| s.id == slot_id).unwrap().host.clone();
        let host = self.hosts.get_mut(&host_name).expect("host vanished");
        let cpus_bound = host.allocate_resources(task, memory, cpus);

        Some(Binding {
            slot: slot_id,
            host: host_name,
            memory,
            cpus: cpus_bound,
        })
    }

    /// Invert a previous [`ResourcePool::try_place`]: free the slot and the
    /// resources it was holding.
    pub fn release(&mut self, task: TaskId, binding: &Binding) {
        let host = self
            .hosts
            .get_mut(&binding.host)
            .unwrap_or_else(|| panic!("release: unknown host {}", binding.host));
        host.release_resources(task, binding.memory, &binding.cpus);
        self.free_slots.push(binding.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_round_trip() {
        let mut host = Host::new("h1", 8192, 4, 2, 1);
        let t = TaskId::from_raw(0);
        assert!(host.can_run(1024, 2));
        host.add_slot();
        let bindings = host.allocate_resources(t, 1024, 2);
        assert_eq!(bindings, vec![0, 1]);
        assert_eq!(host.memory_free(), 7168);
        assert_eq!(host.cpus_free(), 2);
        assert_eq!(host.slots_free(), 0);

        host.release_resources(t, 1024, &bindings);
        assert_eq!(host.memory_free(), 8192);
        assert_eq!(host.cpus_free(), 4);
        assert_eq!(host.slots_free(), 1);
    }

    #[test]
    fn cpu_indices_claimed_lowest_first() {
        let mut host = Host::new("h1", 4096, 4, 2, 1);
        host.add_slot();
        host.add_slot();
        let t0 = TaskId::from_raw(0);
        let bindings0 = host.allocate_resources(t0, 0, 1);
        assert_eq!(bindings0, vec![0]);
        let t1 = TaskId::from_raw(1);
        let bindings1 = host.allocate_resources(t1, 0, 2);
        assert_eq!(bindings1, vec![1, 2]);
    }

    #[test]
    fn cannot_run_when_out_of_memory() {
        let mut host = Host::new("h1", 1024, 4, 2, 1);
        host.add_slot();
        assert!(!host.can_run(2048, 1));
    }

    #[test]
    #[should_panic(expected = "not owned by releasing task")]
    fn release_wrong_owner_panics() {
        let mut host = Host::new("h1", 4096, 2, 1, 1);
        host.add_slot();
        let t0 = TaskId::from_raw(0);
        let bindings = host.allocate_resources(t0, 0, 1);
        let t1 = TaskId::from_raw(1);
        host.release_resources(t1, 0, &bindings);
    }

    #[test]
    fn placement_prefers_lowest_load_factor() {
        let mut pool = ResourcePool::new();
        pool.host_or_insert("busy", 4096, 4, 2, 1);
        pool.host_or_insert("idle", 4096, 4, 2, 1);
        pool.add_slot("busy");
        pool.add_slot("idle");

        // Load "busy" up first.
        let busy_task = TaskId::from_raw(0);
        let binding = pool.try_place(busy_task, 0, 3).unwrap();
        assert_eq!(binding.host, "busy");

        // Register a second slot on busy so it still has a free slot, but a
        // higher load factor than idle.
        pool.add_slot("busy");
        let next_task = TaskId::from_raw(1);
        let binding2 = pool.try_place(next_task, 0, 1).unwrap();
        assert_eq!(binding2.host, "idle");
    }

    #[test]
    fn try_place_returns_none_when_infeasible() {
        let mut pool = ResourcePool::new();
        pool.host_or_insert("h1", 4096, 2, 1, 1);
        pool.add_slot("h1");
        let t = TaskId::from_raw(0);
        assert!(pool.try_place(t, 0, 4).is_none());
        assert!(!pool.any_host_could_run(0, 4));
    }
}
