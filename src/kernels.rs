use crate::api::{KernelKind, KernelOrigin};
use crate::coords::Dim3;
use indexmap::IndexMap;

/// A launched grid. Back-references to its device, context and module are
/// ids resolved through the registries, never owning pointers.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub id: u64,
    pub dev_id: u32,
    pub grid_id: u64,
    pub context_id: u64,
    pub module_id: u64,
    /// Virtual base address of the kernel code.
    pub entry: u64,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub kind: KernelKind,
    pub origin: KernelOrigin,
    pub parent_grid_id: Option<u64>,
    pub alive: bool,
    /// Derived, cleared by [`Kernels::invalidate_device`]: whether any warp
    /// currently runs this grid. Recomputed through the state cache.
    pub(crate) present: Option<bool>,
}

impl Kernel {
    /// Launch configuration in the `<<<(gx,gy,gz),(bx,by,bz)>>>` notation.
    #[must_use]
    pub fn dimensions(&self) -> String {
        format!("<<<{},{}>>>", self.grid_dim, self.block_dim)
    }
}

/// Process-wide kernel registry, in launch order.
#[derive(Debug, Default)]
pub struct Kernels {
    next_id: u64,
    list: IndexMap<u64, Kernel>,
}

#[derive(Debug, Clone, Copy)]
pub struct KernelLaunch {
    pub dev_id: u32,
    pub grid_id: u64,
    pub entry: u64,
    pub context_id: u64,
    pub module_id: u64,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub kind: KernelKind,
    pub origin: KernelOrigin,
    pub parent_grid_id: Option<u64>,
}

impl Kernels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a launched grid and returns its kernel id. Re-registering
    /// a grid already alive on the device is a no-op.
    pub fn start(&mut self, launch: KernelLaunch) -> u64 {
        if let Some(kernel) = self.find_by_grid_id(launch.dev_id, launch.grid_id) {
            return kernel.id;
        }
        let id = self.next_id;
        self.next_id += 1;
        log::debug!(
            "kernel {id}: start grid {} on device {} entry 0x{:x}",
            launch.grid_id,
            launch.dev_id,
            launch.entry
        );
        self.list.insert(
            id,
            Kernel {
                id,
                dev_id: launch.dev_id,
                grid_id: launch.grid_id,
                context_id: launch.context_id,
                module_id: launch.module_id,
                entry: launch.entry,
                grid_dim: launch.grid_dim,
                block_dim: launch.block_dim,
                kind: launch.kind,
                origin: launch.origin,
                parent_grid_id: launch.parent_grid_id,
                alive: true,
                present: None,
            },
        );
        id
    }

    /// Marks the kernel of (device, grid) terminated. The entry stays in
    /// the registry so late lookups by id still resolve.
    pub fn terminate(&mut self, dev_id: u32, grid_id: u64) -> Option<u64> {
        let kernel = self
            .list
            .values_mut()
            .find(|k| k.dev_id == dev_id && k.grid_id == grid_id && k.alive)?;
        log::debug!("kernel {}: finished grid {grid_id} on device {dev_id}", kernel.id);
        kernel.alive = false;
        kernel.present = Some(false);
        Some(kernel.id)
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Kernel> {
        self.list.get(&id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Kernel> {
        self.list.get_mut(&id)
    }

    #[must_use]
    pub fn find_by_grid_id(&self, dev_id: u32, grid_id: u64) -> Option<&Kernel> {
        self.list
            .values()
            .find(|k| k.dev_id == dev_id && k.grid_id == grid_id && k.alive)
    }

    /// Clears the derived per-kernel caches of one device.
    pub fn invalidate_device(&mut self, dev_id: u32) {
        for kernel in self.list.values_mut().filter(|k| k.dev_id == dev_id) {
            kernel.present = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Kernel> {
        self.list.values()
    }

    #[must_use]
    pub fn num_alive_on(&self, dev_id: u32) -> usize {
        self.list
            .values()
            .filter(|k| k.dev_id == dev_id && k.alive)
            .count()
    }
}
