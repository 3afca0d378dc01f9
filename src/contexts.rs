use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// A relocated device ELF image. The blob is opaque to the core (symbol and
/// line resolution are delegated to the host debugger); the code span is
/// kept so contexts can be looked up by code address.
#[derive(Clone)]
pub struct ElfImage {
    pub data: Arc<Vec<u8>>,
    pub code_start: u64,
    pub code_size: u64,
}

impl std::fmt::Debug for ElfImage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ElfImage")
            .field("len", &self.data.len())
            .field("code_start", &self.code_start)
            .field("code_size", &self.code_size)
            .finish()
    }
}

impl ElfImage {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.code_start && addr - self.code_start < self.code_size
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub id: u64,
    pub context_id: u64,
    pub image: ElfImage,
}

/// One driver context. Modules are kept in ELF-load order.
#[derive(Debug)]
pub struct Context {
    pub id: u64,
    pub dev_id: u32,
    pub modules: Vec<Module>,
}

impl Context {
    #[must_use]
    pub fn new(id: u64, dev_id: u32) -> Self {
        Self {
            id,
            dev_id,
            modules: Vec::new(),
        }
    }

    pub fn add_module(&mut self, module: Module) {
        self.modules.push(module);
    }

    #[must_use]
    pub fn find_module_by_id(&self, module_id: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == module_id)
    }

    #[must_use]
    pub fn find_module_by_code_address(&self, addr: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.image.contains(addr))
    }
}

/// The context set of one device, plus one context stack per host thread
/// (driver contexts are made current by push/pop on a CPU thread).
#[derive(Debug, Default)]
pub struct Contexts {
    list: IndexMap<u64, Context>,
    stacks: HashMap<u32, Vec<u64>>,
}

impl Contexts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, context: Context) {
        self.list.insert(context.id, context);
    }

    pub fn remove(&mut self, context_id: u64) -> Option<Context> {
        self.list.shift_remove(&context_id)
    }

    #[must_use]
    pub fn find_by_id(&self, context_id: u64) -> Option<&Context> {
        self.list.get(&context_id)
    }

    #[must_use]
    pub fn find_by_id_mut(&mut self, context_id: u64) -> Option<&mut Context> {
        self.list.get_mut(&context_id)
    }

    #[must_use]
    pub fn find_by_code_address(&self, addr: u64) -> Option<&Context> {
        self.list
            .values()
            .find(|c| c.find_module_by_code_address(addr).is_some())
    }

    /// Pushes `context_id` onto the context stack of host thread `tid`.
    pub fn stack(&mut self, context_id: u64, tid: u32) {
        self.stacks.entry(tid).or_default().push(context_id);
    }

    /// Pops the top context of host thread `tid`.
    pub fn unstack(&mut self, tid: u32) -> Option<u64> {
        self.stacks.get_mut(&tid).and_then(Vec::pop)
    }

    /// The context active on host thread `tid`, if any.
    #[must_use]
    pub fn active(&self, tid: u32) -> Option<u64> {
        self.stacks.get(&tid).and_then(|s| s.last()).copied()
    }

    #[must_use]
    pub fn any_present(&self) -> bool {
        !self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.list.values()
    }
}
