use crate::coords::Dim3;
use crate::events::Event;
use bitvec::BitArr;

/// Hard upper bounds on the per-device shape, mirroring the widths of the
/// hardware mask registers. Actual shapes are queried at runtime and must
/// fit under these.
pub const MAX_SMS_PER_DEVICE: usize = 64;
pub const MAX_WARPS_PER_SM: usize = 64;
pub const MAX_LANES_PER_WARP: usize = 32;

/// One bit per SM of a device.
pub type SmMask = BitArr!(for MAX_SMS_PER_DEVICE);
/// One bit per warp of an SM.
pub type WarpMask = BitArr!(for MAX_WARPS_PER_SM);
/// One bit per lane of a warp.
pub type LaneMask = BitArr!(for MAX_LANES_PER_WARP);

#[must_use]
pub fn warp_mask_bits(mask: &WarpMask) -> u64 {
    use bitvec::field::BitField;
    mask.as_bitslice().load_le::<u64>()
}

#[must_use]
pub fn lane_mask_bits(mask: &LaneMask) -> u32 {
    use bitvec::field::BitField;
    mask.as_bitslice()[..MAX_LANES_PER_WARP].load_le::<u32>()
}

#[must_use]
pub fn sm_mask_bits(mask: &SmMask) -> u64 {
    use bitvec::field::BitField;
    mask.as_bitslice().load_le::<u64>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionKind {
    #[default]
    None,
    IllegalInstruction,
    MisalignedAddress,
    IllegalAddress,
    InvalidPc,
    StackOverflow,
    HardwareError,
    Assert,
}

impl ExceptionKind {
    /// Only illegal-address exceptions carry a memcheck error address.
    #[must_use]
    pub fn has_error_address(&self) -> bool {
        matches!(self, ExceptionKind::IllegalAddress)
    }
}

impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ExceptionKind::None => "none",
            ExceptionKind::IllegalInstruction => "illegal instruction",
            ExceptionKind::MisalignedAddress => "misaligned address",
            ExceptionKind::IllegalAddress => "illegal address",
            ExceptionKind::InvalidPc => "invalid pc",
            ExceptionKind::StackOverflow => "stack overflow",
            ExceptionKind::HardwareError => "hardware error",
            ExceptionKind::Assert => "device assert",
        };
        write!(f, "{name}")
    }
}

/// Storage segment of a memcheck-reported error address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemorySegment {
    #[default]
    Unspecified,
    Global,
    Shared,
    Local,
    Const,
    Param,
}

/// Phases of the attach/detach handshake with a running accelerator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachState {
    #[default]
    NotStarted,
    InProgress,
    AppReady,
    Detaching,
    DetachComplete,
}

/// Everything the debug API reports about a launched grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridInfo {
    pub function_entry: u64,
    pub context_id: u64,
    pub module_id: u64,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub kind: KernelKind,
    pub parent_grid_id: Option<u64>,
    pub origin: KernelOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelKind {
    #[default]
    Application,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelOrigin {
    /// Launched from host code.
    #[default]
    Cpu,
    /// Launched from device code (dynamic parallelism).
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("debug API call failed (error={0})")]
    Code(u32),
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The narrow synchronous interface toward the accelerator debug API.
///
/// Every call either succeeds or returns a typed error; the state cache
/// ([`crate::state::System`]) is the only caller and turns a failure into
/// the termination of the current command. Implementations are free to talk
/// to an in-process driver or a remote stub; a remote transport should
/// return `true` from [`DebugApi::is_remote`] to enable the batched state
/// fetches.
pub trait DebugApi {
    // sizing
    fn num_devices(&mut self) -> ApiResult<u32>;
    fn num_sms(&mut self, dev: u32) -> ApiResult<u32>;
    fn num_warps(&mut self, dev: u32) -> ApiResult<u32>;
    fn num_lanes(&mut self, dev: u32) -> ApiResult<u32>;
    fn num_registers(&mut self, dev: u32) -> ApiResult<u32>;
    fn device_type(&mut self, dev: u32) -> ApiResult<String>;
    fn sm_type(&mut self, dev: u32) -> ApiResult<String>;

    // state reads
    fn valid_warps(&mut self, dev: u32, sm: u32) -> ApiResult<WarpMask>;
    fn broken_warps(&mut self, dev: u32, sm: u32) -> ApiResult<WarpMask>;
    fn valid_lanes(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<LaneMask>;
    fn active_lanes(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<LaneMask>;
    fn grid_id(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<u64>;
    fn block_idx(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<Dim3>;
    fn thread_idx(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<Dim3>;
    fn pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<u64>;
    fn virtual_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<u64>;
    fn lane_exception(&mut self, dev: u32, sm: u32, wp: u32, ln: u32)
        -> ApiResult<ExceptionKind>;
    fn register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32) -> ApiResult<u32>;
    fn call_depth(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<i32>;
    fn syscall_call_depth(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<i32>;
    fn virtual_return_address(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        level: i32,
    ) -> ApiResult<u64>;
    /// Mask of SMs on which at least one lane raised an exception.
    fn device_exception_state(&mut self, dev: u32) -> ApiResult<SmMask>;
    fn memcheck_error_address(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
    ) -> ApiResult<(u64, MemorySegment)>;
    fn grid_info(&mut self, dev: u32, grid_id: u64) -> ApiResult<GridInfo>;

    // control
    fn suspend_device(&mut self, dev: u32) -> ApiResult<()>;
    fn resume_device(&mut self, dev: u32) -> ApiResult<()>;
    /// Steps warp `wp` and returns the mask of warps that were actually
    /// stepped, which may be a strict superset of `{wp}`.
    fn single_step_warp(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<WarpMask>;

    // event drain
    fn next_sync_event(&mut self) -> ApiResult<Option<Event>>;
    fn next_async_event(&mut self) -> ApiResult<Option<Event>>;
    fn attach_state(&self) -> AttachState;
    fn set_attach_state(&mut self, state: AttachState);

    // batched fetches for remote transports
    fn is_remote(&self) -> bool {
        false
    }
    /// Block index of every valid warp of an SM, in one message.
    fn sm_block_indices(&mut self, _dev: u32, _sm: u32) -> ApiResult<Vec<(u32, Dim3)>> {
        Err(ApiError::Unsupported("sm_block_indices"))
    }
    /// Grid id of every valid warp of an SM, in one message.
    fn sm_grid_ids(&mut self, _dev: u32, _sm: u32) -> ApiResult<Vec<(u32, u64)>> {
        Err(ApiError::Unsupported("sm_grid_ids"))
    }
    /// Thread index of every valid lane of a warp, in one message.
    fn warp_thread_indices(
        &mut self,
        _dev: u32,
        _sm: u32,
        _wp: u32,
    ) -> ApiResult<Vec<(u32, Dim3)>> {
        Err(ApiError::Unsupported("warp_thread_indices"))
    }
}
