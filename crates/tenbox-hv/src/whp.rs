//! Windows Hypervisor Platform adapter. The only module that speaks the
//! vendor API: partition properties, GPA mapping, vCPU execution and the
//! instruction-emulator callbacks that route PIO/MMIO exits into the
//! VM's address space.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use windows_sys::Win32::System::Hypervisor::*;

use crate::{
    DestinationMode, Hypervisor, HvError, InterruptRequest, IoHandler, Partition, Register,
    RegisterValue, Result, RunOutcome, TriggerMode, Vcpu,
};

pub struct WhpHypervisor;

impl WhpHypervisor {
    pub fn new() -> Self {
        WhpHypervisor
    }
}

impl Default for WhpHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for WhpHypervisor {
    fn is_present(&self) -> bool {
        let mut capability = WHV_CAPABILITY { HypervisorPresent: 0 };
        let mut written = 0u32;
        let hr = unsafe {
            WHvGetCapability(
                WHvCapabilityCodeHypervisorPresent,
                &mut capability as *mut _ as *mut _,
                std::mem::size_of::<WHV_CAPABILITY>() as u32,
                &mut written,
            )
        };
        hr >= 0 && unsafe { capability.HypervisorPresent } != 0
    }

    fn create_partition(&self, cpu_count: u32) -> Result<Arc<dyn Partition>> {
        if !self.is_present() {
            return Err(HvError::NotAvailable);
        }
        WhpPartition::create(cpu_count).map(|p| p as Arc<dyn Partition>)
    }
}

fn hr_err(context: &str, hr: i32) -> HvError {
    HvError::PartitionSetup(format!("{context}: {hr:#010x}"))
}

pub struct WhpPartition {
    handle: WHV_PARTITION_HANDLE,
}

// The partition handle is a kernel object; WHP calls on it are
// thread-safe.
unsafe impl Send for WhpPartition {}
unsafe impl Sync for WhpPartition {}

impl WhpPartition {
    fn create(cpu_count: u32) -> Result<Arc<WhpPartition>> {
        let mut handle: WHV_PARTITION_HANDLE = std::ptr::null_mut();
        let hr = unsafe { WHvCreatePartition(&mut handle) };
        if hr < 0 {
            return Err(hr_err("WHvCreatePartition", hr));
        }
        let partition = WhpPartition { handle };

        partition.set_property_u32(WHvPartitionPropertyCodeProcessorCount, cpu_count)?;

        // xAPIC emulation so the substrate owns the local APICs.
        if let Err(e) = partition.set_property_u32(
            WHvPartitionPropertyCodeLocalApicEmulationMode,
            WHvX64LocalApicEmulationModeXApic as u32,
        ) {
            warn!(error = %e, "local APIC emulation not available");
        }

        partition.apply_cpuid_overrides();

        let hr = unsafe { WHvSetupPartition(partition.handle) };
        if hr < 0 {
            return Err(hr_err("WHvSetupPartition", hr));
        }
        info!(cpu_count, "WHP partition created");
        Ok(Arc::new(partition))
    }

    fn set_property_u32(&self, code: WHV_PARTITION_PROPERTY_CODE, value: u32) -> Result<()> {
        let hr = unsafe {
            WHvSetPartitionProperty(
                self.handle,
                code,
                &value as *const u32 as *const _,
                std::mem::size_of::<u32>() as u32,
            )
        };
        if hr < 0 {
            return Err(hr_err("WHvSetPartitionProperty", hr));
        }
        Ok(())
    }

    /// CPUID result overrides: leaf 0x15 exposes the TSC frequency so the
    /// guest skips PIT calibration; leaf 1 masks MONITOR/MWAIT and
    /// TSC-deadline, which WHP cannot deliver.
    fn apply_cpuid_overrides(&self) {
        let mut overrides: Vec<WHV_X64_CPUID_RESULT> = Vec::new();

        #[cfg(target_arch = "x86_64")]
        {
            let leaf15 = unsafe { std::arch::x86_64::__cpuid(0x15) };
            if leaf15.eax != 0 && leaf15.ebx != 0 {
                let crystal = if leaf15.ecx != 0 { leaf15.ecx } else { 38_400_000 };
                let mut result: WHV_X64_CPUID_RESULT = unsafe { std::mem::zeroed() };
                result.Function = 0x15;
                result.Eax = leaf15.eax;
                result.Ebx = leaf15.ebx;
                result.Ecx = crystal;
                overrides.push(result);
            }

            let leaf1 = unsafe { std::arch::x86_64::__cpuid_count(1, 0) };
            const MASK_OUT_ECX: u32 = (1 << 3) | (1 << 24); // MWAIT, TSC-deadline
            let mut result: WHV_X64_CPUID_RESULT = unsafe { std::mem::zeroed() };
            result.Function = 1;
            result.Eax = leaf1.eax;
            result.Ebx = leaf1.ebx;
            result.Ecx = leaf1.ecx & !MASK_OUT_ECX;
            result.Edx = leaf1.edx;
            overrides.push(result);
        }

        if overrides.is_empty() {
            return;
        }
        let hr = unsafe {
            WHvSetPartitionProperty(
                self.handle,
                WHvPartitionPropertyCodeCpuidResultList,
                overrides.as_ptr() as *const _,
                (overrides.len() * std::mem::size_of::<WHV_X64_CPUID_RESULT>()) as u32,
            )
        };
        if hr < 0 {
            warn!(hr, "CPUID override list rejected");
        }
    }
}

impl Drop for WhpPartition {
    fn drop(&mut self) {
        unsafe { WHvDeletePartition(self.handle) };
    }
}

impl Partition for WhpPartition {
    fn map_memory(&self, gpa: u64, hva: *mut u8, len: u64) -> Result<()> {
        let flags = WHvMapGpaRangeFlagRead | WHvMapGpaRangeFlagWrite | WHvMapGpaRangeFlagExecute;
        let hr = unsafe { WHvMapGpaRange(self.handle, hva as *mut _, gpa, len, flags) };
        if hr < 0 {
            return Err(HvError::MemoryMap(format!(
                "WHvMapGpaRange gpa={gpa:#x} len={len:#x}: {hr:#010x}"
            )));
        }
        Ok(())
    }

    fn create_vcpu(&self, index: u32, handler: Arc<dyn IoHandler>) -> Result<Box<dyn Vcpu>> {
        let hr = unsafe { WHvCreateVirtualProcessor(self.handle, index, 0) };
        if hr < 0 {
            return Err(HvError::Vcpu(format!("WHvCreateVirtualProcessor({index}): {hr:#010x}")));
        }
        WhpVcpu::new(self.handle, index, handler).map(|v| Box::new(v) as Box<dyn Vcpu>)
    }

    fn request_interrupt(&self, request: InterruptRequest) -> Result<()> {
        let mut control: WHV_INTERRUPT_CONTROL = unsafe { std::mem::zeroed() };
        // Bitfield: Type (8) | DestinationMode (4) | TriggerMode (4).
        let mut packed: u64 = WHvX64InterruptTypeFixed as u64;
        if request.destination_mode == DestinationMode::Logical {
            packed |= 1 << 8;
        }
        if request.trigger_mode == TriggerMode::Level {
            packed |= 1 << 12;
        }
        control.Anonymous._bitfield = packed;
        control.Destination = request.destination;
        control.Vector = u32::from(request.vector);

        let hr = unsafe {
            WHvRequestInterrupt(
                self.handle,
                &control,
                std::mem::size_of::<WHV_INTERRUPT_CONTROL>() as u32,
            )
        };
        if hr < 0 {
            return Err(HvError::Vcpu(format!("WHvRequestInterrupt: {hr:#010x}")));
        }
        Ok(())
    }

    fn cancel_run(&self, index: u32) {
        unsafe { WHvCancelRunVirtualProcessor(self.handle, index, 0) };
    }
}

/// Per-vCPU emulator context handed to the WHP emulator callbacks.
struct VcpuContext {
    partition: WHV_PARTITION_HANDLE,
    index: u32,
    handler: Arc<dyn IoHandler>,
}

pub struct WhpVcpu {
    context: Box<VcpuContext>,
    emulator: *mut core::ffi::c_void,
}

unsafe impl Send for WhpVcpu {}

impl WhpVcpu {
    fn new(
        partition: WHV_PARTITION_HANDLE,
        index: u32,
        handler: Arc<dyn IoHandler>,
    ) -> Result<WhpVcpu> {
        let context = Box::new(VcpuContext { partition, index, handler });

        let callbacks = WHV_EMULATOR_CALLBACKS {
            Size: std::mem::size_of::<WHV_EMULATOR_CALLBACKS>() as u32,
            Reserved: 0,
            WHvEmulatorIoPortCallback: Some(io_port_callback),
            WHvEmulatorMemoryCallback: Some(memory_callback),
            WHvEmulatorGetVirtualProcessorRegisters: Some(get_registers_callback),
            WHvEmulatorSetVirtualProcessorRegisters: Some(set_registers_callback),
            WHvEmulatorTranslateGvaPage: Some(translate_gva_callback),
        };
        let mut emulator = std::ptr::null_mut();
        let hr = unsafe { WHvEmulatorCreateEmulator(&callbacks, &mut emulator) };
        if hr < 0 {
            return Err(HvError::Vcpu(format!("WHvEmulatorCreateEmulator: {hr:#010x}")));
        }
        Ok(WhpVcpu { context, emulator })
    }

    fn context_ptr(&self) -> *mut core::ffi::c_void {
        &*self.context as *const VcpuContext as *mut core::ffi::c_void
    }

    fn advance_rip(&self, exit: &WHV_RUN_VP_EXIT_CONTEXT) {
        let rip = unsafe { exit.VpContext.Rip } + u64::from(exit.VpContext.InstructionLength());
        let _ = self.set_registers(&[(Register::Rip, RegisterValue::U64(rip))]);
    }

    fn set_registers(&self, regs: &[(Register, RegisterValue)]) -> Result<()> {
        set_vp_registers(self.context.partition, self.context.index, regs)
    }
}

impl Drop for WhpVcpu {
    fn drop(&mut self) {
        unsafe {
            WHvEmulatorDestroyEmulator(self.emulator);
            WHvDeleteVirtualProcessor(self.context.partition, self.context.index);
        }
    }
}

impl Vcpu for WhpVcpu {
    fn index(&self) -> u32 {
        self.context.index
    }

    fn run_once(&mut self) -> RunOutcome {
        let mut exit: WHV_RUN_VP_EXIT_CONTEXT = unsafe { std::mem::zeroed() };
        let hr = unsafe {
            WHvRunVirtualProcessor(
                self.context.partition,
                self.context.index,
                &mut exit as *mut _ as *mut _,
                std::mem::size_of::<WHV_RUN_VP_EXIT_CONTEXT>() as u32,
            )
        };
        if hr < 0 {
            error!(hr, "WHvRunVirtualProcessor failed");
            return RunOutcome::Error;
        }

        match exit.ExitReason {
            WHvRunVpExitReasonX64IoPortAccess => {
                let mut status: WHV_EMULATOR_STATUS = unsafe { std::mem::zeroed() };
                let hr = unsafe {
                    WHvEmulatorTryIoEmulation(
                        self.emulator,
                        self.context_ptr(),
                        &exit.VpContext,
                        &exit.Anonymous.IoPortAccess,
                        &mut status,
                    )
                };
                if hr < 0 || unsafe { status.Anonymous.AsUINT32 } & 1 == 0 {
                    warn!("PIO emulation failed, skipping instruction");
                    self.advance_rip(&exit);
                }
                RunOutcome::Continue
            }
            WHvRunVpExitReasonMemoryAccess => {
                let mut status: WHV_EMULATOR_STATUS = unsafe { std::mem::zeroed() };
                let hr = unsafe {
                    WHvEmulatorTryMmioEmulation(
                        self.emulator,
                        self.context_ptr(),
                        &exit.VpContext,
                        &exit.Anonymous.MemoryAccess,
                        &mut status,
                    )
                };
                if hr < 0 || unsafe { status.Anonymous.AsUINT32 } & 1 == 0 {
                    warn!("MMIO emulation failed, skipping instruction");
                    self.advance_rip(&exit);
                }
                RunOutcome::Continue
            }
            WHvRunVpExitReasonX64Halt => RunOutcome::Halt,
            WHvRunVpExitReasonCanceled => RunOutcome::Continue,
            WHvRunVpExitReasonX64ApicEoi => RunOutcome::Continue,
            WHvRunVpExitReasonX64InterruptWindow => RunOutcome::Continue,
            WHvRunVpExitReasonUnsupportedFeature => {
                warn!(
                    rip = format_args!("{:#x}", unsafe { exit.VpContext.Rip }),
                    "unsupported feature exit"
                );
                RunOutcome::Continue
            }
            WHvRunVpExitReasonX64Cpuid => {
                // Load the substrate's default result and step past it.
                let cpuid = unsafe { &exit.Anonymous.CpuidAccess };
                let rip =
                    unsafe { exit.VpContext.Rip } + u64::from(exit.VpContext.InstructionLength());
                let _ = self.set_registers(&[
                    (Register::Rax, RegisterValue::U64(cpuid.DefaultResultRax)),
                    (Register::Rbx, RegisterValue::U64(cpuid.DefaultResultRbx)),
                    (Register::Rcx, RegisterValue::U64(cpuid.DefaultResultRcx)),
                    (Register::Rdx, RegisterValue::U64(cpuid.DefaultResultRdx)),
                    (Register::Rip, RegisterValue::U64(rip)),
                ]);
                RunOutcome::Continue
            }
            WHvRunVpExitReasonX64MsrAccess => {
                let msr = unsafe { &exit.Anonymous.MsrAccess };
                let rip =
                    unsafe { exit.VpContext.Rip } + u64::from(exit.VpContext.InstructionLength());
                if msr.AccessInfo.IsWrite() == 0 {
                    debug!(msr = format_args!("{:#x}", msr.MsrNumber), "MSR read -> 0");
                    let _ = self.set_registers(&[
                        (Register::Rax, RegisterValue::U64(0)),
                        (Register::Rdx, RegisterValue::U64(0)),
                        (Register::Rip, RegisterValue::U64(rip)),
                    ]);
                } else {
                    debug!(msr = format_args!("{:#x}", msr.MsrNumber), "MSR write discarded");
                    let _ = self.set_registers(&[(Register::Rip, RegisterValue::U64(rip))]);
                }
                RunOutcome::Continue
            }
            WHvRunVpExitReasonUnrecoverableException => {
                error!(
                    rip = format_args!("{:#x}", unsafe { exit.VpContext.Rip }),
                    "unrecoverable guest exception"
                );
                RunOutcome::Error
            }
            WHvRunVpExitReasonInvalidVpRegisterValue => {
                error!("invalid VP register state");
                RunOutcome::Error
            }
            other => {
                warn!(reason = other, "unhandled VM exit reason");
                RunOutcome::Error
            }
        }
    }

    fn set_registers(&mut self, regs: &[(Register, RegisterValue)]) -> Result<()> {
        set_vp_registers(self.context.partition, self.context.index, regs)
    }
}

fn whp_register_name(reg: Register) -> WHV_REGISTER_NAME {
    match reg {
        Register::Rax => WHvX64RegisterRax,
        Register::Rbx => WHvX64RegisterRbx,
        Register::Rcx => WHvX64RegisterRcx,
        Register::Rdx => WHvX64RegisterRdx,
        Register::Rsi => WHvX64RegisterRsi,
        Register::Rdi => WHvX64RegisterRdi,
        Register::Rbp => WHvX64RegisterRbp,
        Register::Rsp => WHvX64RegisterRsp,
        Register::Rip => WHvX64RegisterRip,
        Register::Rflags => WHvX64RegisterRflags,
        Register::Cr0 => WHvX64RegisterCr0,
        Register::Cr3 => WHvX64RegisterCr3,
        Register::Cr4 => WHvX64RegisterCr4,
        Register::Efer => WHvX64RegisterEfer,
        Register::Cs => WHvX64RegisterCs,
        Register::Ds => WHvX64RegisterDs,
        Register::Es => WHvX64RegisterEs,
        Register::Fs => WHvX64RegisterFs,
        Register::Gs => WHvX64RegisterGs,
        Register::Ss => WHvX64RegisterSs,
        Register::Tr => WHvX64RegisterTr,
        Register::Ldtr => WHvX64RegisterLdtr,
        Register::Gdtr => WHvX64RegisterGdtr,
        Register::Idtr => WHvX64RegisterIdtr,
    }
}

fn whp_register_value(value: RegisterValue) -> WHV_REGISTER_VALUE {
    let mut out: WHV_REGISTER_VALUE = unsafe { std::mem::zeroed() };
    match value {
        RegisterValue::U64(v) => out.Reg64 = v,
        RegisterValue::Segment(seg) => {
            out.Segment.Base = seg.base;
            out.Segment.Limit = seg.limit;
            out.Segment.Selector = seg.selector;
            out.Segment.Anonymous.Attributes = seg.attributes;
        }
        RegisterValue::Table(table) => {
            out.Table.Base = table.base;
            out.Table.Limit = table.limit;
        }
    }
    out
}

fn set_vp_registers(
    partition: WHV_PARTITION_HANDLE,
    index: u32,
    regs: &[(Register, RegisterValue)],
) -> Result<()> {
    let names: Vec<WHV_REGISTER_NAME> = regs.iter().map(|(r, _)| whp_register_name(*r)).collect();
    let values: Vec<WHV_REGISTER_VALUE> =
        regs.iter().map(|(_, v)| whp_register_value(*v)).collect();
    let hr = unsafe {
        WHvSetVirtualProcessorRegisters(
            partition,
            index,
            names.as_ptr(),
            names.len() as u32,
            values.as_ptr(),
        )
    };
    if hr < 0 {
        return Err(HvError::Vcpu(format!("WHvSetVirtualProcessorRegisters: {hr:#010x}")));
    }
    Ok(())
}

// --- emulator callbacks -------------------------------------------------

unsafe extern "system" fn io_port_callback(
    context: *const core::ffi::c_void,
    io: *mut WHV_EMULATOR_IO_ACCESS_INFO,
) -> i32 {
    let ctx = &*(context as *const VcpuContext);
    let io = &mut *io;
    if io.Direction == 0 {
        io.Data = ctx.handler.pio_read(io.Port, io.AccessSize);
    } else {
        ctx.handler.pio_write(io.Port, io.AccessSize, io.Data);
    }
    0
}

unsafe extern "system" fn memory_callback(
    context: *const core::ffi::c_void,
    memory: *mut WHV_EMULATOR_MEMORY_ACCESS_INFO,
) -> i32 {
    let ctx = &*(context as *const VcpuContext);
    let memory = &mut *memory;
    let size = memory.AccessSize;
    if memory.Direction == 0 {
        let value = ctx.handler.mmio_read(memory.GpaAddress, size);
        memory.Data[..usize::from(size)].copy_from_slice(&value.to_le_bytes()[..usize::from(size)]);
    } else {
        let mut raw = [0u8; 8];
        raw[..usize::from(size)].copy_from_slice(&memory.Data[..usize::from(size)]);
        ctx.handler
            .mmio_write(memory.GpaAddress, size, u64::from_le_bytes(raw));
    }
    0
}

unsafe extern "system" fn get_registers_callback(
    context: *const core::ffi::c_void,
    names: *const WHV_REGISTER_NAME,
    count: u32,
    values: *mut WHV_REGISTER_VALUE,
) -> i32 {
    let ctx = &*(context as *const VcpuContext);
    WHvGetVirtualProcessorRegisters(ctx.partition, ctx.index, names, count, values)
}

unsafe extern "system" fn set_registers_callback(
    context: *const core::ffi::c_void,
    names: *const WHV_REGISTER_NAME,
    count: u32,
    values: *const WHV_REGISTER_VALUE,
) -> i32 {
    let ctx = &*(context as *const VcpuContext);
    WHvSetVirtualProcessorRegisters(ctx.partition, ctx.index, names, count, values)
}

unsafe extern "system" fn translate_gva_callback(
    context: *const core::ffi::c_void,
    gva: u64,
    translate_flags: i32,
    translation_result: *mut i32,
    gpa: *mut u64,
) -> i32 {
    let ctx = &*(context as *const VcpuContext);
    let mut result: WHV_TRANSLATE_GVA_RESULT = std::mem::zeroed();
    let hr = WHvTranslateGva(ctx.partition, ctx.index, gva, translate_flags, &mut result, gpa);
    if hr >= 0 {
        *translation_result = result.ResultCode;
    }
    hr
}
