//! In-process substrate double for machine-level tests. Records memory
//! mappings, register loads and interrupt requests; vCPUs run a scripted
//! sequence of outcomes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::{
    Hypervisor, InterruptRequest, IoHandler, Partition, Register, RegisterValue, Result,
    RunOutcome, Vcpu,
};

#[derive(Default)]
pub struct FakeState {
    pub mappings: Vec<(u64, u64)>,
    pub interrupts: Vec<InterruptRequest>,
    pub cancelled: Vec<u32>,
    pub register_loads: Vec<(u32, Vec<(Register, RegisterValue)>)>,
    pub scripted_outcomes: VecDeque<RunOutcome>,
}

#[derive(Clone, Default)]
pub struct FakeHypervisor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<Mutex<FakeState>> {
        self.state.clone()
    }

    /// Outcomes handed to vCPU `run_once` calls, in order; when exhausted
    /// every run returns `Shutdown` so VM run loops terminate.
    pub fn script_outcomes(&self, outcomes: impl IntoIterator<Item = RunOutcome>) {
        self.state
            .lock()
            .unwrap()
            .scripted_outcomes
            .extend(outcomes);
    }
}

impl Hypervisor for FakeHypervisor {
    fn is_present(&self) -> bool {
        true
    }

    fn create_partition(&self, _cpu_count: u32) -> Result<Arc<dyn Partition>> {
        Ok(Arc::new(FakePartition { state: self.state.clone() }))
    }
}

pub struct FakePartition {
    state: Arc<Mutex<FakeState>>,
}

impl Partition for FakePartition {
    fn map_memory(&self, gpa: u64, _hva: *mut u8, len: u64) -> Result<()> {
        self.state.lock().unwrap().mappings.push((gpa, len));
        Ok(())
    }

    fn create_vcpu(&self, index: u32, handler: Arc<dyn IoHandler>) -> Result<Box<dyn Vcpu>> {
        let _ = handler;
        Ok(Box::new(FakeVcpu { index, state: self.state.clone() }))
    }

    fn request_interrupt(&self, request: InterruptRequest) -> Result<()> {
        self.state.lock().unwrap().interrupts.push(request);
        Ok(())
    }

    fn cancel_run(&self, index: u32) {
        self.state.lock().unwrap().cancelled.push(index);
    }
}

struct FakeVcpu {
    index: u32,
    state: Arc<Mutex<FakeState>>,
}

impl Vcpu for FakeVcpu {
    fn index(&self) -> u32 {
        self.index
    }

    fn run_once(&mut self) -> RunOutcome {
        self.state
            .lock()
            .unwrap()
            .scripted_outcomes
            .pop_front()
            .unwrap_or(RunOutcome::Shutdown)
    }

    fn set_registers(&mut self, regs: &[(Register, RegisterValue)]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .register_loads
            .push((self.index, regs.to_vec()));
        Ok(())
    }
}
