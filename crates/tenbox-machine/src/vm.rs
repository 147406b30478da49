use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tenbox_acpi::VirtioMmioSlot;
use tenbox_devices::{
    AcpiPm, CmosRtc, I8259Pic, IoApic, PciHostBridge, Pit8254, SystemControlB, TscClock, Uart16550,
};
use tenbox_firmware::{initial_boot_registers, load_linux, BootConfig};
use tenbox_hv::{
    DestinationMode, Hypervisor, InterruptRequest, IoHandler, Partition, RunOutcome, TriggerMode,
    Vcpu,
};
use tenbox_memory::{GuestMemory, MMIO_HOLE_END};
use tenbox_net_pump::{FrameSink, NetBackend, PortForward};
use tenbox_platform::ports::{AudioPort, ConsolePort, DisplayPort};
use tenbox_platform::{AddressSpace, IrqLine, IrqSink, PortSink};
use tenbox_storage::{DiskImage, VirtualDisk};
use tenbox_virtio::devices::blk::VirtioBlk;
use tenbox_virtio::devices::fs::VirtioFs;
use tenbox_virtio::devices::gpu::VirtioGpu;
use tenbox_virtio::devices::input::{
    InputKind, VirtioInput, ABS_AXIS_MAX, ABS_X, ABS_Y, BTN_LEFT, BTN_MIDDLE, BTN_RIGHT, EV_ABS,
    EV_KEY, EV_REL, EV_SYN, REL_WHEEL, SYN_REPORT,
};
use tenbox_virtio::devices::net::VirtioNet;
use tenbox_virtio::devices::serial::VirtioSerial;
use tenbox_virtio::devices::snd::VirtioSnd;
use tenbox_virtio::{VirtioDevice, VirtioMmio, VIRTIO_MMIO_SIZE};
use thiserror::Error;
use tracing::{error, info};

use crate::guest_agent::GuestAgent;

const VIRTIO_MMIO_BASE: u64 = 0xd000_0000;
const FIRST_VIRTIO_IRQ: u32 = 5;
const UART_IRQ: u32 = 4;
const SCI_IRQ: u32 = 9;
const DEFAULT_DISPLAY: (u32, u32) = (1024, 768);

#[derive(Debug, Error)]
pub enum VmError {
    #[error("hypervisor is not available on this host")]
    HypervisorMissing,
    #[error("substrate error: {0}")]
    Hv(#[from] tenbox_hv::HvError),
    #[error("boot failed: {0}")]
    Boot(#[from] tenbox_firmware::BootError),
    #[error("disk image: {0}")]
    Disk(#[from] tenbox_storage::DiskError),
    #[error("failed to read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("device registration failed: {0}")]
    AddressSpace(#[from] tenbox_platform::AddressSpaceError),
}

#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub tag: String,
    pub host_path: PathBuf,
    pub readonly: bool,
}

pub struct VmConfig {
    pub kernel_path: PathBuf,
    pub initrd_path: Option<PathBuf>,
    pub disk_path: Option<PathBuf>,
    pub cmdline: String,
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub net_link_up: bool,
    pub port_forwards: Vec<PortForward>,
    pub shares: Vec<ShareConfig>,
    pub console_port: Option<Arc<dyn ConsolePort>>,
    pub display_port: Option<Arc<dyn DisplayPort>>,
    pub audio_port: Option<Arc<dyn AudioPort>>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            kernel_path: PathBuf::new(),
            initrd_path: None,
            disk_path: None,
            cmdline: "console=ttyS0 earlyprintk=serial lapic no_timer_check tsc=reliable".into(),
            memory_mb: 256,
            cpu_count: 1,
            net_link_up: false,
            port_forwards: Vec::new(),
            shares: Vec::new(),
            console_port: None,
            display_port: None,
            audio_port: None,
        }
    }
}

/// Delivers device IRQs by consulting the I/O APIC redirection table and
/// forwarding to the substrate's local APICs.
struct ApicIrqSink {
    ioapic: Arc<Mutex<IoApic>>,
    partition: Arc<dyn Partition>,
}

impl IrqSink for ApicIrqSink {
    fn raise_irq(&self, irq: u32) {
        let Some(entry) = self.ioapic.lock().unwrap().redirection_entry(irq) else {
            return;
        };
        if entry >> 16 & 1 != 0 {
            return; // masked
        }
        let vector = (entry & 0xFF) as u8;
        if vector == 0 {
            return; // not programmed yet
        }
        let request = InterruptRequest {
            vector,
            destination: (entry >> 56) as u32,
            destination_mode: if entry >> 11 & 1 != 0 {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            trigger_mode: if entry >> 15 & 1 != 0 {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
        };
        let _ = self.partition.request_interrupt(request);
    }
}

/// Adapter: the substrate's emulation callbacks dispatch into the bus.
struct BusHandler {
    space: Arc<AddressSpace>,
}

impl IoHandler for BusHandler {
    fn pio_read(&self, port: u16, size: u8) -> u32 {
        self.space.pio_read(port, size)
    }

    fn pio_write(&self, port: u16, size: u8, value: u32) {
        self.space.pio_write(port, size, value)
    }

    fn mmio_read(&self, gpa: u64, size: u8) -> u64 {
        self.space.mmio_read(gpa, size)
    }

    fn mmio_write(&self, gpa: u64, size: u8, value: u64) {
        self.space.mmio_write(gpa, size, value)
    }
}

/// virtio-net's RX side as seen from the network pump.
struct NetFrameSink {
    net: Arc<Mutex<VirtioNet>>,
}

impl FrameSink for NetFrameSink {
    fn inject_frame(&self, frame: &[u8]) -> bool {
        self.net.lock().unwrap().inject_rx(frame)
    }
}

pub struct Vm {
    partition: Arc<dyn Partition>,
    #[allow(dead_code)]
    memory: GuestMemory,
    addr_space: Arc<AddressSpace>,
    cpu_count: u32,
    running: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
    reboot_requested: Arc<AtomicBool>,
    vcpus: Mutex<Vec<Box<dyn Vcpu>>>,
    console_port: Option<Arc<dyn ConsolePort>>,

    uart: Arc<Mutex<Uart16550>>,
    acpi_pm: Arc<Mutex<AcpiPm>>,
    irq_sink: Arc<ApicIrqSink>,

    net: Option<Arc<Mutex<VirtioNet>>>,
    net_backend: Option<Mutex<NetBackend>>,
    gpu: Option<Arc<Mutex<VirtioGpu>>>,
    keyboard: Option<Arc<Mutex<VirtioInput>>>,
    tablet: Option<Arc<Mutex<VirtioInput>>>,
    fs: Option<Arc<Mutex<VirtioFs>>>,
    agent: Option<Arc<GuestAgent>>,
}

struct VirtioSlots {
    slots: Vec<VirtioMmioSlot>,
}

impl VirtioSlots {
    fn new() -> Self {
        VirtioSlots { slots: Vec::new() }
    }

    fn next(&mut self) -> (u64, u32) {
        let index = self.slots.len() as u64;
        let base = VIRTIO_MMIO_BASE + index * VIRTIO_MMIO_SIZE;
        let irq = FIRST_VIRTIO_IRQ + index as u32;
        self.slots.push(VirtioMmioSlot { base, size: VIRTIO_MMIO_SIZE as u32, irq });
        (base, irq)
    }
}

impl Vm {
    pub fn create(config: VmConfig, hypervisor: Arc<dyn Hypervisor>) -> Result<Arc<Vm>, VmError> {
        if !hypervisor.is_present() {
            return Err(VmError::HypervisorMissing);
        }
        if config.memory_mb < 16 {
            return Err(VmError::Config("at least 16 MiB of guest RAM required"));
        }
        if config.cpu_count == 0 || config.cpu_count > 128 {
            return Err(VmError::Config("cpu count must be between 1 and 128"));
        }

        let partition = hypervisor.create_partition(config.cpu_count)?;

        // Guest RAM, split around the MMIO hole.
        let memory = GuestMemory::new(config.memory_mb << 20);
        partition.map_memory(0, memory.low_base_ptr(), memory.low_size())?;
        if memory.high_size() > 0 {
            partition.map_memory(MMIO_HOLE_END, memory.high_base_ptr(), memory.high_size())?;
        }
        info!(
            ram_mb = config.memory_mb,
            low = format_args!("{:#x}", memory.low_size()),
            high = format_args!("{:#x}", memory.high_size()),
            "guest RAM mapped"
        );
        let ram = memory.view();

        let running = Arc::new(AtomicBool::new(false));
        let reboot_requested = Arc::new(AtomicBool::new(false));

        // Legacy chipset.
        let ioapic = Arc::new(Mutex::new(IoApic::new()));
        let irq_sink = Arc::new(ApicIrqSink { ioapic: ioapic.clone(), partition: partition.clone() });

        let mut space = AddressSpace::new();

        let uart = Arc::new(Mutex::new(Uart16550::new()));
        {
            let mut uart = uart.lock().unwrap();
            uart.set_irq_line(IrqLine::new(UART_IRQ, irq_sink.clone()));
            if let Some(console) = config.console_port.clone() {
                uart.set_tx_callback(Box::new(move |byte| console.write(&[byte])));
            }
        }
        space.add_pio_device(Uart16550::COM1_BASE, Uart16550::REG_COUNT, uart.clone())?;

        let pit = Arc::new(Mutex::new(Pit8254::new(TscClock::measure())));
        space.add_pio_device(Pit8254::BASE_PORT, Pit8254::REG_COUNT, pit.clone())?;
        let sys_ctrl = Arc::new(Mutex::new(SystemControlB::new(pit)));
        space.add_pio_device(SystemControlB::PORT, SystemControlB::REG_COUNT, sys_ctrl)?;

        space.add_pio_device(
            CmosRtc::BASE_PORT,
            CmosRtc::REG_COUNT,
            Arc::new(Mutex::new(CmosRtc::new())),
        )?;

        let acpi_pm = Arc::new(Mutex::new(AcpiPm::new()));
        {
            let mut pm = acpi_pm.lock().unwrap();
            pm.set_sci_line(IrqLine::new(SCI_IRQ, irq_sink.clone()));
            let running = running.clone();
            let partition = partition.clone();
            let cpu_count = config.cpu_count;
            pm.set_shutdown_callback(Box::new(move || {
                info!("guest requested S5 power-off");
                running.store(false, Ordering::SeqCst);
                for cpu in 0..cpu_count {
                    partition.cancel_run(cpu);
                }
            }));
        }
        space.add_pio_device(AcpiPm::BASE_PORT, AcpiPm::REG_COUNT, acpi_pm.clone())?;

        space.add_mmio_device(IoApic::BASE_ADDRESS, IoApic::SIZE, ioapic.clone())?;

        space.add_pio_device(
            I8259Pic::MASTER_BASE,
            I8259Pic::REG_COUNT,
            Arc::new(Mutex::new(I8259Pic)),
        )?;
        space.add_pio_device(
            I8259Pic::SLAVE_BASE,
            I8259Pic::REG_COUNT,
            Arc::new(Mutex::new(I8259Pic)),
        )?;
        space.add_pio_device(
            PciHostBridge::BASE_PORT,
            PciHostBridge::REG_COUNT,
            Arc::new(Mutex::new(PciHostBridge::default())),
        )?;

        // Harmless legacy ports the guest probes: POST, DMA page, the
        // secondary COM ranges and the PCI mechanism-#2 data window.
        for (base, size) in [(0x80u16, 1u16), (0x87, 1), (0x2E8, 8), (0x2F8, 8), (0x3E8, 8), (0xC000, 0x1000)]
        {
            space.add_pio_device(base, size, Arc::new(Mutex::new(PortSink)))?;
        }

        // Virtio devices: fixed stride windows, IRQ 5 + index.
        let mut slots = VirtioSlots::new();
        let mut attach = |space: &mut AddressSpace,
                          slots: &mut VirtioSlots,
                          device: Arc<Mutex<dyn VirtioDevice>>|
         -> Result<(), VmError> {
            let (base, irq) = slots.next();
            let mmio = VirtioMmio::new(device, ram.clone(), IrqLine::new(irq, irq_sink.clone()));
            space.add_mmio_device(base, VIRTIO_MMIO_SIZE, Arc::new(Mutex::new(mmio)))?;
            Ok(())
        };

        if let Some(disk_path) = &config.disk_path {
            let disk = DiskImage::open_auto(disk_path)?;
            info!(
                path = %disk_path.display(),
                format = format_args!("{:?}", disk.format()),
                capacity = disk.capacity_bytes(),
                "disk attached"
            );
            let blk: Arc<Mutex<VirtioBlk>> = Arc::new(Mutex::new(VirtioBlk::new(Box::new(disk))));
            attach(&mut space, &mut slots, blk)?;
        }

        let net: Arc<Mutex<VirtioNet>> = Arc::new(Mutex::new(VirtioNet::new(config.net_link_up)));
        attach(&mut space, &mut slots, net.clone())?;

        let mut gpu_dev = None;
        let mut keyboard_dev = None;
        let mut tablet_dev = None;
        if let Some(display) = config.display_port.clone() {
            let gpu = Arc::new(Mutex::new(VirtioGpu::new(DEFAULT_DISPLAY.0, DEFAULT_DISPLAY.1)));
            {
                let mut g = gpu.lock().unwrap();
                let frames = display.clone();
                g.set_frame_callback(Box::new(move |frame| frames.submit_frame(frame)));
                let cursors = display.clone();
                g.set_cursor_callback(Box::new(move |cursor| cursors.submit_cursor(cursor)));
                let states = display.clone();
                g.set_scanout_state_callback(Box::new(move |active, w, h| {
                    states.submit_scanout_state(active, w, h)
                }));
            }
            attach(&mut space, &mut slots, gpu.clone())?;
            gpu_dev = Some(gpu);

            let keyboard = Arc::new(Mutex::new(VirtioInput::new(InputKind::Keyboard)));
            attach(&mut space, &mut slots, keyboard.clone())?;
            keyboard_dev = Some(keyboard);

            let tablet = Arc::new(Mutex::new(VirtioInput::new(InputKind::Tablet)));
            attach(&mut space, &mut slots, tablet.clone())?;
            tablet_dev = Some(tablet);
        }

        // Serial: port 0 free-form, port 1 is the guest agent.
        let serial = Arc::new(Mutex::new(VirtioSerial::new(2)));
        let agent = GuestAgent::new(serial.clone(), 1);
        {
            let mut s = serial.lock().unwrap();
            s.set_port_name(1, GuestAgent::PORT_NAME);
            // The callback runs with the serial device locked; the agent
            // handshake writes back into the device, so it moves to a
            // helper thread.
            let agent_open = agent.clone();
            s.set_port_open_callback(Box::new(move |port, opened| {
                if port != 1 {
                    return;
                }
                if opened {
                    let agent = agent_open.clone();
                    std::thread::spawn(move || agent.handle_port_opened());
                } else {
                    agent_open.handle_port_closed();
                }
            }));
            let agent_data = agent.clone();
            s.set_data_callback(Box::new(move |port, data| {
                if port == 1 {
                    agent_data.on_data(data);
                }
            }));
        }
        attach(&mut space, &mut slots, serial.clone())?;

        let mut fs_dev = None;
        if !config.shares.is_empty() {
            let fs = Arc::new(Mutex::new(VirtioFs::new("shared")));
            {
                let mut f = fs.lock().unwrap();
                for share in &config.shares {
                    if !f.add_share(&share.tag, &share.host_path, share.readonly) {
                        return Err(VmError::Config("invalid shared folder"));
                    }
                }
            }
            attach(&mut space, &mut slots, fs.clone())?;
            fs_dev = Some(fs);
        }

        if let Some(audio) = config.audio_port.clone() {
            let snd = Arc::new(Mutex::new(VirtioSnd::new()));
            snd.lock().unwrap().set_audio_port(audio);
            attach(&mut space, &mut slots, snd)?;
        }

        // Boot: kernel, initrd, zero page, ACPI with the virtio nodes.
        let kernel = std::fs::read(&config.kernel_path)
            .map_err(|source| VmError::ReadFile { path: config.kernel_path.clone(), source })?;
        let initrd = match &config.initrd_path {
            Some(path) => Some(
                std::fs::read(path)
                    .map_err(|source| VmError::ReadFile { path: path.clone(), source })?,
            ),
            None => None,
        };
        load_linux(
            &ram,
            &BootConfig {
                kernel: &kernel,
                initrd: initrd.as_deref(),
                cmdline: &config.cmdline,
                cpu_count: config.cpu_count,
                virtio_slots: &slots.slots,
            },
        )?;

        let addr_space = Arc::new(space);

        // vCPUs; only the BSP gets boot registers, APs wait for the
        // substrate's INIT/SIPI path.
        let handler: Arc<dyn IoHandler> = Arc::new(BusHandler { space: addr_space.clone() });
        let mut vcpus = Vec::with_capacity(config.cpu_count as usize);
        for index in 0..config.cpu_count {
            vcpus.push(partition.create_vcpu(index, handler.clone())?);
        }
        let boot_regs = initial_boot_registers(&ram)?;
        vcpus[0].set_registers(&boot_regs)?;

        // Network backend thread.
        let mut backend = NetBackend::new(config.net_link_up);
        backend.start(
            Arc::new(NetFrameSink { net: net.clone() }),
            config.port_forwards.clone(),
        );
        {
            let mut n = net.lock().unwrap();
            let tx = backend.tx_handle();
            n.set_tx_callback(Box::new(move |frame| tx.enqueue_tx(frame)));
        }

        info!(cpus = config.cpu_count, "VM created");

        Ok(Arc::new(Vm {
            partition,
            memory,
            addr_space,
            cpu_count: config.cpu_count,
            running,
            exit_code: Arc::new(AtomicI32::new(0)),
            reboot_requested,
            vcpus: Mutex::new(vcpus),
            console_port: config.console_port,
            uart,
            acpi_pm,
            irq_sink,
            net: Some(net),
            net_backend: Some(Mutex::new(backend)),
            gpu: gpu_dev,
            keyboard: keyboard_dev,
            tablet: tablet_dev,
            fs: fs_dev,
            agent: Some(agent),
        }))
    }

    /// Run until the guest stops. Launches one thread per vCPU plus the
    /// console input thread; returns the exit code.
    pub fn run(self: Arc<Self>) -> i32 {
        self.running.store(true, Ordering::SeqCst);
        info!("starting vCPU threads");

        let mut threads: Vec<JoinHandle<()>> = Vec::new();

        if let Some(console) = self.console_port.clone() {
            let vm = self.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("tenbox-console".into())
                    .spawn(move || vm.console_input_loop(console))
                    .expect("spawn console thread"),
            );
        }

        let vcpus = std::mem::take(&mut *self.vcpus.lock().unwrap());
        for mut vcpu in vcpus {
            let vm = self.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("tenbox-vcpu{}", vcpu.index()))
                    .spawn(move || vm.vcpu_loop(vcpu.as_mut()))
                    .expect("spawn vCPU thread"),
            );
        }

        for thread in threads {
            let _ = thread.join();
        }

        if let Some(backend) = &self.net_backend {
            backend.lock().unwrap().stop();
        }
        self.exit_code.load(Ordering::SeqCst)
    }

    fn vcpu_loop(&self, vcpu: &mut dyn Vcpu) {
        let index = vcpu.index();
        let mut exits: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            exits += 1;
            match vcpu.run_once() {
                RunOutcome::Continue => {}
                RunOutcome::Halt => std::thread::yield_now(),
                RunOutcome::Shutdown => {
                    info!(index, exits, "vCPU shutdown");
                    self.request_stop();
                    return;
                }
                RunOutcome::Error => {
                    error!(index, exits, "vCPU error");
                    self.exit_code.store(1, Ordering::SeqCst);
                    self.request_stop();
                    return;
                }
            }
        }
        info!(index, exits, "vCPU stopped");
    }

    fn console_input_loop(&self, console: Arc<dyn ConsolePort>) {
        let mut buf = [0u8; 32];
        while self.running.load(Ordering::SeqCst) {
            let read = console.read(&mut buf);
            if read == 0 {
                continue;
            }
            {
                let uart = self.uart.lock().unwrap();
                for byte in &buf[..read] {
                    uart.push_input(*byte);
                }
            }
            self.inject_irq(UART_IRQ);
        }
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for cpu in 0..self.cpu_count {
            self.partition.cancel_run(cpu);
        }
    }

    /// Mark the next guest exit as a reboot request, so the embedder can
    /// relaunch instead of reporting a stop.
    pub fn set_reboot_requested(&self) {
        self.reboot_requested.store(true, Ordering::SeqCst);
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested.load(Ordering::SeqCst)
    }

    /// Deliver a guest IRQ through the I/O APIC redirection table.
    pub fn inject_irq(&self, irq: u32) {
        self.irq_sink.raise_irq(irq);
    }

    pub fn trigger_power_button(&self) {
        self.acpi_pm.lock().unwrap().trigger_power_button();
    }

    /// Type bytes into the 16550's receive FIFO.
    pub fn inject_console_bytes(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let uart = self.uart.lock().unwrap();
            for byte in data {
                uart.push_input(*byte);
            }
        }
        self.inject_irq(UART_IRQ);
    }

    pub fn set_net_link_up(&self, up: bool) {
        if let Some(net) = &self.net {
            net.lock().unwrap().set_link_up(up);
        }
        if let Some(backend) = &self.net_backend {
            backend.lock().unwrap().set_link_up(up);
        }
    }

    pub fn update_port_forwards(&self, forwards: Vec<PortForward>) {
        if let Some(backend) = &self.net_backend {
            backend.lock().unwrap().update_port_forwards(forwards);
        }
    }

    pub fn inject_key_event(&self, key_code: u32, pressed: bool) {
        if let Some(keyboard) = &self.keyboard {
            let mut kbd = keyboard.lock().unwrap();
            kbd.inject_event(EV_KEY, key_code as u16, u32::from(pressed), false);
            kbd.inject_event(EV_SYN, SYN_REPORT, 0, true);
        }
    }

    /// Absolute pointer event; x and y are scaled to the tablet's
    /// 0..=32767 axes by the caller.
    pub fn inject_pointer_event(&self, x: i32, y: i32, buttons: u32) {
        if let Some(tablet) = &self.tablet {
            let mut tab = tablet.lock().unwrap();
            let x = x.clamp(0, ABS_AXIS_MAX as i32) as u32;
            let y = y.clamp(0, ABS_AXIS_MAX as i32) as u32;
            tab.inject_event(EV_ABS, ABS_X, x, false);
            tab.inject_event(EV_ABS, ABS_Y, y, false);
            tab.inject_event(EV_KEY, BTN_LEFT, buttons & 1, false);
            tab.inject_event(EV_KEY, BTN_RIGHT, (buttons >> 1) & 1, false);
            tab.inject_event(EV_KEY, BTN_MIDDLE, (buttons >> 2) & 1, false);
            tab.inject_event(EV_SYN, SYN_REPORT, 0, true);
        }
    }

    pub fn inject_wheel_event(&self, delta: i32) {
        if let Some(tablet) = &self.tablet {
            let mut tab = tablet.lock().unwrap();
            tab.inject_event(EV_REL, REL_WHEEL, delta as u32, false);
            tab.inject_event(EV_SYN, SYN_REPORT, 0, true);
        }
    }

    pub fn set_display_size(&self, width: u32, height: u32) {
        if let Some(gpu) = &self.gpu {
            gpu.lock().unwrap().set_display_size(width, height);
        }
    }

    pub fn guest_agent(&self) -> Option<Arc<GuestAgent>> {
        self.agent.clone()
    }

    pub fn is_guest_agent_connected(&self) -> bool {
        self.agent.as_ref().map(|a| a.is_connected()).unwrap_or(false)
    }

    pub fn add_shared_folder(&self, tag: &str, host_path: &std::path::Path, readonly: bool) -> bool {
        match &self.fs {
            Some(fs) => fs.lock().unwrap().add_share(tag, host_path, readonly),
            None => false,
        }
    }

    pub fn remove_shared_folder(&self, tag: &str) -> bool {
        match &self.fs {
            Some(fs) => fs.lock().unwrap().remove_share(tag),
            None => false,
        }
    }

    pub fn shared_folder_tags(&self) -> Vec<String> {
        match &self.fs {
            Some(fs) => fs.lock().unwrap().share_tags(),
            None => Vec::new(),
        }
    }

    /// The PIO/MMIO bus, exposed for embedders that drive devices
    /// directly (tests, diagnostics).
    pub fn address_space(&self) -> Arc<AddressSpace> {
        self.addr_space.clone()
    }
}
