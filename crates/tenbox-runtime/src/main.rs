//! The per-VM runtime process: builds a [`Vm`] from the command line,
//! optionally serves the manager over a control endpoint, and exits with
//! the guest's status (128 when the guest asked for a reboot).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tenbox_machine::{PortForward, ShareConfig, Vm, VmConfig};
use tenbox_runtime::ports::StdioConsolePort;
use tenbox_runtime::service::RuntimeService;
use tracing::info;

const REBOOT_EXIT_CODE: i32 = 128;

#[derive(Parser, Debug)]
#[command(name = "tenbox-runtime", version, about = "TenBox VM runtime")]
struct Args {
    /// Path to the kernel bzImage.
    #[arg(long)]
    kernel: PathBuf,

    /// Path to an initramfs image.
    #[arg(long)]
    initrd: Option<PathBuf>,

    /// Path to a raw or qcow2 disk image.
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Kernel command line.
    #[arg(long)]
    cmdline: Option<String>,

    /// Guest RAM in MiB.
    #[arg(long, default_value_t = 256)]
    memory: u64,

    /// Number of vCPUs.
    #[arg(long, default_value_t = 1)]
    cpus: u32,

    /// Start with the network link up.
    #[arg(long)]
    net: bool,

    /// Port forward HOST:GUEST (repeatable).
    #[arg(long = "forward", value_name = "H:G")]
    forwards: Vec<String>,

    /// Shared folder TAG:PATH[:ro] (repeatable).
    #[arg(long = "share", value_name = "TAG:PATH[:ro]")]
    shares: Vec<String>,

    /// Runtime VM id reported on the control channel.
    #[arg(long, default_value = "default")]
    vm_id: String,

    /// Control endpoint (Unix socket path) to serve the manager on.
    #[arg(long)]
    control_endpoint: Option<PathBuf>,

    /// Attach the host terminal as the guest console.
    #[arg(long, default_value = "on", value_parser = parse_on_off)]
    interactive: bool,
}

fn parse_on_off(value: &str) -> Result<bool, String> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("expected 'on' or 'off', got '{other}'")),
    }
}

fn parse_forward(spec: &str) -> anyhow::Result<PortForward> {
    let (host, guest) = spec
        .split_once(':')
        .with_context(|| format!("invalid --forward '{spec}', expected H:G"))?;
    let host_port: u16 = host.parse().with_context(|| format!("invalid host port '{host}'"))?;
    let guest_port: u16 =
        guest.parse().with_context(|| format!("invalid guest port '{guest}'"))?;
    if host_port == 0 || guest_port == 0 {
        bail!("ports in --forward must be non-zero");
    }
    Ok(PortForward { host_port, guest_port })
}

fn parse_share(spec: &str) -> anyhow::Result<ShareConfig> {
    let (tag, rest) = spec
        .split_once(':')
        .with_context(|| format!("invalid --share '{spec}', expected TAG:PATH[:ro]"))?;
    let (path, readonly) = match rest.strip_suffix(":ro") {
        Some(path) => (path, true),
        None => (rest, false),
    };
    if tag.is_empty() || path.is_empty() {
        bail!("invalid --share '{spec}': empty tag or path");
    }
    Ok(ShareConfig { tag: tag.to_string(), host_path: PathBuf::from(path), readonly })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.memory < 16 {
        bail!("minimum memory is 16 MiB");
    }
    if args.cpus == 0 || args.cpus > 128 {
        bail!("--cpus must be between 1 and 128");
    }

    let mut config = VmConfig {
        kernel_path: args.kernel.clone(),
        initrd_path: args.initrd.clone(),
        disk_path: args.disk.clone(),
        memory_mb: args.memory,
        cpu_count: args.cpus,
        net_link_up: args.net,
        ..VmConfig::default()
    };
    if let Some(cmdline) = &args.cmdline {
        config.cmdline = cmdline.clone();
    }
    for spec in &args.forwards {
        config.port_forwards.push(parse_forward(spec)?);
    }
    for spec in &args.shares {
        config.shares.push(parse_share(spec)?);
    }

    let hypervisor = tenbox_hv::host_hypervisor()
        .context("no hardware hypervisor is available on this platform")?;

    // Control endpoint: a Unix-domain stream the manager connects to.
    let mut service: Option<RuntimeService> = None;
    #[cfg(unix)]
    let mut control_stream: Option<std::os::unix::net::UnixStream> = None;

    if let Some(endpoint) = &args.control_endpoint {
        #[cfg(unix)]
        {
            use std::os::unix::net::UnixListener;
            let _ = std::fs::remove_file(endpoint);
            let listener = UnixListener::bind(endpoint)
                .with_context(|| format!("bind control endpoint {}", endpoint.display()))?;
            info!(endpoint = %endpoint.display(), "waiting for manager connection");
            let (stream, _) = listener.accept().context("accept manager connection")?;
            let reader = stream.try_clone().context("clone control stream")?;
            let writer = stream.try_clone().context("clone control stream")?;
            let svc = RuntimeService::new(&args.vm_id, Box::new(reader), Box::new(writer));
            svc.publish_state("starting", 0);
            config.console_port = Some(svc.console_port());
            config.display_port = Some(svc.display_port());
            config.audio_port = Some(svc.audio_port());
            control_stream = Some(stream);
            service = Some(svc);
        }
        #[cfg(not(unix))]
        {
            let _ = endpoint;
            bail!("--control-endpoint is only supported on Unix hosts");
        }
    } else if args.interactive {
        config.console_port = Some(Arc::new(StdioConsolePort));
    }

    let vm = match Vm::create(config, hypervisor) {
        Ok(vm) => vm,
        Err(e) => {
            if let Some(svc) = &service {
                svc.publish_state("crashed", 1);
            }
            return Err(e).context("failed to create VM");
        }
    };

    if let Some(svc) = &service {
        svc.attach_vm(vm.clone());
        svc.publish_state("running", 0);
    }

    let exit_code = vm.clone().run();
    let reboot = vm.reboot_requested();

    if let Some(mut svc) = service {
        if reboot {
            svc.publish_state("rebooting", 0);
        } else if exit_code == 0 {
            svc.publish_state("stopped", 0);
        } else {
            svc.publish_state("crashed", exit_code);
        }
        // Give the send worker a beat to flush the final state, then shut
        // the stream down so the workers unblock.
        std::thread::sleep(std::time::Duration::from_millis(50));
        #[cfg(unix)]
        if let Some(stream) = control_stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        svc.stop();
    }

    if reboot {
        std::process::exit(REBOOT_EXIT_CODE);
    }
    std::process::exit(exit_code);
}
