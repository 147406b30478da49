use std::sync::Arc;

/// Receiver of guest-visible interrupt requests. The VM implements this by
/// consulting the I/O APIC redirection table and forwarding to the
/// hypervisor substrate.
pub trait IrqSink: Send + Sync {
    fn raise_irq(&self, irq: u32);
}

/// A single interrupt line handed to a device as a capability. Devices
/// hold the line by value instead of a back-pointer to the VM.
#[derive(Clone)]
pub struct IrqLine {
    irq: u32,
    sink: Arc<dyn IrqSink>,
}

impl IrqLine {
    pub fn new(irq: u32, sink: Arc<dyn IrqSink>) -> Self {
        IrqLine { irq, sink }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn raise(&self) {
        self.sink.raise_irq(self.irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<u32>>);

    impl IrqSink for Log {
        fn raise_irq(&self, irq: u32) {
            self.0.lock().unwrap().push(irq);
        }
    }

    #[test]
    fn line_forwards_its_irq_number() {
        let log = Arc::new(Log::default());
        let line = IrqLine::new(9, log.clone());
        line.raise();
        line.raise();
        assert_eq!(*log.0.lock().unwrap(), vec![9, 9]);
    }
}
