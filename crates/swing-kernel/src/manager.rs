//! Vat workers: where a vat's [`Dispatch`] actually runs.

use crate::config::ManagerType;
use crate::error::KernelError;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use swing_abi::{
    DeliveryStatus, Dispatch, Syscall, SyscallResult, VatBundle, VatDelivery, VatId, VatSyscall,
};

/// Kernel-side handle on a running vat.
pub trait VatWorker: Send {
    fn deliver(&mut self, delivery: &VatDelivery, syscall: &mut dyn Syscall) -> Result<DeliveryStatus, KernelError>;

    fn snapshot(&mut self) -> Result<Vec<u8>, KernelError>;

    fn shutdown(&mut self);
}

/// Build (or restore) a vat and wrap it in a worker of the requested kind.
pub fn start_worker(
    manager: ManagerType,
    vat: VatId,
    bundle: Arc<dyn VatBundle>,
    snapshot: Option<Vec<u8>>,
) -> Result<Box<dyn VatWorker>, KernelError> {
    match manager {
        ManagerType::Local => {
            let dispatch = match snapshot {
                Some(bytes) => bundle.restore(&bytes),
                None => bundle.build(),
            }
            .map_err(|err| KernelError::Worker(format!("{vat}: {err}")))?;
            Ok(Box::new(LocalWorker { vat, dispatch }))
        }
        ManagerType::Thread => Ok(Box::new(ThreadWorker::spawn(vat, bundle, snapshot)?)),
    }
}

pub struct LocalWorker {
    vat: VatId,
    dispatch: Box<dyn Dispatch>,
}

impl VatWorker for LocalWorker {
    fn deliver(&mut self, delivery: &VatDelivery, syscall: &mut dyn Syscall) -> Result<DeliveryStatus, KernelError> {
        Ok(self.dispatch.deliver(delivery, syscall))
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, KernelError> {
        self.dispatch
            .snapshot()
            .map_err(|err| KernelError::Worker(format!("{} snapshot: {err}", self.vat)))
    }

    fn shutdown(&mut self) {}
}

enum ToWorker {
    Deliver(VatDelivery),
    SyscallResult(SyscallResult),
    Snapshot,
    Shutdown,
}

enum FromWorker {
    Ready(Result<(), String>),
    Syscall(VatSyscall),
    Delivered(DeliveryStatus),
    Snapshot(Result<Vec<u8>, String>),
}

/// A vat on its own OS thread. Every syscall is a blocking round trip, so
/// the vat still runs strictly inside the kernel's crank.
pub struct ThreadWorker {
    vat: VatId,
    to_worker: Sender<ToWorker>,
    from_worker: Receiver<FromWorker>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadWorker {
    pub fn spawn(vat: VatId, bundle: Arc<dyn VatBundle>, snapshot: Option<Vec<u8>>) -> Result<Self, KernelError> {
        let (to_tx, to_rx) = mpsc::channel();
        let (from_tx, from_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("vat-{vat}"))
            .spawn(move || worker_main(bundle, snapshot, to_rx, from_tx))
            .map_err(|err| KernelError::Worker(format!("{vat}: cannot spawn thread: {err}")))?;
        let mut worker = Self {
            vat,
            to_worker: to_tx,
            from_worker: from_rx,
            handle: Some(handle),
        };
        match worker.from_worker.recv() {
            Ok(FromWorker::Ready(Ok(()))) => {
                log::debug!("{vat} worker thread started");
                Ok(worker)
            }
            Ok(FromWorker::Ready(Err(err))) => {
                worker.shutdown();
                Err(KernelError::Worker(format!("{vat}: {err}")))
            }
            _ => {
                worker.shutdown();
                Err(KernelError::Worker(format!("{vat}: worker exited during startup")))
            }
        }
    }
}

impl VatWorker for ThreadWorker {
    fn deliver(&mut self, delivery: &VatDelivery, syscall: &mut dyn Syscall) -> Result<DeliveryStatus, KernelError> {
        if self.to_worker.send(ToWorker::Deliver(delivery.clone())).is_err() {
            return Ok(DeliveryStatus::error("vat worker died"));
        }
        loop {
            match self.from_worker.recv() {
                Ok(FromWorker::Syscall(call)) => {
                    let result = syscall.call(call);
                    if self.to_worker.send(ToWorker::SyscallResult(result)).is_err() {
                        return Ok(DeliveryStatus::error("vat worker died"));
                    }
                }
                Ok(FromWorker::Delivered(status)) => return Ok(status),
                Ok(_) => {
                    return Err(KernelError::Worker(format!(
                        "{}: unexpected worker message during delivery",
                        self.vat
                    )));
                }
                Err(_) => return Ok(DeliveryStatus::error("vat worker died")),
            }
        }
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, KernelError> {
        let gone = || KernelError::Worker(format!("{}: worker gone", self.vat));
        self.to_worker.send(ToWorker::Snapshot).map_err(|_| gone())?;
        match self.from_worker.recv() {
            Ok(FromWorker::Snapshot(result)) => {
                result.map_err(|err| KernelError::Worker(format!("{} snapshot: {err}", self.vat)))
            }
            _ => Err(gone()),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.to_worker.send(ToWorker::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("{} worker thread panicked", self.vat);
            }
        }
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ChannelSyscall<'a> {
    from_kernel: &'a Receiver<ToWorker>,
    to_kernel: &'a Sender<FromWorker>,
}

impl Syscall for ChannelSyscall<'_> {
    fn call(&mut self, syscall: VatSyscall) -> SyscallResult {
        if self.to_kernel.send(FromWorker::Syscall(syscall)).is_err() {
            return SyscallResult::error("kernel went away");
        }
        match self.from_kernel.recv() {
            Ok(ToWorker::SyscallResult(result)) => result,
            _ => SyscallResult::error("kernel went away"),
        }
    }
}

fn worker_main(
    bundle: Arc<dyn VatBundle>,
    snapshot: Option<Vec<u8>>,
    from_kernel: Receiver<ToWorker>,
    to_kernel: Sender<FromWorker>,
) {
    let built = match snapshot {
        Some(bytes) => bundle.restore(&bytes),
        None => bundle.build(),
    };
    let mut dispatch = match built {
        Ok(dispatch) => dispatch,
        Err(err) => {
            let _ = to_kernel.send(FromWorker::Ready(Err(err)));
            return;
        }
    };
    if to_kernel.send(FromWorker::Ready(Ok(()))).is_err() {
        return;
    }
    while let Ok(msg) = from_kernel.recv() {
        let reply = match msg {
            ToWorker::Deliver(delivery) => {
                let mut syscall = ChannelSyscall {
                    from_kernel: &from_kernel,
                    to_kernel: &to_kernel,
                };
                FromWorker::Delivered(dispatch.deliver(&delivery, &mut syscall))
            }
            ToWorker::Snapshot => FromWorker::Snapshot(dispatch.snapshot()),
            ToWorker::Shutdown => return,
            ToWorker::SyscallResult(_) => continue,
        };
        if to_kernel.send(reply).is_err() {
            return;
        }
    }
}
