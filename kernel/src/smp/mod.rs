//! Core records and SMP bring-up
//!
//! One [`Core`] record per live CPU, identified by APIC id and ACPI UID
//! and addressed by a dense logical id assigned after AP bring-up
//! compacts out the cores that failed to boot. Each record owns its
//! scheduler instance, its preemption timer, and its IPI work queue.

pub mod mp;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sched::Instance;
use crate::sync::OnceLock;
use crate::time::Timer;

/// A CPU as enumerated from the platform tables (MADT), before bring-up.
#[derive(Debug, Clone, Copy)]
pub struct CoreDescriptor {
    pub apic_id: u32,
    pub acpi_uid: u32,
}

/// One live core.
pub struct Core {
    logical_id: u32,
    apic_id: u32,
    acpi_uid: u32,
    scheduler: OnceLock<Arc<Instance>>,
    ipi_queue: mp::IpiQueue,
}

impl Core {
    fn new(logical_id: u32, descriptor: CoreDescriptor) -> Self {
        Self {
            logical_id,
            apic_id: descriptor.apic_id,
            acpi_uid: descriptor.acpi_uid,
            scheduler: OnceLock::new(),
            ipi_queue: mp::IpiQueue::new(),
        }
    }

    pub fn logical_id(&self) -> u32 {
        self.logical_id
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn acpi_uid(&self) -> u32 {
        self.acpi_uid
    }

    pub fn scheduler(&self) -> &Arc<Instance> {
        self.scheduler
            .get()
            .expect("core scheduler requested before registration")
    }

    pub fn ipi_queue(&self) -> &mp::IpiQueue {
        &self.ipi_queue
    }
}

static CORES: OnceLock<Vec<Core>> = OnceLock::new();

/// Boot the application processors and freeze the surviving cores under
/// dense logical ids. On the BSP-only path (and on the host) the
/// descriptor list is taken as-is.
pub fn boot(descriptors: Vec<CoreDescriptor>) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    let survivors = crate::arch::x86_64::mp::boot_aps(descriptors);
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let survivors = descriptors;

    register_cores(survivors);
}

/// Create the frozen core records; one scheduler instance and one
/// preemption timer per core.
fn register_cores(descriptors: Vec<CoreDescriptor>) {
    let cores: Vec<Core> = descriptors
        .into_iter()
        .enumerate()
        .map(|(index, descriptor)| Core::new(index as u32, descriptor))
        .collect();

    for core in &cores {
        let timer: &'static Timer = Box::leak(Box::new(Timer::new(preemption_backend())));
        let _ = core.scheduler.set(Instance::new(core.logical_id, timer));
    }

    if CORES.set(cores).is_err() {
        panic!("core records registered twice");
    }

    log::info!("[CPU] {} core(s) registered", core_count());
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn preemption_backend() -> &'static dyn crate::time::TimerBackend {
    crate::arch::x86_64::lapic::timer_backend()
}

/// Host stand-in; never armed for real.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn preemption_backend() -> &'static dyn crate::time::TimerBackend {
    struct InertBackend;

    impl crate::time::TimerBackend for InertBackend {
        fn counter(&self) -> u64 {
            0
        }
        fn period_femtoseconds(&self) -> u64 {
            1_000_000
        }
        fn arm_after(&self, _nanoseconds: u64) {}
    }

    static BACKEND: InertBackend = InertBackend;
    &BACKEND
}

/// The frozen core records (empty before [`boot`]).
pub fn cores() -> &'static [Core] {
    CORES.get().map(Vec::as_slice).unwrap_or(&[])
}

pub fn core_count() -> usize {
    cores().len()
}

pub fn core_by_id(logical_id: u32) -> Option<&'static Core> {
    cores().get(logical_id as usize)
}

/// The record of the core this code runs on. `None` on the host and
/// before registration.
pub fn current_core() -> Option<&'static Core> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let apic_id = crate::arch::x86_64::lapic::current_apic_id();
        cores().iter().find(|core| core.apic_id == apic_id)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        None
    }
}

pub fn current_core_id() -> Option<u32> {
    current_core().map(Core::logical_id)
}

/// Poke another core's scheduler via its scheduling-trigger vector.
pub fn send_scheduling_ipi(logical_id: u32) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if let Some(core) = core_by_id(logical_id) {
        crate::arch::x86_64::lapic::send_ipi(core.apic_id(), crate::irq::SCHEDULING_TRIGGER);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = logical_id;
    }
}

/// Fire the IPI-work vector at one core.
pub fn send_work_ipi(logical_id: u32) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if let Some(core) = core_by_id(logical_id) {
        crate::arch::x86_64::lapic::send_ipi(core.apic_id(), crate::irq::IPI_WORK);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = logical_id;
    }
}

/// Fire the IPI-work vector at every core but this one.
pub fn broadcast_work_ipi() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::lapic::broadcast_ipi(crate::irq::IPI_WORK);
}
