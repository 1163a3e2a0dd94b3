//! Page fault delivery to user-level upcalls.

use exokern::{
    Abort, ExitStatus, Kernel, UserCtx,
    addressing::Va,
    env::EnvId,
    memlayout::{PGSIZE, USTACKTOP, UXSTACK_VA, UXSTACKTOP},
    mm::page_table::PteFlags,
    trap::{PFErrorCode, UTrapframe},
};

const FAULT_VA: usize = 0x3000_0000;
const NESTED_VA: usize = 0x3100_0000;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

/// Map a zeroed writable page wherever a fault happens.
fn map_on_demand(ctx: &mut UserCtx<'_>, utf: &UTrapframe) -> Result<(), Abort> {
    ctx.sys_page_alloc(
        EnvId::CURRENT,
        utf.fault_va.page_down(),
        PteFlags::U | PteFlags::W,
    )
    .map_err(|e| Abort::panic(ctx.env_id(), e.to_string()))
}

/// Fault once more from inside the handler before resolving the first fault.
fn fault_inside_upcall(ctx: &mut UserCtx<'_>, utf: &UTrapframe) -> Result<(), Abort> {
    if utf.fault_va == va(FAULT_VA) {
        ctx.write(va(NESTED_VA), b"nested")?;
    }
    map_on_demand(ctx, utf)
}

/// Return without fixing anything.
fn ignore(_ctx: &mut UserCtx<'_>, _utf: &UTrapframe) -> Result<(), Abort> {
    Ok(())
}

fn install(ctx: &mut UserCtx<'_>, upcall: exokern::trap::Upcall) {
    ctx.sys_page_alloc(EnvId::CURRENT, UXSTACK_VA, PteFlags::U | PteFlags::W)
        .unwrap();
    ctx.sys_env_set_pgfault_upcall(EnvId::CURRENT, Some(upcall))
        .unwrap();
}

fn frame_at(kernel: &Kernel, id: EnvId, esp: usize) -> UTrapframe {
    let bytes = kernel.peek(id, va(esp), UTrapframe::SIZE).unwrap();
    UTrapframe::from_bytes(&bytes.try_into().unwrap()).unwrap()
}

/// A fault is resolved by the upcall and the access is retried.
///
/// The trap-time frame is pushed at the very top of the exception stack and
/// records the faulting address, the error code and the normal stack.
#[test]
fn upcall_resolves_fault() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            install(ctx, map_on_demand);
            ctx.write(va(FAULT_VA + 8), b"demand")?;
            let mut buf = [0; 6];
            ctx.read(va(FAULT_VA + 8), &mut buf)?;
            assert_eq!(&buf, b"demand");
            ctx.sys_yield(|_| Ok(0));
            Ok(0)
        })
        .unwrap();

    assert_eq!(kernel.step(), Some(id));
    let utf = frame_at(&kernel, id, UXSTACKTOP - UTrapframe::SIZE);
    assert_eq!(utf.fault_va, va(FAULT_VA + 8));
    assert_eq!(utf.err, PFErrorCode::USER | PFErrorCode::WRITE);
    assert_eq!(utf.esp, USTACKTOP);

    kernel.run();
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
}

/// A fault raised by the upcall itself is pushed below the running frame,
/// leaving an empty word in between.
#[test]
fn nested_fault() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            install(ctx, fault_inside_upcall);
            ctx.write(va(FAULT_VA), b"outer")?;
            let mut buf = [0; 6];
            ctx.read(va(NESTED_VA), &mut buf)?;
            assert_eq!(&buf, b"nested");
            ctx.sys_yield(|_| Ok(0));
            Ok(0)
        })
        .unwrap();

    kernel.step();
    let outer_esp = UXSTACKTOP - UTrapframe::SIZE;
    let outer = frame_at(&kernel, id, outer_esp);
    assert_eq!(outer.fault_va, va(FAULT_VA));
    assert_eq!(outer.esp, USTACKTOP);

    let inner = frame_at(&kernel, id, outer_esp - 4 - UTrapframe::SIZE);
    assert_eq!(inner.fault_va, va(NESTED_VA));
    assert_eq!(inner.esp, outer_esp);

    kernel.run();
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
}

/// Without an upcall, a fault terminates the environment.
#[test]
fn no_upcall() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            ctx.write(va(FAULT_VA), b"x")?;
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(
        kernel.exit_status(id),
        Some(&ExitStatus::Aborted(Abort::UnhandledFault {
            env: id,
            va: va(FAULT_VA),
            err: PFErrorCode::USER | PFErrorCode::WRITE,
        }))
    );
}

/// A write to a read-only page reports a protection violation.
#[test]
fn protection_fault_code() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            ctx.sys_page_alloc(EnvId::CURRENT, va(FAULT_VA), PteFlags::U)
                .unwrap();
            let mut buf = [1; 4];
            ctx.read(va(FAULT_VA), &mut buf)?;
            assert_eq!(buf, [0; 4]);
            ctx.write(va(FAULT_VA), b"x")?;
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(
        kernel.exit_status(id),
        Some(&ExitStatus::Aborted(Abort::UnhandledFault {
            env: id,
            va: va(FAULT_VA),
            err: PFErrorCode::USER | PFErrorCode::WRITE | PFErrorCode::PRESENT,
        }))
    );
}

/// An upcall without a mapped exception stack cannot be delivered.
#[test]
fn missing_exception_stack() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            ctx.sys_env_set_pgfault_upcall(EnvId::CURRENT, Some(map_on_demand))
                .unwrap();
            ctx.write(va(FAULT_VA), b"x")?;
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(
        kernel.exit_status(id),
        Some(&ExitStatus::Aborted(Abort::BadExceptionStack {
            env: id,
            va: va(FAULT_VA),
        }))
    );
}

/// The exception stack must be writable.
#[test]
fn read_only_exception_stack() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            ctx.sys_page_alloc(EnvId::CURRENT, UXSTACK_VA, PteFlags::U)
                .unwrap();
            ctx.sys_env_set_pgfault_upcall(EnvId::CURRENT, Some(map_on_demand))
                .unwrap();
            ctx.write(va(FAULT_VA), b"x")?;
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert!(matches!(
        kernel.exit_status(id),
        Some(ExitStatus::Aborted(Abort::BadExceptionStack { .. }))
    ));
}

/// An upcall that never fixes the fault does not loop forever.
#[test]
fn persistent_fault() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            install(ctx, ignore);
            ctx.write(va(FAULT_VA), b"x")?;
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(
        kernel.exit_status(id),
        Some(&ExitStatus::Aborted(Abort::UnhandledFault {
            env: id,
            va: va(FAULT_VA),
            err: PFErrorCode::USER | PFErrorCode::WRITE,
        }))
    );
}

/// Accesses spanning a page boundary fault on each page separately.
#[test]
fn access_across_pages() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            install(ctx, map_on_demand);
            let data: Vec<u8> = (0..PGSIZE + 16).map(|i| i as u8).collect();
            ctx.write(va(FAULT_VA + PGSIZE - 8), &data)?;
            let mut back = vec![0; data.len()];
            ctx.read(va(FAULT_VA + PGSIZE - 8), &mut back)?;
            assert_eq!(back, data);
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
}
