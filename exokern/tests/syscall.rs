//! Argument checking and effects of the system calls.

use exokern::{
    Abort, Exofork, ExitStatus, Kernel, KernelError, UserCtx,
    addressing::Va,
    env::{EnvId, EnvStatus},
    memlayout::{PGSIZE, UTOP},
    mm::page_table::PteFlags,
};
use std::{cell::Cell, rc::Rc};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

const UW: PteFlags = PteFlags::from_bits_truncate(PteFlags::U.bits() | PteFlags::W.bits());

/// Run `program` as the only environment and expect it to exit with 0.
fn run_alone<F>(program: F)
where
    F: FnOnce(&mut UserCtx<'_>) -> Result<i32, Abort> + 'static,
{
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel.spawn(program).unwrap();
    kernel.run();
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
}

/// `sys_page_alloc` rejects bad addresses and permissions.
#[test]
fn page_alloc_arguments() {
    run_alone(|ctx: &mut UserCtx<'_>| {
        let me = EnvId::CURRENT;
        assert_eq!(
            ctx.sys_page_alloc(me, va(0x1234), UW),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            ctx.sys_page_alloc(me, va(UTOP), UW),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            ctx.sys_page_alloc(me, va(0x1000), PteFlags::W),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            ctx.sys_page_alloc(me, va(0x1000), UW | PteFlags::PCD),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            ctx.sys_page_alloc(EnvId(0xdead), va(0x1000), UW),
            Err(KernelError::BadEnv)
        );

        // AVAIL bits are accepted and kept; P is implied.
        ctx.sys_page_alloc(me, va(0x1000), PteFlags::U | PteFlags::AVAIL)
            .unwrap();
        let pte = ctx.vpt().pte(va(0x1000));
        assert_eq!(pte.flags(), PteFlags::P | PteFlags::U | PteFlags::AVAIL);
        Ok(0)
    });
}

/// A fresh page is zeroed and replaces whatever was mapped before.
#[test]
fn page_alloc_replaces() {
    run_alone(|ctx: &mut UserCtx<'_>| {
        ctx.sys_page_alloc(EnvId::CURRENT, va(0x1000), UW).unwrap();
        ctx.write(va(0x1000), b"stale")?;
        let old = ctx.vpt().pte(va(0x1000)).pa();
        ctx.sys_page_alloc(EnvId::CURRENT, va(0x1000), UW).unwrap();
        assert_ne!(ctx.vpt().pte(va(0x1000)).pa(), old);
        let mut buf = [1; 5];
        ctx.read(va(0x1000), &mut buf)?;
        assert_eq!(buf, [0; 5]);
        Ok(0)
    });
}

/// `sys_page_map` shares a page and refuses to grant write access to a
/// read-only page.
#[test]
fn page_map() {
    run_alone(|ctx: &mut UserCtx<'_>| {
        let me = EnvId::CURRENT;
        ctx.sys_page_alloc(me, va(0x1000), UW).unwrap();
        ctx.sys_page_alloc(me, va(0x2000), PteFlags::U).unwrap();
        ctx.write(va(0x1000), b"shared")?;

        ctx.sys_page_map(me, va(0x1000), me, va(0x40_0000), PteFlags::U)
            .unwrap();
        let mut buf = [0; 6];
        ctx.read(va(0x40_0000), &mut buf)?;
        assert_eq!(&buf, b"shared");
        assert_eq!(
            ctx.vpt().pte(va(0x40_0000)).pa(),
            ctx.vpt().pte(va(0x1000)).pa()
        );

        assert_eq!(
            ctx.sys_page_map(me, va(0x2000), me, va(0x3000), UW),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            ctx.sys_page_map(me, va(0x5000), me, va(0x3000), PteFlags::U),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            ctx.sys_page_map(me, va(0x1000), me, va(0x3001), PteFlags::U),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            ctx.sys_page_map(me, va(0x1000), me, va(UTOP), PteFlags::U),
            Err(KernelError::InvalidArgument)
        );

        // Re-mapping a page onto itself only changes its permission.
        let pa = ctx.vpt().pte(va(0x1000)).pa();
        ctx.sys_page_map(me, va(0x1000), me, va(0x1000), PteFlags::U)
            .unwrap();
        let pte = ctx.vpt().pte(va(0x1000));
        assert_eq!(pte.pa(), pa);
        assert_eq!(pte.flags(), PteFlags::P | PteFlags::U);
        Ok(0)
    });
}

/// Unmapping an absent page succeeds silently.
#[test]
fn page_unmap() {
    run_alone(|ctx: &mut UserCtx<'_>| {
        let me = EnvId::CURRENT;
        ctx.sys_page_alloc(me, va(0x1000), UW).unwrap();
        ctx.sys_page_unmap(me, va(0x1000)).unwrap();
        assert!(!ctx.vpt().pte(va(0x1000)).is_present());
        ctx.sys_page_unmap(me, va(0x1000)).unwrap();
        ctx.sys_page_unmap(me, va(0x7000_0000)).unwrap();
        assert_eq!(
            ctx.sys_page_unmap(me, va(0x1001)),
            Err(KernelError::InvalidArgument)
        );
        Ok(0)
    });
}

/// An environment may only act on itself and its immediate children.
#[test]
fn permission_to_act() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let other = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            ctx.sys_yield(|_| Ok(0));
            Ok(0)
        })
        .unwrap();
    let id = kernel
        .spawn(move |ctx: &mut UserCtx<'_>| {
            assert_eq!(
                ctx.sys_page_alloc(other, va(0x1000), UW),
                Err(KernelError::BadEnv)
            );
            assert_eq!(ctx.sys_env_destroy(other), Err(KernelError::BadEnv));
            assert!(ctx.env_info(other).is_some());

            let child = ctx.sys_exofork(|_, _| Ok(0)).unwrap();
            ctx.sys_page_alloc(child, va(0x1000), UW).unwrap();
            ctx.sys_page_map(child, va(0x1000), EnvId::CURRENT, va(0x1000), UW)
                .unwrap();
            ctx.sys_env_destroy(child).unwrap();
            assert!(ctx.env_info(child).is_none());
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
    assert_eq!(kernel.exit_status(other), Some(&ExitStatus::Exited(0)));
}

/// `sys_exofork` returns twice: to the parent with the child's id, and to
/// the child with [`Exofork::Child`] once it is made runnable.
#[test]
fn exofork() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let child_ran = Rc::new(Cell::new(false));
    let flag = child_ran.clone();
    let id = kernel
        .spawn(move |ctx: &mut UserCtx<'_>| {
            let child = ctx
                .sys_exofork(move |ctx, who| {
                    assert_eq!(who, Exofork::Child);
                    // The address space starts out empty.
                    assert!(ctx.vpt().present_pages(va(0), va(UTOP)).is_empty());
                    flag.set(true);
                    Ok(7)
                })
                .unwrap();
            let info = ctx.env_info(child).unwrap();
            assert_eq!(info.status, EnvStatus::NotRunnable);
            assert_eq!(info.parent_id, ctx.sys_getenvid());
            assert!(info.pgfault_upcall.is_none());

            assert_eq!(
                ctx.sys_env_set_status(child, EnvStatus::Dying),
                Err(KernelError::InvalidArgument)
            );
            ctx.sys_env_set_status(child, EnvStatus::Runnable).unwrap();
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert!(child_ran.get());
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
    let (child, status) = kernel.exits().find(|(env, _)| *env != id).unwrap();
    assert_eq!(status, &ExitStatus::Exited(7));
    assert_ne!(child.envx(), id.envx());
}

/// A child that is never made runnable never runs and dies with its
/// parent's destroy call.
#[test]
fn destroy_child() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            let child = ctx
                .sys_exofork(|_, _| panic!("child must not run"))
                .unwrap();
            ctx.sys_env_destroy(child).unwrap();
            assert_eq!(
                ctx.sys_env_set_status(child, EnvStatus::Runnable),
                Err(KernelError::BadEnv)
            );
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
    assert_eq!(kernel.exits().count(), 2);
    assert_eq!(kernel.free_frames(), kernel.total_frames());
}

/// An environment that destroys itself can no longer touch its memory.
#[test]
fn destroy_self() {
    init();
    let mut kernel = Kernel::builder().npages(64).build();
    let id = kernel
        .spawn(|ctx: &mut UserCtx<'_>| {
            ctx.sys_env_destroy(EnvId::CURRENT).unwrap();
            let me = ctx.sys_getenvid();
            assert_eq!(
                ctx.write(va(0x1000), b"x"),
                Err(Abort::Killed { env: me })
            );
            Ok(0)
        })
        .unwrap();
    kernel.run();
    assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Destroyed));
    assert_eq!(kernel.live_envs(), 0);
}

/// Running out of frames is reported as [`KernelError::NoMemory`].
#[test]
fn out_of_memory() {
    run_alone(|ctx: &mut UserCtx<'_>| {
        let mut addr = 0x1000_0000;
        let err = loop {
            match ctx.sys_page_alloc(EnvId::CURRENT, va(addr), UW) {
                Ok(()) => addr += PGSIZE,
                Err(e) => break e,
            }
        };
        assert_eq!(err, KernelError::NoMemory);
        assert!(addr > 0x1000_0000);
        Ok(0)
    });
}
