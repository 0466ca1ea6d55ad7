use crate::arch::RegisterState;
use crate::error::CaptureError;
use crate::thread::{ThreadHandle, ThreadList};
use mach2::kern_return::{KERN_SUCCESS, kern_return_t};
use mach2::mach_port::mach_port_deallocate;
use mach2::mach_types::{thread_act_array_t, thread_act_t};
use mach2::message::mach_msg_type_number_t;
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_deallocate, mach_vm_read_overwrite};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

fn check(call: &'static str, code: kern_return_t) -> Result<(), CaptureError> {
    if code == KERN_SUCCESS {
        Ok(())
    } else {
        Err(CaptureError::Kernel { call, code })
    }
}

/// The port name is looked up without taking a new send right, so there is
/// nothing to release.
pub(crate) fn current_thread() -> ThreadHandle {
    let port = unsafe { libc::pthread_mach_thread_np(libc::pthread_self()) };
    ThreadHandle::from_raw(u64::from(port))
}

/// Drops the send right `task_threads` handed us for this port.
pub(crate) fn release_thread(thread: ThreadHandle) {
    let Ok(port) = thread_act_t::try_from(thread.as_raw()) else {
        return;
    };
    unsafe {
        mach_port_deallocate(mach_task_self(), port);
    }
}

pub(crate) fn enumerate_threads<const CAP: usize>(
    list: &mut ThreadList<CAP>,
) -> Result<(), CaptureError> {
    let mut threads: thread_act_array_t = std::ptr::null_mut();
    let mut count: mach_msg_type_number_t = 0;
    check("task_threads", unsafe {
        mach2::task::task_threads(mach_task_self(), &mut threads, &mut count)
    })?;
    if threads.is_null() {
        return Ok(());
    }

    let ports = unsafe { std::slice::from_raw_parts(threads, count as usize) };
    for &port in ports {
        if !list.push(ThreadHandle::from_raw(u64::from(port))) {
            unsafe {
                mach_port_deallocate(mach_task_self(), port);
            }
        }
    }

    let size = (count as usize).saturating_mul(std::mem::size_of::<thread_act_t>());
    unsafe {
        mach_vm_deallocate(
            mach_task_self(),
            threads as mach_vm_address_t,
            size as mach_vm_size_t,
        );
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn thread_state(thread: ThreadHandle) -> Result<RegisterState, CaptureError> {
    let port = thread_act_t::try_from(thread.as_raw()).map_err(|_| CaptureError::Kernel {
        call: "thread_get_state",
        code: mach2::kern_return::KERN_INVALID_ARGUMENT,
    })?;
    let mut state = mach2::structs::x86_thread_state64_t::new();
    let mut count = mach2::structs::x86_thread_state64_t::count();
    check("thread_get_state", unsafe {
        mach2::thread_act::thread_get_state(
            port,
            mach2::thread_status::x86_THREAD_STATE64,
            (&mut state) as *mut _ as *mut _,
            &mut count,
        )
    })?;
    Ok(RegisterState {
        rip: state.__rip as usize,
        rbp: state.__rbp as usize,
        rsp: state.__rsp as usize,
    })
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn thread_state(thread: ThreadHandle) -> Result<RegisterState, CaptureError> {
    let port = thread_act_t::try_from(thread.as_raw()).map_err(|_| CaptureError::Kernel {
        call: "thread_get_state",
        code: mach2::kern_return::KERN_INVALID_ARGUMENT,
    })?;
    let mut state = mach2::structs::arm_thread_state64_t::new();
    let mut count = mach2::structs::arm_thread_state64_t::count();
    check("thread_get_state", unsafe {
        mach2::thread_act::thread_get_state(
            port,
            mach2::thread_status::ARM_THREAD_STATE64,
            (&mut state) as *mut _ as *mut _,
            &mut count,
        )
    })?;
    Ok(RegisterState {
        pc: state.__pc as usize,
        fp: state.__fp as usize,
        lr: state.__lr as usize,
        sp: state.__sp as usize,
    })
}

/// `thread_get_state` needs no setup on macOS.
pub(crate) fn install_sampler() -> Result<(), CaptureError> {
    Ok(())
}

pub(crate) fn copy_memory(src: usize, dst: &mut [u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let mut copied: mach_vm_size_t = 0;
    let code = unsafe {
        mach_vm_read_overwrite(
            mach_task_self(),
            src as mach_vm_address_t,
            dst.len() as mach_vm_size_t,
            dst.as_mut_ptr() as mach_vm_address_t,
            &mut copied,
        )
    };
    if code != KERN_SUCCESS {
        return 0;
    }
    copied as usize
}
