// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Images and drivers shared by the kernel's tests.

use core::cell::{Cell, RefCell};
use std::vec::Vec;

use abi::ReturnCode;
use tbf::{
    DriverPermission, FixedAddresses, MainTlv, TbfFlags, TbfHeader, Tlv,
    WriteableFlashRegion, MAX_TLVS, UNCONSTRAINED_ADDRESS,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::deferred::{DeferredCall, DeferredCallClient};
use crate::driver::{Context, Driver};
use crate::grant::{Grant, GrantError};
use crate::process::ProcessId;
use crate::umem::AppSlice;

pub(crate) const FLASH_BASE: u32 = 0x0003_0000;
pub(crate) const RAM_BASE: u32 = 0x2000_0000;

/// Offset of the first instruction after the header.
pub(crate) const INIT_OFFSET: u32 = 0x21;
pub(crate) const PROTECTED_SIZE: u32 = 0x20;

/// Description of a test image.
#[derive(Clone, Debug)]
pub(crate) struct AppSpec {
    name: &'static str,
    total_size: u32,
    min_ram: u32,
    flags: TbfFlags,
    main: bool,
    fixed: Option<FixedAddresses>,
    permissions: Vec<DriverPermission>,
    writeable: Vec<WriteableFlashRegion>,
}

impl AppSpec {
    pub(crate) fn new(name: &'static str, total_size: u32, min_ram: u32) -> Self {
        Self {
            name,
            total_size,
            min_ram,
            flags: TbfFlags::ENABLED,
            main: true,
            fixed: None,
            permissions: Vec::new(),
            writeable: Vec::new(),
        }
    }

    pub(crate) fn disabled(mut self) -> Self {
        self.flags.remove(TbfFlags::ENABLED);
        self
    }

    pub(crate) fn no_main(mut self) -> Self {
        self.main = false;
        self
    }

    fn fixed_mut(&mut self) -> &mut FixedAddresses {
        self.fixed.get_or_insert(FixedAddresses {
            ram: UNCONSTRAINED_ADDRESS,
            flash: UNCONSTRAINED_ADDRESS,
        })
    }

    pub(crate) fn fixed_ram(mut self, addr: u32) -> Self {
        self.fixed_mut().ram = addr;
        self
    }

    pub(crate) fn fixed_flash(mut self, addr: u32) -> Self {
        self.fixed_mut().flash = addr;
        self
    }

    pub(crate) fn permit(mut self, driver_number: u32, offset: u32, mask: u64) -> Self {
        self.permissions.push(DriverPermission {
            driver_number,
            offset,
            allowed_commands: mask,
        });
        self
    }

    pub(crate) fn writeable(mut self, offset: u32, size: u32) -> Self {
        self.writeable.push(WriteableFlashRegion { offset, size });
        self
    }

    pub(crate) fn build_header(&self) -> TbfHeader<'static> {
        let mut tlvs = heapless::Vec::<Tlv<'static>, MAX_TLVS>::new();
        if self.main {
            tlvs.push(Tlv::Main(MainTlv {
                init_fn_offset: INIT_OFFSET,
                protected_size: PROTECTED_SIZE,
                minimum_ram_size: self.min_ram,
            }))
            .unwrap();
        }
        tlvs.push(Tlv::PackageName(self.name)).unwrap();
        if let Some(fixed) = self.fixed {
            tlvs.push(Tlv::FixedAddresses(fixed)).unwrap();
        }
        if !self.writeable.is_empty() {
            tlvs.push(Tlv::WriteableFlashRegions(
                heapless::Vec::from_slice(&self.writeable).unwrap(),
            ))
            .unwrap();
        }
        if !self.permissions.is_empty() {
            tlvs.push(Tlv::Permissions(
                heapless::Vec::from_slice(&self.permissions).unwrap(),
            ))
            .unwrap();
        }
        TbfHeader::build(self.total_size, self.flags, tlvs).unwrap()
    }

    /// The whole image: header, then zeroes up to `total_size`.
    pub(crate) fn build(&self) -> Vec<u8> {
        let mut image = vec![0; self.total_size as usize];
        self.build_header().write_to(&mut image).unwrap();
        image
    }
}

/// A base header with zero total size: "no more images".
pub(crate) fn end_marker() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&tbf::SUPPORTED_VERSION.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(&[0; 12]);
    out
}

/// Test driver.
///
/// Tests register it as driver 7.
///
/// - Subscribe numbers 0-3 are valid, and accepted ones are recorded.
/// - Command 0 always succeeds. Command 1 schedules a callback on the caller's
///   subscription 0 with `[arg, 0, 0]`. Command 2 answers `arg + 1`.
///   Command 3 sets the deferred call, if one is attached. Command 4 copies
///   the caller's last allowed buffer into `seen`.
/// - Allow records the buffer and fills it with `0x5A`.
#[derive(Default)]
pub(crate) struct TestDriver {
    pub subscribed: RefCell<Vec<(ProcessId, u32)>>,
    pub commands: RefCell<Vec<(ProcessId, u32, u32)>>,
    pub allowed: RefCell<Vec<(ProcessId, u32, Option<AppSlice>)>>,
    pub seen: RefCell<Vec<u8>>,
    pub deferred: Cell<Option<DeferredCall>>,
    pub deferred_runs: Cell<u32>,
}

impl Driver for TestDriver {
    fn subscribe(
        &self,
        _ctx: &mut Context<'_, '_>,
        caller: ProcessId,
        subscribe_num: u32,
    ) -> Result<(), ReturnCode> {
        if subscribe_num < 4 {
            self.subscribed.borrow_mut().push((caller, subscribe_num));
            Ok(())
        } else {
            Err(ReturnCode::EINVAL)
        }
    }

    fn command(
        &self,
        ctx: &mut Context<'_, '_>,
        caller: ProcessId,
        command_num: u32,
        arg: u32,
    ) -> ReturnCode {
        self.commands.borrow_mut().push((caller, command_num, arg));
        match command_num {
            0 => ReturnCode::SUCCESS,
            1 => match ctx.schedule_callback(caller, 7, 0, [arg, 0, 0]) {
                Ok(()) => ReturnCode::SUCCESS,
                Err(_) => ReturnCode::EBUSY,
            },
            2 => ReturnCode::SuccessWithValue { value: arg + 1 },
            3 => match self.deferred.get() {
                Some(call) => {
                    ctx.set_deferred(&call);
                    ReturnCode::SUCCESS
                }
                None => ReturnCode::FAIL,
            },
            4 => {
                let last = self
                    .allowed
                    .borrow()
                    .iter()
                    .rev()
                    .find(|(p, _, _)| *p == caller)
                    .and_then(|(_, _, s)| *s);
                let Some(slice) = last else {
                    return ReturnCode::ERESERVE;
                };
                match ctx.with_app_slice(&slice, |bytes| bytes.to_vec()) {
                    Ok(bytes) => {
                        *self.seen.borrow_mut() = bytes;
                        ReturnCode::SUCCESS
                    }
                    Err(_) => ReturnCode::ECANCEL,
                }
            }
            _ => ReturnCode::ENOSUPPORT,
        }
    }

    fn allow(
        &self,
        ctx: &mut Context<'_, '_>,
        caller: ProcessId,
        allow_num: u32,
        slice: Option<AppSlice>,
    ) -> ReturnCode {
        self.allowed.borrow_mut().push((caller, allow_num, slice));
        if let Some(slice) = slice {
            if ctx.with_app_slice(&slice, |bytes| bytes.fill(0x5A)).is_err() {
                return ReturnCode::FAIL;
            }
        }
        ReturnCode::SUCCESS
    }
}

impl DeferredCallClient for TestDriver {
    fn handle_deferred_call(&self, _ctx: &mut Context<'_, '_>) {
        self.deferred_runs.set(self.deferred_runs.get() + 1);
    }
}

/// Per-process grant data for [`CounterDriver`].
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct Tally {
    pub count: u32,
    pub last_arg: u32,
}

/// Driver that keeps a per-process tally in a grant.
///
/// Command 1 bumps the caller's tally and returns the new count, or
/// `ENOMEM` if the grant can't be allocated.
pub(crate) struct CounterDriver {
    pub grant: Grant<Tally>,
}

impl Driver for CounterDriver {
    fn command(
        &self,
        ctx: &mut Context<'_, '_>,
        caller: ProcessId,
        command_num: u32,
        arg: u32,
    ) -> ReturnCode {
        match command_num {
            0 => ReturnCode::SUCCESS,
            1 => {
                let tally = match self.grant.allocate(ctx, caller, Tally::default) {
                    Ok(tally) => tally,
                    Err(GrantError::AllocationFailed) => return ReturnCode::ENOMEM,
                    Err(GrantError::NoSuchGrant) => return ReturnCode::FAIL,
                };
                let count = tally.enter(ctx, |t| {
                    t.count += 1;
                    t.last_arg = arg;
                    t.count
                });
                match count {
                    Ok(value) => ReturnCode::SuccessWithValue { value },
                    Err(_) => ReturnCode::FAIL,
                }
            }
            _ => ReturnCode::ENOSUPPORT,
        }
    }
}

/// Grant type too large to fit in a small grant region.
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct Bulky {
    pub bytes: [u8; 0x200],
}
