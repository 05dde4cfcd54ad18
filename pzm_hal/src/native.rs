//! Native adapter over the soemshim library.
//!
//! Thin FFI binding to the C shim that owns the raw-socket bus session.
//! All unsafe code is confined to this module; the rest of the workspace
//! only sees the [`BusAdapter`] trait.
//!
//! The shim's handle is not thread-safe. `SoemAdapter` is `Send` but not
//! `Sync`, and the orchestrator drives it from a single loop thread.

use std::ffi::{c_char, c_int, c_void, CStr, CString};

use pzm_common::frames::{RxFrame, TxFrame, RX_FRAME_WIRE_BYTES, TX_FRAME_WIRE_BYTES};
use pzm_common::health::{HealthSnapshot, ERR_BAD_ARGS};
use tracing::warn;

use crate::adapter::{BusAdapter, HalError};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SoemHealthRaw {
    slaves_found: c_int,
    group_expected_wkc: c_int,
    last_wkc: c_int,
    bytes_out: c_int,
    bytes_in: c_int,
    slaves_op: c_int,
    al_status_code: u32,
}

#[link(name = "soemshim")]
extern "C" {
    fn soem_initialize(ifname: *const c_char) -> *mut c_void;
    fn soem_shutdown(handle: *mut c_void);
    fn soem_get_slave_count(handle: *mut c_void) -> c_int;
    fn soem_write_rxpdo(handle: *mut c_void, slave_index: c_int, frame: *const u8) -> c_int;
    fn soem_read_txpdo(handle: *mut c_void, slave_index: c_int, out: *mut u8) -> c_int;
    fn soem_exchange_process_data(
        handle: *mut c_void,
        outputs: *const u8,
        outputs_len: c_int,
        inputs: *mut u8,
        inputs_len: c_int,
        timeout_us: c_int,
    ) -> c_int;
    fn soem_try_recover(handle: *mut c_void, timeout_ms: c_int) -> c_int;
    fn soem_drain_error_list(handle: *mut c_void, buf: *mut c_char, buf_sz: c_int) -> c_int;
    fn soem_get_health(handle: *mut c_void, out: *mut SoemHealthRaw) -> c_int;
}

const ERROR_DRAIN_BUF: usize = 2048;

/// Native bus adapter backed by the soemshim library.
pub struct SoemAdapter {
    handle: *mut c_void,
    slave_count: usize,
}

// The shim handle is only ever touched by the thread owning the adapter;
// the orchestrator serializes all access through its loop worker.
unsafe impl Send for SoemAdapter {}

impl SoemAdapter {
    /// A closed adapter; call [`BusAdapter::open`] to bring up the bus.
    pub fn new() -> Self {
        Self {
            handle: std::ptr::null_mut(),
            slave_count: 0,
        }
    }

    fn check_slave(&self, slave: u16) -> Result<c_int, HalError> {
        if self.handle.is_null() {
            return Err(HalError::NotOpen);
        }
        let index = usize::from(slave);
        if index == 0 || index > self.slave_count {
            return Err(HalError::InvalidSlave {
                slave,
                count: self.slave_count,
            });
        }
        Ok(index as c_int)
    }
}

impl Default for SoemAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BusAdapter for SoemAdapter {
    fn open(&mut self, interface: &str) -> Result<(), HalError> {
        if !self.handle.is_null() {
            return Err(HalError::InitFailed("adapter already open".to_string()));
        }
        let ifname = CString::new(interface)
            .map_err(|_| HalError::InitFailed("interface name contains NUL".to_string()))?;
        let handle = unsafe { soem_initialize(ifname.as_ptr()) };
        if handle.is_null() {
            return Err(HalError::InitFailed(format!(
                "soem_initialize failed on {interface}"
            )));
        }
        self.handle = handle;
        self.slave_count = unsafe { soem_get_slave_count(handle) }.max(0) as usize;
        Ok(())
    }

    fn close(&mut self) {
        if !self.handle.is_null() {
            unsafe { soem_shutdown(self.handle) };
            self.handle = std::ptr::null_mut();
            self.slave_count = 0;
        }
    }

    fn is_open(&self) -> bool {
        !self.handle.is_null()
    }

    fn slave_count(&self) -> usize {
        self.slave_count
    }

    fn write_rx(&mut self, slave: u16, frame: &RxFrame) -> Result<(), HalError> {
        let index = self.check_slave(slave)?;
        let wire: [u8; RX_FRAME_WIRE_BYTES] = frame.encode();
        let rc = unsafe { soem_write_rxpdo(self.handle, index, wire.as_ptr()) };
        if rc <= 0 {
            return Err(HalError::CommunicationError(format!(
                "soem_write_rxpdo({slave}) returned {rc}"
            )));
        }
        Ok(())
    }

    fn read_tx(&mut self, slave: u16) -> Result<TxFrame, HalError> {
        let index = self.check_slave(slave)?;
        let mut wire = [0u8; TX_FRAME_WIRE_BYTES];
        let rc = unsafe { soem_read_txpdo(self.handle, index, wire.as_mut_ptr()) };
        if rc <= 0 {
            return Err(HalError::CommunicationError(format!(
                "soem_read_txpdo({slave}) returned {rc}"
            )));
        }
        Ok(TxFrame::decode(&wire))
    }

    fn exchange(&mut self, timeout_us: u32) -> i32 {
        if self.handle.is_null() {
            return ERR_BAD_ARGS;
        }
        // Per-slave staging went through write_rx; the shim already holds
        // the output image, so no extra buffers are passed here.
        unsafe {
            soem_exchange_process_data(
                self.handle,
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
                0,
                timeout_us as c_int,
            )
        }
    }

    fn health(&mut self) -> HealthSnapshot {
        let mut raw = SoemHealthRaw::default();
        if !self.handle.is_null() {
            let rc = unsafe { soem_get_health(self.handle, &mut raw) };
            if rc <= 0 {
                warn!("soem_get_health returned {rc}");
            }
        }
        HealthSnapshot {
            slaves_found: raw.slaves_found,
            group_expected_wkc: raw.group_expected_wkc,
            last_wkc: raw.last_wkc,
            bytes_out: raw.bytes_out,
            bytes_in: raw.bytes_in,
            slaves_operational: raw.slaves_op,
            al_status_code: raw.al_status_code,
        }
    }

    fn recover(&mut self, timeout_ms: u32) -> i32 {
        if self.handle.is_null() {
            return 0;
        }
        unsafe { soem_try_recover(self.handle, timeout_ms as c_int) }
    }

    fn drain_errors(&mut self) -> String {
        if self.handle.is_null() {
            return String::new();
        }
        let mut buf = [0 as c_char; ERROR_DRAIN_BUF];
        let rc = unsafe { soem_drain_error_list(self.handle, buf.as_mut_ptr(), buf.len() as c_int) };
        if rc <= 0 {
            return String::new();
        }
        unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for SoemAdapter {
    fn drop(&mut self) {
        self.close();
    }
}
