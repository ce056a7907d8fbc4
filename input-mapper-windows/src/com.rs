//! COM apartment setup shared by the enumerator and the capture thread.

use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::*;

use input_mapper_core::models::error::CaptureError;

/// Calls `CoUninitialize` on drop if this guard initialized COM.
pub(crate) struct ComGuard {
    owned: bool,
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

/// Join the multithreaded apartment on the calling thread.
///
/// A thread already in a single-threaded apartment keeps it; COM calls
/// still work there and the guard leaves that apartment alone.
pub(crate) fn initialize_mta() -> Result<ComGuard, CaptureError> {
    let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if hr == RPC_E_CHANGED_MODE {
        return Ok(ComGuard { owned: false });
    }
    hr.ok()
        .map_err(|e| CaptureError::Platform(format!("CoInitializeEx failed: {}", e)))?;
    Ok(ComGuard { owned: true })
}
