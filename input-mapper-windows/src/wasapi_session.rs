//! WASAPI microphone capture session.
//!
//! Captures audio from a WASAPI capture endpoint in shared mode and delivers
//! Float32 buffers through the session's [`RawFrameCallback`]. Buffers that
//! follow an overrun carry the discontinuity flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use windows::core::{Error, Interface, PCWSTR};
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;
use windows::Win32::System::Threading::*;

use input_mapper_core::models::device::DeviceDescriptor;
use input_mapper_core::models::error::CaptureError;
use input_mapper_core::models::frame::RawBuffer;
use input_mapper_core::traits::device_session::{DeviceSession, RawFrameCallback, SessionOptions};

use crate::com;

/// Shared-mode buffer duration in 100-nanosecond units (100ms).
const BUFFER_DURATION: i64 = 1_000_000;
const PACKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Capture {
    running: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

enum Slot {
    Closed,
    /// `open` is waiting for the capture thread to start. `close` clears
    /// the flag and leaves; `open` notices and shuts the thread down.
    Opening(Arc<AtomicBool>),
    Open(Capture),
}

/// WASAPI capture session.
///
/// `open` spawns a `wasapi-capture` thread registered with MMCSS, waits until
/// the stream has started, and returns. `close` stops and joins the thread.
pub struct WasapiDeviceSession {
    callback: Mutex<Option<RawFrameCallback>>,
    slot: Mutex<Slot>,
}

impl WasapiDeviceSession {
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            slot: Mutex::new(Slot::Closed),
        }
    }

    fn release_opening(&self, running: &Arc<AtomicBool>) {
        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Opening(flag) if Arc::ptr_eq(flag, running)) {
            *slot = Slot::Closed;
        }
    }
}

impl Default for WasapiDeviceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession for WasapiDeviceSession {
    fn on_frame(&self, callback: RawFrameCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn open(&self, descriptor: &DeviceDescriptor, options: &SessionOptions) -> Result<(), CaptureError> {
        let callback = self
            .callback
            .lock()
            .clone()
            .ok_or_else(|| CaptureError::StartFailed("no frame callback installed".into()))?;

        let running = Arc::new(AtomicBool::new(true));
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Closed) {
                return Err(CaptureError::StartFailed("capture session already open".into()));
            }
            *slot = Slot::Opening(Arc::clone(&running));
        }

        let thread_running = Arc::clone(&running);
        let device_id = descriptor.id.clone();
        let options = *options;
        let (ready_tx, ready_rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("wasapi-capture".into())
            .spawn(move || capture_thread(thread_running, device_id, options, callback, ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.release_opening(&running);
                return Err(CaptureError::StartFailed(format!("failed to spawn capture thread: {}", e)));
            }
        };

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::StartFailed("capture thread exited during startup".into())));

        let mut slot = self.slot.lock();
        let still_ours = matches!(&*slot, Slot::Opening(flag) if Arc::ptr_eq(flag, &running))
            && running.load(Ordering::SeqCst);
        let outcome = match started {
            Ok(()) if still_ours => {
                *slot = Slot::Open(Capture { running, handle });
                log::debug!("WASAPI capture open on {}", descriptor);
                return Ok(());
            }
            Ok(()) => Err(CaptureError::StartFailed("session closed while opening".into())),
            Err(e) => Err(e),
        };
        if still_ours {
            *slot = Slot::Closed;
        }
        drop(slot);

        running.store(false, Ordering::SeqCst);
        let _ = handle.join();
        outcome
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Closed);
        match previous {
            Slot::Closed => {}
            Slot::Opening(running) => {
                running.store(false, Ordering::SeqCst);
                log::debug!("WASAPI capture closed while opening");
            }
            Slot::Open(capture) => {
                capture.running.store(false, Ordering::SeqCst);
                if capture.handle.join().is_err() {
                    log::error!("WASAPI capture thread panicked");
                }
                log::debug!("WASAPI capture closed");
            }
        }
    }
}

impl Drop for WasapiDeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// An initialized, started shared-mode capture stream.
struct CaptureStream {
    audio_client: IAudioClient,
    capture_client: IAudioCaptureClient,
    sample_rate: u32,
    channels: u16,
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        unsafe {
            let _ = self.audio_client.Stop();
        }
    }
}

fn capture_thread(
    running: Arc<AtomicBool>,
    device_id: String,
    options: SessionOptions,
    callback: RawFrameCallback,
    ready: mpsc::Sender<Result<(), CaptureError>>,
) {
    let _com = match com::initialize_mta() {
        Ok(guard) => guard,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let stream = match unsafe { start_stream(&device_id, options) } {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    if let Err(e) = unsafe { pump(&stream, &running, &callback) } {
        log::error!("Mic capture error: {}", e);
    }
}

/// Open `device_id` and start it.
///
/// Sequence:
/// 1. Get the endpoint by ID
/// 2. Activate IAudioClient
/// 3. Tag the stream as communications when voice processing is requested
/// 4. Initialize in shared mode with the mix format
/// 5. Get IAudioCaptureClient service
/// 6. Register with MMCSS for real-time priority
/// 7. Start capture
unsafe fn start_stream(device_id: &str, options: SessionOptions) -> Result<CaptureStream, CaptureError> {
    let enumerator: IMMDeviceEnumerator = CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
        .map_err(|e| CaptureError::Platform(format!("failed to create enumerator: {}", e)))?;

    let wide_id: Vec<u16> = device_id.encode_utf16().chain(std::iter::once(0)).collect();
    let device = enumerator
        .GetDevice(PCWSTR(wide_id.as_ptr()))
        .map_err(|_| CaptureError::DeviceUnavailable)?;

    let audio_client: IAudioClient = device
        .Activate(CLSCTX_ALL, None)
        .map_err(|e| stream_error("Activate", e))?;

    if options.voice_processing {
        request_communications_category(&audio_client);
    }

    let mix_format_ptr = audio_client
        .GetMixFormat()
        .map_err(|e| stream_error("GetMixFormat", e))?;
    let mix_format = &*mix_format_ptr;
    let sample_rate = mix_format.nSamplesPerSec;
    let channels = mix_format.nChannels;
    let bits_per_sample = mix_format.wBitsPerSample;

    let initialized = if bits_per_sample == 32 {
        audio_client
            .Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_NOPERSIST,
                BUFFER_DURATION,
                0,
                mix_format,
                None,
            )
            .map_err(|e| stream_error("IAudioClient::Initialize", e))
    } else {
        Err(CaptureError::StartFailed(format!(
            "unsupported mix format: {} bits per sample",
            bits_per_sample
        )))
    };
    CoTaskMemFree(Some(mix_format_ptr as *const _));
    initialized?;

    let capture_client: IAudioCaptureClient = audio_client
        .GetService()
        .map_err(|e| stream_error("GetService", e))?;

    let mut task_index: u32 = 0;
    let task_name: Vec<u16> = "Pro Audio\0".encode_utf16().collect();
    if AvSetMmThreadCharacteristicsW(PCWSTR(task_name.as_ptr()), &mut task_index).is_err() {
        log::debug!("MMCSS registration failed, capturing at normal priority");
    }

    audio_client
        .Start()
        .map_err(|e| stream_error("IAudioClient::Start", e))?;

    Ok(CaptureStream {
        audio_client,
        capture_client,
        sample_rate,
        channels,
    })
}

/// Ask the audio engine to apply its communications processing chain.
unsafe fn request_communications_category(audio_client: &IAudioClient) {
    let Ok(client2) = audio_client.cast::<IAudioClient2>() else {
        log::warn!("IAudioClient2 unavailable, voice processing not applied");
        return;
    };
    let properties = AudioClientProperties {
        cbSize: std::mem::size_of::<AudioClientProperties>() as u32,
        eCategory: AudioCategory_Communications,
        ..Default::default()
    };
    if let Err(e) = client2.SetClientProperties(&properties) {
        log::warn!("Failed to request communications processing: {}", e);
    }
}

/// Poll the capture client until `running` clears or the stream fails.
unsafe fn pump(
    stream: &CaptureStream,
    running: &AtomicBool,
    callback: &RawFrameCallback,
) -> Result<(), CaptureError> {
    let channels = stream.channels.max(1) as usize;
    let mut silence: Vec<f32> = Vec::new();
    // The first packet after Start is often flagged; nothing was lost yet.
    let mut primed = false;

    while running.load(Ordering::SeqCst) {
        thread::sleep(PACKET_POLL_INTERVAL);

        let mut packet_length = stream
            .capture_client
            .GetNextPacketSize()
            .map_err(|e| stream_error("GetNextPacketSize", e))?;

        while packet_length > 0 {
            let mut buffer_ptr: *mut u8 = std::ptr::null_mut();
            let mut num_frames: u32 = 0;
            let mut flags: u32 = 0;
            // Stream position in frames; keeps counting across lost audio.
            let mut device_position: u64 = 0;

            stream
                .capture_client
                .GetBuffer(
                    &mut buffer_ptr,
                    &mut num_frames,
                    &mut flags,
                    Some(&mut device_position as *mut u64),
                    None,
                )
                .map_err(|e| stream_error("GetBuffer", e))?;

            if num_frames > 0 && !buffer_ptr.is_null() {
                let total_samples = num_frames as usize * channels;
                let timestamp = Duration::from_secs_f64(device_position as f64 / stream.sample_rate.max(1) as f64);

                let discontinuity = primed && flags & (AUDCLNT_BUFFERFLAGS_DATA_DISCONTINUITY.0 as u32) != 0;
                primed = true;
                let samples = if flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0 {
                    silence.clear();
                    silence.resize(total_samples, 0.0);
                    &silence[..]
                } else {
                    // Shared mode delivers the 32-bit float mix format.
                    std::slice::from_raw_parts(buffer_ptr as *const f32, total_samples)
                };

                callback(RawBuffer {
                    samples,
                    sample_rate: stream.sample_rate,
                    channels: stream.channels,
                    timestamp,
                    discontinuity,
                });
            }

            stream
                .capture_client
                .ReleaseBuffer(num_frames)
                .map_err(|e| stream_error("ReleaseBuffer", e))?;

            packet_length = stream
                .capture_client
                .GetNextPacketSize()
                .map_err(|e| stream_error("GetNextPacketSize", e))?;
        }
    }
    Ok(())
}

fn stream_error(call: &str, e: Error) -> CaptureError {
    let code = e.code();
    if code == AUDCLNT_E_DEVICE_IN_USE {
        CaptureError::DeviceBusy
    } else if code == AUDCLNT_E_DEVICE_INVALIDATED {
        CaptureError::DeviceUnavailable
    } else {
        CaptureError::StartFailed(format!("{} failed: {}", call, e))
    }
}
